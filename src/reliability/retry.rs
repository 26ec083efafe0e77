use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Invalid retry configuration: {0}")]
    InvalidConfig(String),
}

/// Failures that know whether another attempt can help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Fixed-delay retry with a bounded number of attempts.
///
/// `max_retries = N` allows `N + 1` attempts in total. Only transient
/// failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(1000),
        }
    }
}

/// Value produced by a successful attempt.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Last error once retrying stopped.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// True when the failure was transient and the attempts ran out.
    pub exhausted: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Result<Self, RetryError> {
        if max_retries == u32::MAX {
            return Err(RetryError::InvalidConfig(
                "max_retries leaves no room for the first attempt".to_string(),
            ));
        }
        Ok(Self { max_retries, delay })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn should_retry<E: Retryable>(&self, attempt: u32, error: &E) -> bool {
        error.is_transient() && attempt < self.max_attempts()
    }

    /// Run `operation` until it succeeds, fails permanently or the attempts
    /// run out. The closure receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<Attempted<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(error) if self.should_retry(attempt, &error) => {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = self.delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    let exhausted = error.is_transient();
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                        exhausted,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Failure(bool);

    impl Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "transient={}", self.0)
        }
    }

    impl Retryable for Failure {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(5)).unwrap()
    }

    #[tokio::test]
    async fn test_transient_failures_use_every_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<Attempted<()>, _> = policy(3)
            .execute(|_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure(true)) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.attempts, 4);
        assert!(failure.exhausted);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<Attempted<()>, _> = policy(5)
            .execute(|_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure(false)) }
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!failure.exhausted);
    }

    #[tokio::test]
    async fn test_success_after_transient_failure() {
        let result = policy(2)
            .execute(|attempt| async move {
                if attempt < 2 {
                    Err(Failure(true))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 20);
        assert_eq!(result.attempts, 2);
    }

    #[test]
    fn test_first_success_makes_one_attempt() {
        let result = tokio_test::block_on(
            policy(3).execute(|attempt| async move { Ok::<_, Failure>(attempt) }),
        );
        let attempted = tokio_test::assert_ok!(result);
        assert_eq!(attempted.attempts, 1);
    }

    #[test]
    fn test_zero_retries_means_one_attempt() {
        assert_eq!(policy(0).max_attempts(), 1);
        assert!(!policy(0).should_retry(1, &Failure(true)));
        assert!(RetryPolicy::new(u32::MAX, Duration::ZERO).is_err());
    }
}
