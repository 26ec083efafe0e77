use std::fmt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupt,
    Terminate,
    /// Shutdown was requested in-process through the cancellation token.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownReason::Interrupt => "SIGINT",
            ShutdownReason::Terminate => "SIGTERM",
            ShutdownReason::Requested => "request",
        };
        f.write_str(name)
    }
}

/// Wait for SIGINT or SIGTERM. A handler that cannot be installed never fires.
pub async fn shutdown_signal() -> ShutdownReason {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => ShutdownReason::Interrupt,
        () = terminate => ShutdownReason::Terminate,
    }
}

/// Wait for an OS signal or for `token` to be cancelled, whichever is first.
pub async fn wait_for_shutdown(token: &CancellationToken) -> ShutdownReason {
    let reason = tokio::select! {
        reason = shutdown_signal() => reason,
        () = token.cancelled() => ShutdownReason::Requested,
    };
    info!(reason = %reason, "Initiating graceful shutdown");
    reason
}
