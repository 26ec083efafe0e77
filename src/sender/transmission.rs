use crate::reliability::{DropReason, Retryable};
use std::time::Duration;
use thiserror::Error;
use tonic::Code;

#[derive(Error, Debug, Clone)]
pub enum ExportError {
    #[error("Invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("Downstream returned {}: {}", .0.code(), .0.message())]
    Status(tonic::Status),
    #[error("Export timed out after {0:?}")]
    Timeout(Duration),
    #[error("Output {0} is not ready")]
    NotReady(String),
}

impl ExportError {
    /// gRPC code the failure maps to. An elapsed request timeout counts as
    /// `DEADLINE_EXCEEDED`.
    pub fn code(&self) -> Code {
        match self {
            ExportError::InvalidEndpoint { .. } => Code::InvalidArgument,
            ExportError::Status(status) => status.code(),
            ExportError::Timeout(_) => Code::DeadlineExceeded,
            ExportError::NotReady(_) => Code::FailedPrecondition,
        }
    }
}

impl Retryable for ExportError {
    fn is_transient(&self) -> bool {
        matches!(self.code(), Code::Unavailable | Code::DeadlineExceeded)
    }
}

/// How a single output processor finished with a batch. Every variant means
/// the batch is consumed.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Delivered {
        records: usize,
        undecodable: usize,
        attempts: u32,
    },
    Dropped {
        records: usize,
        undecodable: usize,
        attempts: u32,
        reason: DropReason,
        error: ExportError,
    },
    /// No record in the batch decoded, so nothing was sent.
    NothingToSend { undecodable: usize },
    NotReady,
}

impl ProcessOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ProcessOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ProcessOutcome::Delivered { attempts, .. } | ProcessOutcome::Dropped { attempts, .. } => {
                *attempts
            }
            ProcessOutcome::NothingToSend { .. } | ProcessOutcome::NotReady => 0,
        }
    }
}
