use crate::domain::TelemetryClass;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Deserialization error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Corrupt frame in segment {segment} at offset {offset}: {reason}")]
    Corrupt {
        segment: String,
        offset: u64,
        reason: String,
    },

    #[error("Record of {size} bytes exceeds the frame limit of {limit} bytes")]
    RecordTooLarge { size: usize, limit: usize },

    #[error("Record of class {actual} appended to the {expected} queue")]
    ClassMismatch {
        expected: TelemetryClass,
        actual: TelemetryClass,
    },

    #[error("Queue is closed")]
    Closed,

    #[error("Cursor file {path} is unreadable: {reason}")]
    Cursor { path: PathBuf, reason: String },

    #[error("Invalid queue directory: {0}")]
    InvalidPath(String),
}

impl QueueError {
    /// Every queue failure is a durability failure for the caller. Only a
    /// closed queue is expected during normal operation (shutdown).
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }
}
