pub mod metrics;
pub mod retry;

pub use metrics::{DropReason, MetricsError, MetricsSnapshot, PipelineMetrics, RejectReason};
pub use retry::{Attempted, RetryError, RetryFailure, RetryPolicy, Retryable};
