pub mod manager;
pub mod otlp;
pub mod transmission;
pub mod transport;

pub use manager::OutputManager;
pub use otlp::{OTLP_GRPC_OUTPUT, OtlpGrpcOutput, OtlpOutputConfig};
pub use transmission::{ExportError, ProcessOutcome};
pub use transport::{DEFAULT_OTLP_GRPC_PORT, ExportTransport, GrpcTransport, resolve_endpoint};

use crate::buffer::Batch;
use async_trait::async_trait;

/// A destination for drained batches.
///
/// `process` completes once the batch is finished with: delivered, dropped
/// or skipped. It never fails, and the caller treats every outcome as
/// consumed.
#[async_trait]
pub trait OutputProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn is_ready(&self) -> bool;
    async fn initialize(&self) -> Result<(), ExportError>;
    async fn shutdown(&self);
    async fn process(&self, batch: &Batch) -> ProcessOutcome;
}
