//! Ingest side of the pipeline.
//!
//! Supports:
//! - OTLP gRPC `TraceService/Export` and `MetricsService/Export`
//! - POST /v1/traces and POST /v1/metrics (OTLP HTTP/protobuf)
//!
//! Both transports share [`TelemetryIngestor`], which splits a request into
//! resource-scoped records and appends each one to its class queue.

pub mod grpc;
pub mod http;

pub use grpc::OtlpGrpcReceiver;
pub use http::{OtlpHttpState, otlp_routes};

use crate::buffer::{QueueError, QueueSet};
use crate::domain::{TelemetryClass, TelemetryRecord};
use crate::reliability::{PipelineMetrics, RejectReason};
use axum::http::StatusCode;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use prost::Message;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Empty request")]
    EmptyRequest,
    #[error("Malformed request body: {0}")]
    Malformed(#[from] prost::DecodeError),
    #[error("Failed to persist {class} record {index} of {total}: {source}")]
    Durability {
        class: TelemetryClass,
        index: usize,
        total: usize,
        #[source]
        source: QueueError,
    },
}

impl IngestError {
    pub fn to_status(&self) -> tonic::Status {
        match self {
            IngestError::EmptyRequest => tonic::Status::invalid_argument("Empty request"),
            IngestError::Malformed(e) => tonic::Status::invalid_argument(e.to_string()),
            IngestError::Durability { .. } => tonic::Status::internal(self.to_string()),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::EmptyRequest | IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
            IngestError::Durability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reject_reason(&self) -> RejectReason {
        match self {
            IngestError::EmptyRequest => RejectReason::Empty,
            IngestError::Malformed(_) => RejectReason::Malformed,
            IngestError::Durability { .. } => RejectReason::Durability,
        }
    }
}

/// Splits export requests into records and persists them.
///
/// A request is acknowledged only after every record is durably appended.
/// On a failed append the records already written stay queued.
#[derive(Clone)]
pub struct TelemetryIngestor {
    queues: QueueSet,
    metrics: PipelineMetrics,
}

impl TelemetryIngestor {
    pub fn new(queues: QueueSet, metrics: PipelineMetrics) -> Self {
        Self { queues, metrics }
    }

    pub async fn ingest_traces(&self, request: &ExportTraceServiceRequest) -> Result<usize, IngestError> {
        self.ingest(TelemetryClass::Trace, &request.resource_spans)
            .await
    }

    pub async fn ingest_metrics(
        &self,
        request: &ExportMetricsServiceRequest,
    ) -> Result<usize, IngestError> {
        self.ingest(TelemetryClass::Metric, &request.resource_metrics)
            .await
    }

    /// Count a request that never reached the ingest step.
    pub fn reject(&self, class: TelemetryClass, error: &IngestError) {
        self.metrics.record_rejected(class, error.reject_reason());
    }

    async fn ingest<M: Message>(&self, class: TelemetryClass, units: &[M]) -> Result<usize, IngestError> {
        if units.is_empty() {
            let error = IngestError::EmptyRequest;
            self.reject(class, &error);
            return Err(error);
        }

        let queue = self.queues.get(class);
        let total = units.len();
        for (index, unit) in units.iter().enumerate() {
            let record = TelemetryRecord::new(class, unit.encode_to_vec());
            if let Err(source) = queue.append(&record).await {
                self.metrics.record_appended(class, index);
                error!(
                    class = %class,
                    appended = index,
                    total,
                    error = %source,
                    "Failed to persist {}",
                    class.unit_name()
                );
                let error = IngestError::Durability {
                    class,
                    index,
                    total,
                    source,
                };
                self.reject(class, &error);
                return Err(error);
            }
        }

        self.metrics.record_appended(class, total);
        debug!(class = %class, records = total, "Persisted export request");
        Ok(total)
    }
}
