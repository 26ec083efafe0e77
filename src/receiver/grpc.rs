use super::TelemetryIngestor;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::{
    TraceService, TraceServiceServer,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use tonic::{Request, Response, Status};
use tracing::instrument;

/// OTLP gRPC trace and metrics services backed by the durable queues.
#[derive(Clone)]
pub struct OtlpGrpcReceiver {
    ingestor: TelemetryIngestor,
}

impl OtlpGrpcReceiver {
    pub fn new(ingestor: TelemetryIngestor) -> Self {
        Self { ingestor }
    }

    pub fn trace_service(&self) -> TraceServiceServer<Self> {
        TraceServiceServer::new(self.clone())
    }

    pub fn metrics_service(&self) -> MetricsServiceServer<Self> {
        MetricsServiceServer::new(self.clone())
    }
}

#[tonic::async_trait]
impl TraceService for OtlpGrpcReceiver {
    #[instrument(skip_all, fields(resource_spans = request.get_ref().resource_spans.len()))]
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        self.ingestor
            .ingest_traces(request.get_ref())
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(ExportTraceServiceResponse {
            partial_success: None,
        }))
    }
}

#[tonic::async_trait]
impl MetricsService for OtlpGrpcReceiver {
    #[instrument(skip_all, fields(resource_metrics = request.get_ref().resource_metrics.len()))]
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        self.ingestor
            .ingest_metrics(request.get_ref())
            .await
            .map_err(|e| e.to_status())?;
        Ok(Response::new(ExportMetricsServiceResponse {
            partial_success: None,
        }))
    }
}
