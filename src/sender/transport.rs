use super::ExportError;
use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use std::time::Duration;
use tonic::codegen::http::Uri;
use tonic::transport::{Channel, Endpoint};
use tracing::warn;

pub const DEFAULT_OTLP_GRPC_PORT: u16 = 4317;

/// One export call against the downstream collector.
#[async_trait]
pub trait ExportTransport: Send + Sync {
    async fn export_traces(&self, request: ExportTraceServiceRequest) -> Result<(), tonic::Status>;
    async fn export_metrics(&self, request: ExportMetricsServiceRequest)
    -> Result<(), tonic::Status>;
}

/// Normalise an endpoint to `http://host:port`, filling in the OTLP gRPC
/// port when none is given.
pub fn resolve_endpoint(raw: &str) -> Result<String, ExportError> {
    let invalid = |reason: String| ExportError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason,
    };

    let uri: Uri = raw.trim().parse().map_err(|e| invalid(format!("{e}")))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme {other}"))),
        None => return Err(invalid("missing scheme".to_string())),
    }
    let host = uri.host().ok_or_else(|| invalid("missing host".to_string()))?;
    let port = uri.port_u16().unwrap_or(DEFAULT_OTLP_GRPC_PORT);
    Ok(format!("http://{host}:{port}"))
}

/// gRPC transport over a lazily connected tonic channel. Connection failures
/// surface per call as `UNAVAILABLE`.
#[derive(Clone)]
pub struct GrpcTransport {
    endpoint: String,
    traces: TraceServiceClient<Channel>,
    metrics: MetricsServiceClient<Channel>,
}

impl GrpcTransport {
    pub fn connect_lazy(endpoint: &str, connect_timeout: Duration) -> Result<Self, ExportError> {
        let endpoint = resolve_endpoint(endpoint)?;
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| ExportError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?
            .connect_timeout(connect_timeout)
            .connect_lazy();

        Ok(Self {
            endpoint,
            traces: TraceServiceClient::new(channel.clone()),
            metrics: MetricsServiceClient::new(channel),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ExportTransport for GrpcTransport {
    async fn export_traces(&self, request: ExportTraceServiceRequest) -> Result<(), tonic::Status> {
        let response = self.traces.clone().export(request).await?.into_inner();
        if let Some(partial) = response.partial_success
            && partial.rejected_spans > 0
        {
            warn!(
                endpoint = %self.endpoint,
                rejected_spans = partial.rejected_spans,
                message = %partial.error_message,
                "Downstream partially rejected spans"
            );
        }
        Ok(())
    }

    async fn export_metrics(
        &self,
        request: ExportMetricsServiceRequest,
    ) -> Result<(), tonic::Status> {
        let response = self.metrics.clone().export(request).await?.into_inner();
        if let Some(partial) = response.partial_success
            && partial.rejected_data_points > 0
        {
            warn!(
                endpoint = %self.endpoint,
                rejected_data_points = partial.rejected_data_points,
                message = %partial.error_message,
                "Downstream partially rejected data points"
            );
        }
        Ok(())
    }
}
