//! OTLP HTTP receiver
//!
//! Supports:
//! - POST /v1/traces (OTLP HTTP/protobuf)
//! - POST /v1/metrics (OTLP HTTP/protobuf)

use super::{IngestError, TelemetryIngestor};
use crate::domain::TelemetryClass;
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::post,
};
use opentelemetry_proto::tonic::collector::{
    metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse},
    trace::v1::{ExportTraceServiceRequest, ExportTraceServiceResponse},
};
use prost::Message;
use tracing::{debug, instrument, warn};

const PROTOBUF: &str = "application/x-protobuf";

/// Application state for OTLP handlers
#[derive(Clone)]
pub struct OtlpHttpState {
    pub ingestor: TelemetryIngestor,
}

/// Create Axum router for OTLP HTTP endpoints
pub fn otlp_routes(state: OtlpHttpState) -> Router {
    Router::new()
        .route("/v1/traces", post(receive_traces_http))
        .route("/v1/metrics", post(receive_metrics_http))
        .with_state(state)
}

fn protobuf_response(status: StatusCode, body: Vec<u8>) -> impl IntoResponse {
    (status, [(header::CONTENT_TYPE, PROTOBUF)], Bytes::from(body))
}

fn rejected(state: &OtlpHttpState, class: TelemetryClass, error: IngestError) -> impl IntoResponse {
    let status = error.status_code();
    if status.is_client_error() {
        warn!(class = %class, error = %error, "Rejected OTLP HTTP request");
    }
    if matches!(error, IngestError::Malformed(_)) {
        state.ingestor.reject(class, &error);
    }
    protobuf_response(status, Vec::new())
}

/// OTLP HTTP traces receiver
///
/// Accepts: application/x-protobuf
/// Returns: application/x-protobuf
#[instrument(skip(state, body), fields(body_size = body.len()))]
async fn receive_traces_http(State(state): State<OtlpHttpState>, body: Bytes) -> impl IntoResponse {
    let request = match ExportTraceServiceRequest::decode(body) {
        Ok(req) => req,
        Err(e) => return rejected(&state, TelemetryClass::Trace, e.into()).into_response(),
    };

    match state.ingestor.ingest_traces(&request).await {
        Ok(records) => {
            debug!(records, "Accepted OTLP HTTP traces");
            protobuf_response(
                StatusCode::OK,
                ExportTraceServiceResponse::default().encode_to_vec(),
            )
            .into_response()
        }
        Err(e) => rejected(&state, TelemetryClass::Trace, e).into_response(),
    }
}

/// OTLP HTTP metrics receiver
#[instrument(skip(state, body), fields(body_size = body.len()))]
async fn receive_metrics_http(State(state): State<OtlpHttpState>, body: Bytes) -> impl IntoResponse {
    let request = match ExportMetricsServiceRequest::decode(body) {
        Ok(req) => req,
        Err(e) => return rejected(&state, TelemetryClass::Metric, e.into()).into_response(),
    };

    match state.ingestor.ingest_metrics(&request).await {
        Ok(records) => {
            debug!(records, "Accepted OTLP HTTP metrics");
            protobuf_response(
                StatusCode::OK,
                ExportMetricsServiceResponse::default().encode_to_vec(),
            )
            .into_response()
        }
        Err(e) => rejected(&state, TelemetryClass::Metric, e).into_response(),
    }
}
