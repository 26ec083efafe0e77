//! OTLP gRPC output.
//!
//! Each stored record holds one encoded `ResourceSpans` or `ResourceMetrics`.
//! The output decodes every record of a batch, wraps the decodable ones in a
//! single export request and sends it with bounded, fixed-delay retry.

use super::transport::{ExportTransport, GrpcTransport};
use super::{ExportError, OutputProcessor, ProcessOutcome};
use crate::buffer::Batch;
use crate::domain::TelemetryClass;
use crate::reliability::{DropReason, PipelineMetrics, RetryPolicy};
use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use prost::Message;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Registry name of the OTLP gRPC output.
pub const OTLP_GRPC_OUTPUT: &str = "otlp-grpc";

#[derive(Debug, Clone)]
pub struct OtlpOutputConfig {
    pub enabled: bool,
    pub endpoint: String,
    /// Bound on a single export attempt.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OtlpOutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:4317".to_string(),
            timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
        }
    }
}

enum TransportSource {
    Endpoint,
    Provided(Arc<dyn ExportTransport>),
}

/// Forwards batches to an OTLP gRPC collector.
pub struct OtlpGrpcOutput {
    config: OtlpOutputConfig,
    source: TransportSource,
    transport: parking_lot::RwLock<Option<Arc<dyn ExportTransport>>>,
    enabled: AtomicBool,
    metrics: PipelineMetrics,
}

impl OtlpGrpcOutput {
    /// Output that connects to `config.endpoint` when initialized.
    pub fn new(config: OtlpOutputConfig, metrics: PipelineMetrics) -> Self {
        Self::build(config, TransportSource::Endpoint, metrics)
    }

    /// Output that sends through `transport` instead of opening a channel.
    pub fn with_transport(
        config: OtlpOutputConfig,
        transport: Arc<dyn ExportTransport>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self::build(config, TransportSource::Provided(transport), metrics)
    }

    fn build(config: OtlpOutputConfig, source: TransportSource, metrics: PipelineMetrics) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            source,
            transport: parking_lot::RwLock::new(None),
            metrics,
        }
    }

    pub fn config(&self) -> &OtlpOutputConfig {
        &self.config
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn current_transport(&self) -> Option<Arc<dyn ExportTransport>> {
        self.transport.read().clone()
    }

    /// Decode each record independently. Failures are logged and counted,
    /// and never abort the rest of the batch.
    fn decode_units<M: Message + Default>(&self, batch: &Batch) -> (Vec<M>, usize) {
        let mut units = Vec::with_capacity(batch.size());
        let mut undecodable = 0;
        for queued in batch.records() {
            match M::decode(queued.record.payload.as_slice()) {
                Ok(unit) => units.push(unit),
                Err(e) => {
                    undecodable += 1;
                    warn!(
                        class = %batch.class(),
                        batch_id = batch.id(),
                        segment = %queued.position.segment,
                        offset = queued.position.offset,
                        error = %e,
                        "Skipping undecodable {}",
                        batch.class().unit_name()
                    );
                }
            }
        }
        if undecodable > 0 {
            self.metrics.record_undecodable(batch.class(), undecodable);
        }
        (units, undecodable)
    }

    async fn deliver<F, Fut>(
        &self,
        batch: &Batch,
        records: usize,
        undecodable: usize,
        send: F,
    ) -> ProcessOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), tonic::Status>>,
    {
        let class = batch.class();
        let timeout = self.config.timeout;
        let span = info_span!("export", class = %class, batch_id = batch.id(), records);

        let result = self
            .config
            .retry
            .execute(|attempt| {
                if attempt > 1 {
                    self.metrics.record_retry(class);
                }
                let call = send();
                async move {
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(status)) => Err(ExportError::Status(status)),
                        Err(_) => Err(ExportError::Timeout(timeout)),
                    }
                }
            })
            .instrument(span)
            .await;

        match result {
            Ok(done) => {
                self.metrics.record_delivered(class, records);
                info!(
                    class = %class,
                    batch_id = batch.id(),
                    records,
                    undecodable,
                    attempts = done.attempts,
                    "Batch delivered"
                );
                ProcessOutcome::Delivered {
                    records,
                    undecodable,
                    attempts: done.attempts,
                }
            }
            Err(failure) => {
                let reason = if failure.exhausted {
                    DropReason::RetriesExhausted
                } else {
                    DropReason::Permanent
                };
                self.metrics.record_dropped(class, reason);
                error!(
                    class = %class,
                    batch_id = batch.id(),
                    records,
                    attempt = failure.attempts,
                    max_attempts = self.config.retry.max_attempts(),
                    first_segment = ?batch.first_position().map(|p| p.segment.to_string()),
                    first_offset = ?batch.first_position().map(|p| p.offset),
                    error = %failure.error,
                    "Dropping batch after {:?}",
                    reason
                );
                ProcessOutcome::Dropped {
                    records,
                    undecodable,
                    attempts: failure.attempts,
                    reason,
                    error: failure.error,
                }
            }
        }
    }
}

#[async_trait]
impl OutputProcessor for OtlpGrpcOutput {
    fn name(&self) -> &str {
        OTLP_GRPC_OUTPUT
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn is_ready(&self) -> bool {
        self.transport.read().is_some()
    }

    async fn initialize(&self) -> Result<(), ExportError> {
        let transport: Arc<dyn ExportTransport> = match &self.source {
            TransportSource::Endpoint => Arc::new(GrpcTransport::connect_lazy(
                &self.config.endpoint,
                self.config.timeout,
            )?),
            TransportSource::Provided(transport) => transport.clone(),
        };
        *self.transport.write() = Some(transport);

        info!(
            output = OTLP_GRPC_OUTPUT,
            endpoint = %self.config.endpoint,
            max_retries = self.config.retry.max_retries,
            retry_delay_ms = self.config.retry.delay.as_millis() as u64,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Output initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) {
        if self.transport.write().take().is_some() {
            info!(output = OTLP_GRPC_OUTPUT, "Output shut down");
        }
    }

    async fn process(&self, batch: &Batch) -> ProcessOutcome {
        if !self.is_enabled() {
            return ProcessOutcome::NotReady;
        }
        let Some(transport) = self.current_transport() else {
            debug!(output = OTLP_GRPC_OUTPUT, batch_id = batch.id(), "Output not ready");
            return ProcessOutcome::NotReady;
        };

        match batch.class() {
            TelemetryClass::Trace => {
                let (resource_spans, undecodable) = self.decode_units::<ResourceSpans>(batch);
                if resource_spans.is_empty() {
                    return ProcessOutcome::NothingToSend { undecodable };
                }
                let records = resource_spans.len();
                let request = ExportTraceServiceRequest { resource_spans };
                self.deliver(batch, records, undecodable, || {
                    let transport = transport.clone();
                    let request = request.clone();
                    async move { transport.export_traces(request).await }
                })
                .await
            }
            TelemetryClass::Metric => {
                let (resource_metrics, undecodable) = self.decode_units::<ResourceMetrics>(batch);
                if resource_metrics.is_empty() {
                    return ProcessOutcome::NothingToSend { undecodable };
                }
                let records = resource_metrics.len();
                let request = ExportMetricsServiceRequest { resource_metrics };
                self.deliver(batch, records, undecodable, || {
                    let transport = transport.clone();
                    let request = request.clone();
                    async move { transport.export_metrics(request).await }
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Position, QueuedRecord, SegmentId};
    use crate::domain::TelemetryRecord;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    struct Unavailable {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExportTransport for Unavailable {
        async fn export_traces(&self, _: ExportTraceServiceRequest) -> Result<(), tonic::Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(tonic::Status::unavailable("collector down"))
        }

        async fn export_metrics(&self, _: ExportMetricsServiceRequest) -> Result<(), tonic::Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(tonic::Status::unavailable("collector down"))
        }
    }

    fn span_batch() -> Batch {
        let record = QueuedRecord {
            position: Position {
                segment: SegmentId(1_700_000_000),
                offset: 128,
            },
            record: TelemetryRecord::new(
                TelemetryClass::Trace,
                ResourceSpans::default().encode_to_vec(),
            ),
        };
        Batch::new(TelemetryClass::Trace, vec![record])
    }

    #[tokio::test]
    #[traced_test]
    async fn test_drop_is_logged_with_batch_context() {
        let transport = Arc::new(Unavailable {
            calls: AtomicUsize::new(0),
        });
        let config = OtlpOutputConfig {
            retry: RetryPolicy {
                max_retries: 2,
                delay: Duration::from_millis(5),
            },
            ..OtlpOutputConfig::default()
        };
        let output = OtlpGrpcOutput::with_transport(
            config,
            transport.clone(),
            PipelineMetrics::new().unwrap(),
        );
        output.initialize().await.unwrap();

        let batch = span_batch();
        let outcome = output.process(&batch).await;

        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert!(!outcome.is_delivered());
        assert!(logs_contain("Dropping batch after RetriesExhausted"));
        assert!(logs_contain(batch.id()));
        assert!(logs_contain("attempt=3"));
        assert!(logs_contain("max_attempts=3"));
        assert!(logs_contain("first_offset=Some(128)"));
    }

    #[tokio::test]
    async fn test_undecodable_record_is_counted() {
        let transport = Arc::new(Unavailable {
            calls: AtomicUsize::new(0),
        });
        let metrics = PipelineMetrics::new().unwrap();
        let output = OtlpGrpcOutput::with_transport(
            OtlpOutputConfig::default(),
            transport.clone(),
            metrics.clone(),
        );
        output.initialize().await.unwrap();

        let broken = Batch::new(
            TelemetryClass::Metric,
            vec![QueuedRecord {
                position: Position::start_of(SegmentId(0)),
                record: TelemetryRecord::new(TelemetryClass::Metric, vec![0xFF, 0xFF, 0xFF]),
            }],
        );
        let outcome = output.process(&broken).await;

        assert!(matches!(outcome, ProcessOutcome::NothingToSend { undecodable: 1 }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.snapshot(TelemetryClass::Metric).records_undecodable, 1);
    }
}
