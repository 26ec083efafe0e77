use crate::domain::TelemetryClass;
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
}

/// Why an ingest request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    Malformed,
    Durability,
}

impl RejectReason {
    const ALL: [RejectReason; 3] = [
        RejectReason::Empty,
        RejectReason::Malformed,
        RejectReason::Durability,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Empty => "empty",
            RejectReason::Malformed => "malformed",
            RejectReason::Durability => "durability",
        }
    }
}

/// Why a drained batch was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RetriesExhausted,
    Permanent,
}

impl DropReason {
    const ALL: [DropReason; 2] = [DropReason::RetriesExhausted, DropReason::Permanent];

    fn as_str(&self) -> &'static str {
        match self {
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::Permanent => "permanent",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_appended: u64,
    pub ingest_rejected: u64,
    pub batches_drained: u64,
    pub records_delivered: u64,
    pub batches_dropped: u64,
    pub records_undecodable: u64,
    pub retry_attempts: u64,
}

/// Pipeline counters labelled by telemetry class, kept in a private registry.
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Arc<Registry>,
    records_appended: IntCounterVec,
    ingest_rejected: IntCounterVec,
    batches_drained: IntCounterVec,
    records_delivered: IntCounterVec,
    batches_dropped: IntCounterVec,
    records_undecodable: IntCounterVec,
    retry_attempts: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec, MetricsError> {
            let vec = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            records_appended: counter(
                "rask_telemetry_records_appended_total",
                "Records durably appended to a queue",
                &["class"],
            )?,
            ingest_rejected: counter(
                "rask_telemetry_ingest_rejected_total",
                "Ingest requests refused",
                &["class", "reason"],
            )?,
            batches_drained: counter(
                "rask_telemetry_batches_drained_total",
                "Batches read from a queue",
                &["class"],
            )?,
            records_delivered: counter(
                "rask_telemetry_records_delivered_total",
                "Records accepted by the downstream collector",
                &["class"],
            )?,
            batches_dropped: counter(
                "rask_telemetry_batches_dropped_total",
                "Batches given up on",
                &["class", "reason"],
            )?,
            records_undecodable: counter(
                "rask_telemetry_records_undecodable_total",
                "Stored records that failed to decode for export",
                &["class"],
            )?,
            retry_attempts: counter(
                "rask_telemetry_retry_attempts_total",
                "Export attempts after the first",
                &["class"],
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn record_appended(&self, class: TelemetryClass, records: usize) {
        self.records_appended
            .with_label_values(&[class.as_str()])
            .inc_by(records as u64);
    }

    pub fn record_rejected(&self, class: TelemetryClass, reason: RejectReason) {
        self.ingest_rejected
            .with_label_values(&[class.as_str(), reason.as_str()])
            .inc();
    }

    pub fn record_drained(&self, class: TelemetryClass) {
        self.batches_drained.with_label_values(&[class.as_str()]).inc();
    }

    pub fn record_delivered(&self, class: TelemetryClass, records: usize) {
        self.records_delivered
            .with_label_values(&[class.as_str()])
            .inc_by(records as u64);
    }

    pub fn record_dropped(&self, class: TelemetryClass, reason: DropReason) {
        self.batches_dropped
            .with_label_values(&[class.as_str(), reason.as_str()])
            .inc();
    }

    pub fn record_undecodable(&self, class: TelemetryClass, records: usize) {
        self.records_undecodable
            .with_label_values(&[class.as_str()])
            .inc_by(records as u64);
    }

    pub fn record_retry(&self, class: TelemetryClass) {
        self.retry_attempts.with_label_values(&[class.as_str()]).inc();
    }

    pub fn snapshot(&self, class: TelemetryClass) -> MetricsSnapshot {
        let label = class.as_str();
        MetricsSnapshot {
            records_appended: self.records_appended.with_label_values(&[label]).get(),
            ingest_rejected: RejectReason::ALL
                .iter()
                .map(|r| self.ingest_rejected.with_label_values(&[label, r.as_str()]).get())
                .sum(),
            batches_drained: self.batches_drained.with_label_values(&[label]).get(),
            records_delivered: self.records_delivered.with_label_values(&[label]).get(),
            batches_dropped: DropReason::ALL
                .iter()
                .map(|r| self.batches_dropped.with_label_values(&[label, r.as_str()]).get())
                .sum(),
            records_undecodable: self.records_undecodable.with_label_values(&[label]).get(),
            retry_attempts: self.retry_attempts.with_label_values(&[label]).get(),
        }
    }
}
