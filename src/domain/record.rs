use super::TelemetryClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One resource-scoped unit of telemetry.
///
/// `payload` is the protobuf encoding of exactly one `ResourceSpans` or
/// `ResourceMetrics`. The pipeline never looks inside it until the output
/// encoder decodes it for export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub class: TelemetryClass,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl TelemetryRecord {
    pub fn new(class: TelemetryClass, payload: Vec<u8>) -> Self {
        Self {
            class,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_received_at(
        class: TelemetryClass,
        payload: Vec<u8>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            class,
            payload,
            received_at,
        }
    }
}
