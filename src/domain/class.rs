use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Telemetry signal carried by a record.
///
/// Each class owns its own durable queue, scheduler lane and output encoder.
/// Nothing is shared between the two classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryClass {
    Trace,
    Metric,
}

impl TelemetryClass {
    pub const ALL: [TelemetryClass; 2] = [TelemetryClass::Trace, TelemetryClass::Metric];

    /// Label used in logs, metrics and as the queue directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryClass::Trace => "traces",
            TelemetryClass::Metric => "metrics",
        }
    }

    /// Name of the resource-scoped unit this class is split into.
    pub fn unit_name(&self) -> &'static str {
        match self {
            TelemetryClass::Trace => "ResourceSpans",
            TelemetryClass::Metric => "ResourceMetrics",
        }
    }
}

impl fmt::Display for TelemetryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TelemetryClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "traces" => Ok(TelemetryClass::Trace),
            "metric" | "metrics" => Ok(TelemetryClass::Metric),
            other => Err(format!("unknown telemetry class: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_directory_names() {
        assert_eq!(TelemetryClass::Trace.as_str(), "traces");
        assert_eq!(TelemetryClass::Metric.to_string(), "metrics");
    }

    #[test]
    fn test_from_str_accepts_singular_and_plural() {
        assert_eq!("trace".parse::<TelemetryClass>(), Ok(TelemetryClass::Trace));
        assert_eq!("METRICS".parse::<TelemetryClass>(), Ok(TelemetryClass::Metric));
        assert!("logs".parse::<TelemetryClass>().is_err());
    }
}
