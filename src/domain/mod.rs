//! Domain layer for rask-telemetry-forwarder.
//!
//! Contains the canonical types shared across all modules:
//! - `TelemetryClass`: Which signal a record carries (traces or metrics)
//! - `TelemetryRecord`: One resource-scoped unit, the atomic unit stored and forwarded

pub mod class;
pub mod record;

pub use class::TelemetryClass;
pub use record::TelemetryRecord;
