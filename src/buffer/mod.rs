//! Durable on-disk queue.
//!
//! Each telemetry class gets its own directory holding time-rolled segment
//! files and a persisted tailer cursor:
//!
//! ```text
//! <buffer_path>/traces/20240305-130000.seg
//! <buffer_path>/traces/tailer.cursor
//! <buffer_path>/metrics/...
//! ```

pub mod batch;
pub mod cursor;
pub mod error;
pub mod queue;
pub mod segment;

pub use batch::{Batch, DrainedBatch, QueuedRecord};
pub use cursor::{Position, ReadTicket};
pub use error::QueueError;
pub use queue::{DurableQueue, QueueSet};
pub use segment::{RollCycle, SegmentId};
