use super::cursor::{Position, ReadTicket};
use crate::domain::{TelemetryClass, TelemetryRecord};
use uuid::Uuid;

/// A record together with the queue position it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedRecord {
    pub position: Position,
    pub record: TelemetryRecord,
}

/// Records of one class produced by a single drain read.
#[derive(Debug, Clone)]
pub struct Batch {
    id: String,
    class: TelemetryClass,
    records: Vec<QueuedRecord>,
}

impl Batch {
    pub fn new(class: TelemetryClass, records: Vec<QueuedRecord>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            class,
            records,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> TelemetryClass {
        self.class
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[QueuedRecord] {
        &self.records
    }

    pub fn first_position(&self) -> Option<Position> {
        self.records.first().map(|r| r.position)
    }
}

/// A batch plus the ticket that commits it once delivery has finished.
#[derive(Debug)]
pub struct DrainedBatch {
    pub batch: Batch,
    pub ticket: ReadTicket,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SegmentId;

    #[test]
    fn test_batch_exposes_records_in_read_order() {
        let queued = |offset: u64, payload: &[u8]| QueuedRecord {
            position: Position {
                segment: SegmentId(3_600),
                offset,
            },
            record: TelemetryRecord::new(TelemetryClass::Metric, payload.to_vec()),
        };
        let batch = Batch::new(TelemetryClass::Metric, vec![queued(0, b"a"), queued(40, b"b")]);
        let empty = Batch::new(TelemetryClass::Metric, Vec::new());

        assert_eq!(batch.size(), 2);
        assert_eq!(batch.first_position().map(|p| p.offset), Some(0));
        assert_eq!(batch.records()[1].record.payload, b"b");
        assert_ne!(batch.id(), empty.id());
        assert!(empty.is_empty());
        assert_eq!(empty.first_position(), None);
    }
}
