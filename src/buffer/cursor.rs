use super::error::QueueError;
use super::segment::{self, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const CURSOR_FILE: &str = "tailer.cursor";

/// Byte position inside the queue. Ordered the same way records were appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub segment: SegmentId,
    pub offset: u64,
}

impl Position {
    pub const ORIGIN: Position = Position {
        segment: SegmentId::ORIGIN,
        offset: 0,
    };

    pub fn start_of(segment: SegmentId) -> Self {
        Self { segment, offset: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.segment, self.offset)
    }
}

/// Handed out with every drained batch. Passing it back to
/// `DurableQueue::acknowledge` lets the persisted cursor move past the batch.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an unacknowledged ticket holds back the persisted cursor"]
pub struct ReadTicket {
    pub(crate) seq: u64,
    pub(crate) end: Position,
}

impl ReadTicket {
    /// Position right after the last record of the batch.
    pub fn end(&self) -> Position {
        self.end
    }
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    end: Position,
    done: bool,
}

/// Orders acknowledgements so the cursor only moves over a contiguous prefix
/// of finished reads.
#[derive(Debug, Default)]
pub struct AckTracker {
    next_seq: u64,
    pending: VecDeque<Pending>,
}

impl AckTracker {
    pub fn begin(&mut self, end: Position) -> ReadTicket {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(Pending {
            seq,
            end,
            done: false,
        });
        ReadTicket { seq, end }
    }

    /// Marks the ticket finished and returns the new commit point, if the
    /// contiguous prefix grew.
    pub fn complete(&mut self, ticket: &ReadTicket) -> Option<Position> {
        if let Some(entry) = self.pending.iter_mut().find(|p| p.seq == ticket.seq) {
            entry.done = true;
        }

        let mut committed = None;
        while let Some(front) = self.pending.front() {
            if !front.done {
                break;
            }
            committed = Some(front.end);
            self.pending.pop_front();
        }
        committed
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Persisted committed read position of a queue's tailer.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    committed: Option<Position>,
}

impl CursorStore {
    pub async fn load(dir: &Path) -> Result<Self, QueueError> {
        let path = dir.join(CURSOR_FILE);
        let committed = match fs::read(&path).await {
            Ok(bytes) => Some(serde_json::from_slice::<Position>(&bytes).map_err(|e| {
                QueueError::Cursor {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, committed })
    }

    pub fn committed(&self) -> Option<Position> {
        self.committed
    }

    /// Persist `position` if it is ahead of what is already stored. Written to
    /// a temp file, synced, then renamed over the previous cursor.
    pub async fn commit(&mut self, position: Position) -> Result<bool, QueueError> {
        if self.committed.is_some_and(|current| current >= position) {
            return Ok(false);
        }
        self.write(position).await?;
        self.committed = Some(position);
        Ok(true)
    }

    /// Overwrite the stored cursor even when it moves backwards. Used on open
    /// when the stored value no longer matches what is on disk.
    pub async fn reset(&mut self, position: Position) -> Result<(), QueueError> {
        self.write(position).await?;
        self.committed = Some(position);
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), QueueError> {
        if let Some(position) = self.committed {
            self.write(position).await?;
        }
        Ok(())
    }

    async fn write(&self, position: Position) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(&position).map_err(|e| QueueError::Cursor {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = self.path.with_extension("cursor.tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            segment::sync_dir(dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(segment: i64, offset: u64) -> Position {
        Position {
            segment: SegmentId(segment),
            offset,
        }
    }

    #[test]
    fn test_positions_order_by_segment_then_offset() {
        assert!(pos(0, 500) < pos(3600, 0));
        assert!(pos(3600, 10) < pos(3600, 11));
        assert!(Position::ORIGIN < pos(0, 0));
    }

    #[test]
    fn test_out_of_order_completion_waits_for_prefix() {
        let mut tracker = AckTracker::default();
        let first = tracker.begin(pos(0, 100));
        let second = tracker.begin(pos(0, 200));
        let third = tracker.begin(pos(0, 300));

        assert_eq!(tracker.complete(&second), None);
        assert_eq!(tracker.complete(&third), None);
        assert_eq!(tracker.complete(&first), Some(pos(0, 300)));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_in_order_completion_commits_each_step() {
        let mut tracker = AckTracker::default();
        let first = tracker.begin(pos(0, 100));
        let second = tracker.begin(pos(0, 200));

        assert_eq!(tracker.complete(&first), Some(pos(0, 100)));
        assert_eq!(tracker.outstanding(), 1);
        assert_eq!(tracker.complete(&second), Some(pos(0, 200)));
    }

    #[tokio::test]
    async fn test_cursor_survives_reload_and_never_moves_back() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut store = CursorStore::load(dir.path()).await.unwrap();
        assert_eq!(store.committed(), None);
        assert!(store.commit(pos(3600, 42)).await.unwrap());
        assert!(!store.commit(pos(3600, 10)).await.unwrap());

        let reloaded = CursorStore::load(dir.path()).await.unwrap();
        assert_eq!(reloaded.committed(), Some(pos(3600, 42)));
        assert!(!dir.path().join("tailer.cursor.tmp").exists());
    }

    #[tokio::test]
    async fn test_unreadable_cursor_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join(CURSOR_FILE), b"not json")
            .await
            .unwrap();

        let result = CursorStore::load(dir.path()).await;
        assert!(matches!(result, Err(QueueError::Cursor { .. })));
    }
}
