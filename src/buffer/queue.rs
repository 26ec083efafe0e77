use super::batch::{Batch, DrainedBatch, QueuedRecord};
use super::cursor::{AckTracker, CursorStore, Position, ReadTicket};
use super::error::QueueError;
use super::segment::{self, FRAME_HEADER_LEN, FrameHeader, MAX_FRAME_BODY, RollCycle, SegmentId};
use crate::domain::{TelemetryClass, TelemetryRecord};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Committed byte length of every live segment. Only bytes inside these
/// bounds are visible to the tailer.
type SegmentIndex = BTreeMap<SegmentId, u64>;

struct Appender {
    current: Option<(SegmentId, File)>,
}

impl Appender {
    async fn file_for(
        &mut self,
        dir: &Path,
        segment: SegmentId,
        committed_len: u64,
    ) -> Result<&mut File, QueueError> {
        if !matches!(&self.current, Some((id, _)) if *id == segment) {
            let path = segment.path_in(dir);
            let created = !fs::try_exists(&path).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            if created {
                segment::sync_dir(dir).await?;
            }
            // Drop bytes a failed write may have left behind.
            if file.metadata().await?.len() != committed_len {
                file.set_len(committed_len).await?;
            }
            debug!(segment = %segment, "Opened segment for append");
            self.current = Some((segment, file));
        }
        let (_, file) = self.current.as_mut().ok_or(QueueError::Closed)?;
        Ok(file)
    }
}

struct Tailer {
    position: Position,
    file: Option<(SegmentId, File)>,
}

impl Tailer {
    async fn file_for(&mut self, dir: &Path, segment: SegmentId) -> Result<&mut File, QueueError> {
        if !matches!(&self.file, Some((id, _)) if *id == segment) {
            let file = File::open(segment.path_in(dir)).await?;
            self.file = Some((segment, file));
        }
        let (_, file) = self.file.as_mut().ok_or(QueueError::Closed)?;
        Ok(file)
    }
}

enum FrameRead {
    Record(TelemetryRecord, u64),
    Skip { frame_len: u64, reason: String },
    Unreadable(String),
}

/// Append-only, crash-safe segmented log for one telemetry class.
///
/// Appends serialize behind the appender lock and reads behind the tailer
/// lock, so ingestion and draining never wait on each other. The persisted
/// cursor only moves when a drained batch is acknowledged.
pub struct DurableQueue {
    class: TelemetryClass,
    dir: PathBuf,
    roll_cycle: RollCycle,
    index: parking_lot::RwLock<SegmentIndex>,
    appender: Mutex<Appender>,
    tailer: Mutex<Tailer>,
    read_position: parking_lot::Mutex<Position>,
    acks: parking_lot::Mutex<AckTracker>,
    cursor: Mutex<CursorStore>,
    closed: AtomicBool,
}

impl DurableQueue {
    /// Open (or create) the queue stored in `dir`, repairing what a crash may
    /// have left behind.
    pub async fn open(
        dir: impl Into<PathBuf>,
        class: TelemetryClass,
        roll_cycle: RollCycle,
    ) -> Result<Self, QueueError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        if !fs::metadata(&dir).await?.is_dir() {
            return Err(QueueError::InvalidPath(dir.display().to_string()));
        }
        if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            segment::sync_dir(parent).await?;
        }

        let mut index = Self::recover_segments(&dir, class).await?;
        let mut cursor = CursorStore::load(&dir).await?;
        let start = Self::resolve_start(&index, cursor.committed());
        if let Some(stored) = cursor.committed()
            && stored != start
        {
            warn!(
                class = %class,
                stored = %stored,
                resolved = %start,
                "Stored cursor does not match segments on disk, adjusting"
            );
            cursor.reset(start).await?;
        }

        let stale: Vec<SegmentId> = index.range(..start.segment).map(|(id, _)| *id).collect();
        for id in stale {
            index.remove(&id);
            Self::remove_segment(&dir, class, id).await;
        }

        info!(
            class = %class,
            path = %dir.display(),
            roll_cycle = %roll_cycle,
            segments = index.len(),
            cursor = %start,
            "Opened durable queue"
        );

        Ok(Self {
            class,
            dir,
            roll_cycle,
            index: parking_lot::RwLock::new(index),
            appender: Mutex::new(Appender { current: None }),
            tailer: Mutex::new(Tailer {
                position: start,
                file: None,
            }),
            read_position: parking_lot::Mutex::new(start),
            acks: parking_lot::Mutex::new(AckTracker::default()),
            cursor: Mutex::new(cursor),
            closed: AtomicBool::new(false),
        })
    }

    async fn recover_segments(dir: &Path, class: TelemetryClass) -> Result<SegmentIndex, QueueError> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(SegmentId::from_file_name) {
                found.push(id);
            }
        }
        found.sort();

        let newest = found.last().copied();
        let mut index = SegmentIndex::new();
        for id in found {
            let path = id.path_in(dir);
            let scan = segment::scan_segment(&path).await?;

            if scan.has_torn_tail() {
                if Some(id) == newest {
                    warn!(
                        class = %class,
                        segment = %id,
                        valid_len = scan.valid_len,
                        file_len = scan.file_len,
                        "Truncating torn tail"
                    );
                    let file = OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(scan.valid_len).await?;
                    file.sync_all().await?;
                } else {
                    warn!(
                        class = %class,
                        segment = %id,
                        ignored_bytes = scan.file_len - scan.valid_len,
                        "Ignoring bytes after the last complete frame"
                    );
                }
            }
            if scan.corrupt_frames > 0 {
                warn!(
                    class = %class,
                    segment = %id,
                    corrupt_frames = scan.corrupt_frames,
                    "Segment holds frames with bad checksums, they will be skipped"
                );
            }

            if scan.valid_len == 0 {
                Self::remove_segment(dir, class, id).await;
                continue;
            }
            index.insert(id, scan.valid_len);
        }
        Ok(index)
    }

    fn resolve_start(index: &SegmentIndex, stored: Option<Position>) -> Position {
        let Some(stored) = stored else {
            return index
                .keys()
                .next()
                .map(|id| Position::start_of(*id))
                .unwrap_or(Position::ORIGIN);
        };

        match index.get(&stored.segment) {
            Some(&len) if stored.offset > len => Position {
                segment: stored.segment,
                offset: len,
            },
            Some(_) => stored,
            None => index
                .range((Excluded(stored.segment), Unbounded))
                .next()
                .map(|(id, _)| Position::start_of(*id))
                .unwrap_or(stored),
        }
    }

    pub fn class(&self) -> TelemetryClass {
        self.class
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    /// Append one record and flush it to disk before returning its position.
    pub async fn append(&self, record: &TelemetryRecord) -> Result<Position, QueueError> {
        self.ensure_open()?;
        if record.class != self.class {
            return Err(QueueError::ClassMismatch {
                expected: self.class,
                actual: record.class,
            });
        }
        let frame = segment::encode_frame(record)?;

        let mut appender = self.appender.lock().await;
        self.ensure_open()?;

        let (target, offset) = {
            let index = self.index.read();
            let by_time = self.roll_cycle.segment_for(record.received_at);
            // Never roll backwards when the wall clock does.
            let target = match index.keys().next_back() {
                Some(&last) if last > by_time => last,
                _ => by_time,
            };
            (target, index.get(&target).copied().unwrap_or(0))
        };

        let file = appender.file_for(&self.dir, target, offset).await?;
        if let Err(e) = write_frame(file, &frame).await {
            error!(
                class = %self.class,
                segment = %target,
                offset,
                error = %e,
                "Append failed, rolling back partial frame"
            );
            if let Err(truncate_error) = file.set_len(offset).await {
                error!(
                    class = %self.class,
                    segment = %target,
                    error = %truncate_error,
                    "Failed to roll back partial frame"
                );
            }
            appender.current = None;
            return Err(e.into());
        }

        self.index.write().insert(target, offset + frame.len() as u64);
        Ok(Position {
            segment: target,
            offset,
        })
    }

    /// Whether the tailer is behind the committed end of the log. Compares
    /// positions only and never touches a record.
    pub fn has_available(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let position = *self.read_position.lock();
        self.index
            .read()
            .range(position.segment..)
            .any(|(id, len)| {
                if *id == position.segment {
                    *len > position.offset
                } else {
                    *len > 0
                }
            })
    }

    /// Read a single record. Equivalent to `read_batch(1)`.
    pub async fn read_next(&self) -> Result<Option<DrainedBatch>, QueueError> {
        self.read_batch(1).await
    }

    /// Advance the tailer by up to `max` records. Returns `None` without
    /// waiting when nothing is available.
    pub async fn read_batch(&self, max: usize) -> Result<Option<DrainedBatch>, QueueError> {
        self.ensure_open()?;
        if max == 0 {
            return Ok(None);
        }

        let mut tailer = self.tailer.lock().await;
        let mut records = Vec::new();
        while records.len() < max {
            match self.next_record(&mut tailer).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) if records.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        class = %self.class,
                        position = %tailer.position,
                        records = records.len(),
                        error = %e,
                        "Read failed mid-batch, returning what was read"
                    );
                    break;
                }
            }
        }
        *self.read_position.lock() = tailer.position;

        if records.is_empty() {
            return Ok(None);
        }
        let ticket = self.acks.lock().begin(tailer.position);
        Ok(Some(DrainedBatch {
            batch: Batch::new(self.class, records),
            ticket,
        }))
    }

    async fn next_record(&self, tailer: &mut Tailer) -> Result<Option<QueuedRecord>, QueueError> {
        loop {
            let position = tailer.position;
            let (segment_len, next_segment) = {
                let index = self.index.read();
                let next = index
                    .range((Excluded(position.segment), Unbounded))
                    .next()
                    .map(|(id, _)| *id);
                (index.get(&position.segment).copied(), next)
            };

            match segment_len {
                Some(len) if position.offset < len => {
                    match self.read_frame(tailer, position, len).await? {
                        FrameRead::Record(record, frame_len) => {
                            tailer.position.offset += frame_len;
                            return Ok(Some(QueuedRecord { position, record }));
                        }
                        FrameRead::Skip { frame_len, reason } => {
                            warn!(
                                class = %self.class,
                                segment = %position.segment,
                                offset = position.offset,
                                reason = %reason,
                                "Skipping unreadable record"
                            );
                            tailer.position.offset += frame_len;
                        }
                        FrameRead::Unreadable(reason) => {
                            error!(
                                class = %self.class,
                                segment = %position.segment,
                                offset = position.offset,
                                reason = %reason,
                                "Frame boundary lost, skipping rest of segment"
                            );
                            tailer.position.offset = len;
                        }
                    }
                }
                _ => match next_segment {
                    Some(next) => {
                        tailer.position = Position::start_of(next);
                        tailer.file = None;
                    }
                    None => return Ok(None),
                },
            }
        }
    }

    async fn read_frame(
        &self,
        tailer: &mut Tailer,
        position: Position,
        segment_len: u64,
    ) -> Result<FrameRead, QueueError> {
        let available = segment_len - position.offset;
        if available < FRAME_HEADER_LEN as u64 {
            return Ok(FrameRead::Unreadable(format!(
                "{available} trailing bytes are shorter than a frame header"
            )));
        }

        let file = tailer.file_for(&self.dir, position.segment).await?;
        file.seek(SeekFrom::Start(position.offset)).await?;
        let mut header = [0u8; FRAME_HEADER_LEN];
        file.read_exact(&mut header).await?;
        let frame = FrameHeader::parse(&header);
        if frame.body_len as usize > MAX_FRAME_BODY || frame.frame_len() > available {
            return Ok(FrameRead::Unreadable(format!(
                "declared body length {} does not fit the segment",
                frame.body_len
            )));
        }

        let mut body = vec![0u8; frame.body_len as usize];
        file.read_exact(&mut body).await?;
        let frame_len = frame.frame_len();
        if !frame.matches(&body) {
            return Ok(FrameRead::Skip {
                frame_len,
                reason: "checksum mismatch".to_string(),
            });
        }

        Ok(match segment::decode_body(&body) {
            Ok(record) if record.class == self.class => FrameRead::Record(record, frame_len),
            Ok(record) => FrameRead::Skip {
                frame_len,
                reason: format!("record of class {} in {} queue", record.class, self.class),
            },
            Err(e) => FrameRead::Skip {
                frame_len,
                reason: e.to_string(),
            },
        })
    }

    /// Report that the batch behind `ticket` is finished (delivered or
    /// dropped). Returns the newly persisted cursor when it moved.
    /// Once the queue is closed acknowledgements are refused and the batch
    /// is replayed on the next open.
    pub async fn acknowledge(&self, ticket: ReadTicket) -> Result<Option<Position>, QueueError> {
        self.ensure_open()?;
        let Some(commit_to) = self.acks.lock().complete(&ticket) else {
            return Ok(None);
        };

        {
            let mut cursor = self.cursor.lock().await;
            // close() flushes under this lock; nothing may land after it.
            self.ensure_open()?;
            if !cursor.commit(commit_to).await? {
                return Ok(None);
            }
        }
        debug!(class = %self.class, cursor = %commit_to, "Committed tailer cursor");

        self.reclaim_before(commit_to.segment).await;
        Ok(Some(commit_to))
    }

    /// Delete every segment strictly older than `committed`.
    async fn reclaim_before(&self, committed: SegmentId) -> usize {
        let stale: Vec<SegmentId> = {
            let mut index = self.index.write();
            let keep = index.split_off(&committed);
            std::mem::replace(&mut *index, keep).into_keys().collect()
        };
        for id in &stale {
            Self::remove_segment(&self.dir, self.class, *id).await;
        }
        stale.len()
    }

    async fn remove_segment(dir: &Path, class: TelemetryClass, id: SegmentId) {
        match fs::remove_file(id.path_in(dir)).await {
            Ok(()) => info!(class = %class, segment = %id, "Reclaimed segment"),
            Err(e) => warn!(class = %class, segment = %id, error = %e, "Failed to remove segment"),
        }
    }

    pub async fn committed_position(&self) -> Option<Position> {
        self.cursor.lock().await.committed()
    }

    pub fn read_position(&self) -> Position {
        *self.read_position.lock()
    }

    /// Batches read but not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        self.acks.lock().outstanding()
    }

    pub fn segment_count(&self) -> usize {
        self.index.read().len()
    }

    /// Committed bytes across all live segments.
    pub fn disk_usage(&self) -> u64 {
        self.index.read().values().sum()
    }

    /// Release both file handles and persist the committed cursor. Later
    /// appends and reads fail with `QueueError::Closed`.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some((_, file)) = self.appender.lock().await.current.take() {
            file.sync_all().await?;
        }
        self.tailer.lock().await.file = None;
        self.cursor.lock().await.flush().await?;

        info!(class = %self.class, "Closed durable queue");
        Ok(())
    }
}

async fn write_frame(file: &mut File, frame: &[u8]) -> std::io::Result<()> {
    file.write_all(frame).await?;
    file.flush().await?;
    file.sync_data().await
}

/// The two per-class queues under one buffer directory.
#[derive(Clone)]
pub struct QueueSet {
    traces: Arc<DurableQueue>,
    metrics: Arc<DurableQueue>,
}

impl QueueSet {
    pub async fn open(base: &Path, roll_cycle: RollCycle) -> Result<Self, QueueError> {
        let traces = DurableQueue::open(
            base.join(TelemetryClass::Trace.as_str()),
            TelemetryClass::Trace,
            roll_cycle,
        )
        .await?;
        let metrics = DurableQueue::open(
            base.join(TelemetryClass::Metric.as_str()),
            TelemetryClass::Metric,
            roll_cycle,
        )
        .await?;
        Ok(Self {
            traces: Arc::new(traces),
            metrics: Arc::new(metrics),
        })
    }

    pub fn get(&self, class: TelemetryClass) -> &Arc<DurableQueue> {
        match class {
            TelemetryClass::Trace => &self.traces,
            TelemetryClass::Metric => &self.metrics,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DurableQueue>> {
        [&self.traces, &self.metrics].into_iter()
    }

    /// Close both queues. Both are attempted even when the first fails.
    pub async fn close_all(&self) -> Result<(), QueueError> {
        let traces = self.traces.close().await;
        let metrics = self.metrics.close().await;
        traces.and(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::cursor::CURSOR_FILE;
    use tempfile::TempDir;

    fn trace(payload: &[u8]) -> TelemetryRecord {
        TelemetryRecord::new(TelemetryClass::Trace, payload.to_vec())
    }

    #[tokio::test]
    async fn test_has_available_does_not_consume() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), TelemetryClass::Trace, RollCycle::Hourly)
            .await
            .unwrap();

        assert!(!queue.has_available());
        queue.append(&trace(b"only")).await.unwrap();
        assert!(queue.has_available());
        assert!(queue.has_available());

        let drained = queue.read_batch(10).await.unwrap().unwrap();
        assert_eq!(drained.batch.size(), 1);
        assert_eq!(drained.batch.records()[0].record.payload, b"only");
        assert!(!queue.has_available());
    }

    #[tokio::test]
    async fn test_append_rejects_other_class() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), TelemetryClass::Metric, RollCycle::Hourly)
            .await
            .unwrap();

        let result = queue.append(&trace(b"span")).await;
        assert!(matches!(result, Err(QueueError::ClassMismatch { .. })));
        assert_eq!(queue.disk_usage(), 0);
    }

    #[tokio::test]
    async fn test_positions_follow_frame_sizes() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), TelemetryClass::Trace, RollCycle::Daily)
            .await
            .unwrap();

        let first = queue.append(&trace(b"a")).await.unwrap();
        let second = queue.append(&trace(b"bb")).await.unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.segment, second.segment);
        assert!(second.offset > 0);
        assert!(queue.disk_usage() > second.offset);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_io() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), TelemetryClass::Trace, RollCycle::Hourly)
            .await
            .unwrap();
        queue.append(&trace(b"x")).await.unwrap();

        queue.close().await.unwrap();
        queue.close().await.unwrap();

        assert!(matches!(queue.append(&trace(b"y")).await, Err(QueueError::Closed)));
        assert!(matches!(queue.read_batch(1).await, Err(QueueError::Closed)));
        assert!(!queue.has_available());
    }

    #[tokio::test]
    async fn test_new_segment_and_cursor_are_visible_in_directory() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), TelemetryClass::Trace, RollCycle::Hourly)
            .await
            .unwrap();

        let position = queue.append(&trace(b"first")).await.unwrap();
        assert!(position.segment.path_in(dir.path()).exists());
        let drained = queue.read_batch(1).await.unwrap().unwrap();
        assert!(queue.acknowledge(drained.ticket).await.unwrap().is_some());

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|name| name == CURSOR_FILE), "{names:?}");
        assert!(!names.iter().any(|name| name.ends_with(".tmp")), "{names:?}");

        // Appending to an existing segment after reopen reuses the file.
        queue.close().await.unwrap();
        drop(queue);
        let queue = DurableQueue::open(dir.path(), TelemetryClass::Trace, RollCycle::Hourly)
            .await
            .unwrap();
        let next = queue.append(&trace(b"second")).await.unwrap();
        assert_eq!(next.segment, position.segment);
    }

    #[tokio::test]
    async fn test_acknowledge_after_close_leaves_cursor_alone() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), TelemetryClass::Trace, RollCycle::Hourly)
            .await
            .unwrap();
        queue.append(&trace(b"pending")).await.unwrap();
        let drained = queue.read_batch(1).await.unwrap().unwrap();

        queue.close().await.unwrap();
        assert!(matches!(
            queue.acknowledge(drained.ticket).await,
            Err(QueueError::Closed)
        ));
        assert!(!dir.path().join(CURSOR_FILE).exists());
        assert_eq!(queue.segment_count(), 1);
    }
}
