use super::error::QueueError;
use crate::domain::{TelemetryClass, TelemetryRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use xxhash_rust::xxh3::xxh3_64;

pub const SEGMENT_EXTENSION: &str = "seg";
const SEGMENT_NAME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// `[u32 body length LE][u64 xxh3 of body LE]`
pub const FRAME_HEADER_LEN: usize = 12;
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

/// Interval after which the appender starts a new segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollCycle {
    #[default]
    Hourly,
    Daily,
}

impl RollCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollCycle::Hourly => "hourly",
            RollCycle::Daily => "daily",
        }
    }

    pub fn period_secs(&self) -> i64 {
        match self {
            RollCycle::Hourly => 3_600,
            RollCycle::Daily => 86_400,
        }
    }

    /// Segment whose cycle contains `at`.
    pub fn segment_for(&self, at: DateTime<Utc>) -> SegmentId {
        let secs = at.timestamp();
        SegmentId(secs - secs.rem_euclid(self.period_secs()))
    }

    /// Unknown values fall back to hourly with a warning instead of failing startup.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(
                roll_cycle = value,
                "Unknown roll cycle, falling back to hourly"
            );
            RollCycle::Hourly
        })
    }
}

impl FromStr for RollCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(RollCycle::Hourly),
            "daily" => Ok(RollCycle::Daily),
            other => Err(format!("unknown roll cycle: {other}")),
        }
    }
}

impl fmt::Display for RollCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start of a roll cycle in Unix seconds. Ordering matches append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentId(pub i64);

impl SegmentId {
    pub const ORIGIN: SegmentId = SegmentId(i64::MIN);

    pub fn file_name(&self) -> String {
        match DateTime::from_timestamp(self.0, 0) {
            Some(start) => format!("{}.{SEGMENT_EXTENSION}", start.format(SEGMENT_NAME_FORMAT)),
            None => format!("{}.{SEGMENT_EXTENSION}", self.0),
        }
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
        if let Ok(start) = NaiveDateTime::parse_from_str(stem, SEGMENT_NAME_FORMAT) {
            return Some(SegmentId(start.and_utc().timestamp()));
        }
        stem.parse().ok().map(SegmentId)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    class: TelemetryClass,
    received_at_micros: i64,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: u32,
    pub checksum: u64,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        let mut len = [0u8; 4];
        let mut sum = [0u8; 8];
        len.copy_from_slice(&bytes[..4]);
        sum.copy_from_slice(&bytes[4..]);
        Self {
            body_len: u32::from_le_bytes(len),
            checksum: u64::from_le_bytes(sum),
        }
    }

    pub fn frame_len(&self) -> u64 {
        FRAME_HEADER_LEN as u64 + u64::from(self.body_len)
    }

    pub fn matches(&self, body: &[u8]) -> bool {
        xxh3_64(body) == self.checksum
    }
}

/// Encode a record as a checksummed frame ready to be appended.
pub fn encode_frame(record: &TelemetryRecord) -> Result<Vec<u8>, QueueError> {
    let stored = StoredRecord {
        class: record.class,
        received_at_micros: record.received_at.timestamp_micros(),
        payload: record.payload.clone(),
    };
    let body = bincode::serde::encode_to_vec(&stored, bincode::config::standard())?;
    if body.len() > MAX_FRAME_BODY {
        return Err(QueueError::RecordTooLarge {
            size: body.len(),
            limit: MAX_FRAME_BODY,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&xxh3_64(&body).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body whose checksum was already verified.
pub fn decode_body(body: &[u8]) -> Result<TelemetryRecord, QueueError> {
    let (stored, _): (StoredRecord, usize) =
        bincode::serde::decode_from_slice(body, bincode::config::standard())?;
    let received_at = DateTime::from_timestamp_micros(stored.received_at_micros).ok_or_else(|| {
        QueueError::Corrupt {
            segment: String::new(),
            offset: 0,
            reason: format!("timestamp out of range: {}", stored.received_at_micros),
        }
    })?;
    Ok(TelemetryRecord::with_received_at(
        stored.class,
        stored.payload,
        received_at,
    ))
}

/// Result of validating a segment file on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentScan {
    /// Length of the prefix made of complete frames.
    pub valid_len: u64,
    pub file_len: u64,
    pub frames: u64,
    /// Complete frames whose checksum does not match. They stay in place and
    /// are skipped when read.
    pub corrupt_frames: u64,
}

impl SegmentScan {
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.file_len
    }
}

/// Walk every frame of a segment. Scanning stops at the first frame that
/// runs past the end of the file or declares an impossible length.
pub async fn scan_segment(path: &Path) -> Result<SegmentScan, QueueError> {
    let file = File::open(path).await?;
    let file_len = file.metadata().await?.len();
    let mut reader = BufReader::new(file);

    let mut scan = SegmentScan {
        valid_len: 0,
        file_len,
        frames: 0,
        corrupt_frames: 0,
    };
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut body = Vec::new();

    loop {
        let remaining = file_len - scan.valid_len;
        if remaining < FRAME_HEADER_LEN as u64 {
            break;
        }
        reader.read_exact(&mut header).await?;
        let frame = FrameHeader::parse(&header);
        if frame.body_len as usize > MAX_FRAME_BODY || frame.frame_len() > remaining {
            break;
        }

        body.resize(frame.body_len as usize, 0);
        reader.read_exact(&mut body).await?;
        if !frame.matches(&body) {
            scan.corrupt_frames += 1;
        }
        scan.frames += 1;
        scan.valid_len += frame.frame_len();
    }

    Ok(scan)
}

/// Flush directory entries so a newly created or renamed file survives a
/// power loss, not just its contents.
#[cfg(unix)]
pub async fn sync_dir(dir: &Path) -> Result<(), QueueError> {
    File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
pub async fn sync_dir(_dir: &Path) -> Result<(), QueueError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_roll_cycle_segment_boundaries() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 13, 42, 7).unwrap();
        let hourly = RollCycle::Hourly.segment_for(at);
        let daily = RollCycle::Daily.segment_for(at);

        assert_eq!(hourly.file_name(), "20240305-130000.seg");
        assert_eq!(daily.file_name(), "20240305-000000.seg");
        assert!(daily < hourly);
    }

    #[test]
    fn test_segment_file_name_round_trip() {
        let id = RollCycle::Hourly.segment_for(Utc.with_ymd_and_hms(2025, 1, 1, 23, 0, 0).unwrap());
        assert_eq!(SegmentId::from_file_name(&id.file_name()), Some(id));
        assert_eq!(SegmentId::from_file_name("tailer.cursor"), None);
        assert_eq!(SegmentId::from_file_name("garbage.seg"), None);
    }

    #[test]
    fn test_roll_cycle_parse_is_case_insensitive() {
        assert_eq!("DAILY".parse::<RollCycle>(), Ok(RollCycle::Daily));
        assert_eq!(RollCycle::parse_lenient("Hourly"), RollCycle::Hourly);
        assert_eq!(RollCycle::parse_lenient("weekly"), RollCycle::Hourly);
    }

    #[test]
    fn test_frame_checksum_detects_flipped_byte() {
        let record = TelemetryRecord::new(TelemetryClass::Trace, vec![1, 2, 3, 4]);
        let mut frame = encode_frame(&record).unwrap();

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let parsed = FrameHeader::parse(&header);
        assert_eq!(parsed.frame_len() as usize, frame.len());
        assert!(parsed.matches(&frame[FRAME_HEADER_LEN..]));

        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(!parsed.matches(&frame[FRAME_HEADER_LEN..]));
    }

    #[test]
    fn test_decode_preserves_record_fields() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let record = TelemetryRecord::with_received_at(TelemetryClass::Metric, vec![9; 32], at);
        let frame = encode_frame(&record).unwrap();

        let decoded = decode_body(&frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[tokio::test]
    async fn test_scan_stops_at_torn_tail() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("20240101-000000.seg");

        let first = encode_frame(&TelemetryRecord::new(TelemetryClass::Trace, vec![1; 10])).unwrap();
        let second = encode_frame(&TelemetryRecord::new(TelemetryClass::Trace, vec![2; 10])).unwrap();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second[..second.len() - 3]);
        tokio::fs::write(&path, &bytes).await.unwrap();

        let scan = scan_segment(&path).await.unwrap();
        assert_eq!(scan.frames, 1);
        assert_eq!(scan.valid_len, first.len() as u64);
        assert!(scan.has_torn_tail());
    }

    #[tokio::test]
    async fn test_sync_dir_flushes_existing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("20240101-000000.seg"), b"")
            .await
            .unwrap();
        sync_dir(dir.path()).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sync_dir_reports_missing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        assert!(matches!(sync_dir(&missing).await, Err(QueueError::Io(_))));
    }
}
