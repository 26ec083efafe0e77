use chrono::{Duration as ChronoDuration, Utc};
use rask_telemetry_forwarder::buffer::{DurableQueue, QueueError, QueueSet, RollCycle};
use rask_telemetry_forwarder::domain::{TelemetryClass, TelemetryRecord};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn trace(payload: &[u8]) -> TelemetryRecord {
    TelemetryRecord::new(TelemetryClass::Trace, payload.to_vec())
}

async fn open_traces(dir: &Path) -> DurableQueue {
    DurableQueue::open(dir, TelemetryClass::Trace, RollCycle::Hourly)
        .await
        .unwrap()
}

fn segment_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "seg"))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_appended_records_survive_crash_and_drain_once() {
    let temp_dir = TempDir::new().unwrap();

    let queue = open_traces(temp_dir.path()).await;
    for payload in [b"r1", b"r2", b"r3"] {
        queue.append(&trace(payload)).await.unwrap();
    }
    // No close: dropping the handle stands in for a crash.
    drop(queue);

    let queue = open_traces(temp_dir.path()).await;
    assert!(queue.has_available());
    let drained = queue.read_batch(10).await.unwrap().unwrap();
    let payloads: Vec<&[u8]> = drained
        .batch
        .records()
        .iter()
        .map(|r| r.record.payload.as_slice())
        .collect();
    assert_eq!(payloads, vec![b"r1".as_slice(), b"r2", b"r3"]);

    let committed = queue.acknowledge(drained.ticket).await.unwrap();
    assert!(committed.is_some());
    assert!(queue.read_batch(10).await.unwrap().is_none());
    assert!(!queue.has_available());
    drop(queue);

    let queue = open_traces(temp_dir.path()).await;
    assert!(!queue.has_available());
    assert!(queue.read_batch(10).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unacknowledged_batch_is_replayed_after_restart() {
    let temp_dir = TempDir::new().unwrap();

    let queue = open_traces(temp_dir.path()).await;
    for payload in [b"a", b"b", b"c", b"d"] {
        queue.append(&trace(payload)).await.unwrap();
    }

    let first = queue.read_batch(2).await.unwrap().unwrap();
    queue.acknowledge(first.ticket).await.unwrap();
    let second = queue.read_batch(2).await.unwrap().unwrap();
    assert_eq!(second.batch.size(), 2);
    assert_eq!(queue.unacknowledged(), 1);
    drop(second);
    queue.close().await.unwrap();
    drop(queue);

    let queue = open_traces(temp_dir.path()).await;
    let replayed = queue.read_batch(10).await.unwrap().unwrap();
    let payloads: Vec<&[u8]> = replayed
        .batch
        .records()
        .iter()
        .map(|r| r.record.payload.as_slice())
        .collect();
    assert_eq!(payloads, vec![b"c".as_slice(), b"d"]);
}

#[tokio::test]
async fn test_acknowledge_after_close_is_refused_and_batch_replays() {
    let temp_dir = TempDir::new().unwrap();
    let cursor_path = temp_dir.path().join("tailer.cursor");

    let queue = open_traces(temp_dir.path()).await;
    for payload in [b"x", b"y", b"z"] {
        queue.append(&trace(payload)).await.unwrap();
    }
    let first = queue.read_batch(1).await.unwrap().unwrap();
    queue.acknowledge(first.ticket).await.unwrap();
    let cursor_before = std::fs::read(&cursor_path).unwrap();

    let late = queue.read_batch(2).await.unwrap().unwrap();
    queue.close().await.unwrap();
    let result = queue.acknowledge(late.ticket).await;
    assert!(matches!(result, Err(QueueError::Closed)), "{result:?}");
    assert_eq!(std::fs::read(&cursor_path).unwrap(), cursor_before);
    assert_eq!(segment_files(temp_dir.path()).len(), 1);
    drop(queue);

    let queue = open_traces(temp_dir.path()).await;
    let replayed = queue.read_batch(10).await.unwrap().unwrap();
    let payloads: Vec<&[u8]> = replayed
        .batch
        .records()
        .iter()
        .map(|r| r.record.payload.as_slice())
        .collect();
    assert_eq!(payloads, vec![b"y".as_slice(), b"z"]);
}

#[tokio::test]
async fn test_out_of_order_acknowledgement_commits_contiguous_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_traces(temp_dir.path()).await;
    for i in 0..4u8 {
        queue.append(&trace(&[i])).await.unwrap();
    }

    let first = queue.read_batch(2).await.unwrap().unwrap();
    let second = queue.read_batch(2).await.unwrap().unwrap();
    let second_end = second.ticket.end();

    // The later batch finishes first: nothing can be committed yet.
    assert_eq!(queue.acknowledge(second.ticket).await.unwrap(), None);
    assert_eq!(queue.committed_position().await, None);

    let committed = queue.acknowledge(first.ticket).await.unwrap();
    assert_eq!(committed, Some(second_end));
    assert_eq!(queue.committed_position().await, Some(second_end));
    assert_eq!(queue.unacknowledged(), 0);
}

#[tokio::test]
async fn test_drain_never_exceeds_batch_size() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_traces(temp_dir.path()).await;
    for i in 0..7u8 {
        queue.append(&trace(&[i])).await.unwrap();
    }

    let mut sizes = Vec::new();
    while let Some(drained) = queue.read_batch(3).await.unwrap() {
        assert!(drained.batch.size() <= 3);
        sizes.push(drained.batch.size());
        queue.acknowledge(drained.ticket).await.unwrap();
    }
    assert_eq!(sizes, vec![3, 3, 1]);
}

#[tokio::test]
async fn test_read_next_returns_single_records_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_traces(temp_dir.path()).await;
    queue.append(&trace(b"first")).await.unwrap();
    queue.append(&trace(b"second")).await.unwrap();

    let one = queue.read_next().await.unwrap().unwrap();
    assert_eq!(one.batch.size(), 1);
    assert_eq!(one.batch.records()[0].record.payload, b"first");
    let two = queue.read_next().await.unwrap().unwrap();
    assert_eq!(two.batch.records()[0].record.payload, b"second");
    assert!(queue.read_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_torn_tail_is_truncated_on_open() {
    let temp_dir = TempDir::new().unwrap();

    let queue = open_traces(temp_dir.path()).await;
    queue.append(&trace(b"complete-1")).await.unwrap();
    queue.append(&trace(b"complete-2")).await.unwrap();
    let committed_len = queue.disk_usage();
    queue.close().await.unwrap();
    drop(queue);

    // A crash in the middle of a write leaves half a frame behind.
    let segment = segment_files(temp_dir.path()).pop().unwrap();
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[0x2a, 0x00, 0x00, 0x00, 0x01, 0x02]).unwrap();
    }

    let queue = open_traces(temp_dir.path()).await;
    assert_eq!(std::fs::metadata(&segment).unwrap().len(), committed_len);
    queue.append(&trace(b"after-crash")).await.unwrap();

    let drained = queue.read_batch(10).await.unwrap().unwrap();
    let payloads: Vec<&[u8]> = drained
        .batch
        .records()
        .iter()
        .map(|r| r.record.payload.as_slice())
        .collect();
    assert_eq!(
        payloads,
        vec![b"complete-1".as_slice(), b"complete-2", b"after-crash"]
    );
}

#[tokio::test]
async fn test_corrupt_frame_is_skipped() {
    let temp_dir = TempDir::new().unwrap();

    let queue = open_traces(temp_dir.path()).await;
    queue.append(&trace(b"damaged")).await.unwrap();
    queue.append(&trace(b"intact")).await.unwrap();
    queue.close().await.unwrap();
    drop(queue);

    // Flip a byte inside the first frame body (after the 12 byte header).
    let segment = segment_files(temp_dir.path()).pop().unwrap();
    let mut bytes = std::fs::read(&segment).unwrap();
    bytes[14] ^= 0xFF;
    std::fs::write(&segment, &bytes).unwrap();

    let queue = open_traces(temp_dir.path()).await;
    let drained = queue.read_batch(10).await.unwrap().unwrap();
    assert_eq!(drained.batch.size(), 1);
    assert_eq!(drained.batch.records()[0].record.payload, b"intact");
}

#[tokio::test]
async fn test_roll_cycle_spreads_records_across_segments() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_traces(temp_dir.path()).await;

    let earlier = Utc::now() - ChronoDuration::hours(3);
    let later = Utc::now();
    queue
        .append(&TelemetryRecord::with_received_at(
            TelemetryClass::Trace,
            b"old".to_vec(),
            earlier,
        ))
        .await
        .unwrap();
    queue
        .append(&TelemetryRecord::with_received_at(
            TelemetryClass::Trace,
            b"new".to_vec(),
            later,
        ))
        .await
        .unwrap();
    assert_eq!(queue.segment_count(), 2);
    assert_eq!(segment_files(temp_dir.path()).len(), 2);

    let drained = queue.read_batch(10).await.unwrap().unwrap();
    let payloads: Vec<&[u8]> = drained
        .batch
        .records()
        .iter()
        .map(|r| r.record.payload.as_slice())
        .collect();
    assert_eq!(payloads, vec![b"old".as_slice(), b"new"]);
    assert_ne!(
        drained.batch.records()[0].position.segment,
        drained.batch.records()[1].position.segment
    );
}

#[tokio::test]
async fn test_acknowledged_segments_are_reclaimed() {
    let temp_dir = TempDir::new().unwrap();
    let queue = open_traces(temp_dir.path()).await;

    let earlier = Utc::now() - ChronoDuration::hours(2);
    queue
        .append(&TelemetryRecord::with_received_at(
            TelemetryClass::Trace,
            b"old".to_vec(),
            earlier,
        ))
        .await
        .unwrap();
    queue.append(&trace(b"new")).await.unwrap();
    assert_eq!(queue.segment_count(), 2);

    let first = queue.read_batch(1).await.unwrap().unwrap();
    queue.acknowledge(first.ticket).await.unwrap();
    // The cursor still sits in the old segment.
    assert_eq!(queue.segment_count(), 2);

    let second = queue.read_batch(1).await.unwrap().unwrap();
    queue.acknowledge(second.ticket).await.unwrap();
    assert_eq!(queue.segment_count(), 1);
    assert_eq!(segment_files(temp_dir.path()).len(), 1);
}

#[tokio::test]
async fn test_concurrent_appends_keep_every_record() {
    let temp_dir = TempDir::new().unwrap();
    let queue = Arc::new(open_traces(temp_dir.path()).await);

    let handles: Vec<_> = (0..8u8)
        .map(|writer| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..25u8 {
                    queue.append(&trace(&[writer, i])).await.unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut seen = Vec::new();
    while let Some(drained) = queue.read_batch(64).await.unwrap() {
        for queued in drained.batch.records() {
            seen.push((queued.position, queued.record.payload.clone()));
        }
        queue.acknowledge(drained.ticket).await.unwrap();
    }

    assert_eq!(seen.len(), 200);
    assert!(seen.windows(2).all(|pair| pair[0].0 < pair[1].0));
    // Each writer's own records keep their order.
    for writer in 0..8u8 {
        let order: Vec<u8> = seen
            .iter()
            .filter(|(_, payload)| payload[0] == writer)
            .map(|(_, payload)| payload[1])
            .collect();
        assert_eq!(order, (0..25).collect::<Vec<u8>>());
    }
}

#[tokio::test]
async fn test_classes_use_independent_queues() {
    let temp_dir = TempDir::new().unwrap();
    let queues = QueueSet::open(temp_dir.path(), RollCycle::Hourly).await.unwrap();

    queues
        .get(TelemetryClass::Trace)
        .append(&trace(b"span"))
        .await
        .unwrap();
    assert!(queues.get(TelemetryClass::Trace).has_available());
    assert!(!queues.get(TelemetryClass::Metric).has_available());

    assert!(temp_dir.path().join("traces").is_dir());
    assert!(temp_dir.path().join("metrics").is_dir());

    let drained = queues
        .get(TelemetryClass::Trace)
        .read_batch(10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(drained.batch.class(), TelemetryClass::Trace);
    assert!(
        queues
            .get(TelemetryClass::Metric)
            .read_batch(10)
            .await
            .unwrap()
            .is_none()
    );

    queues.close_all().await.unwrap();
    assert!(queues.iter().all(|q| q.is_closed()));
}
