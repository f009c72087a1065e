//! Read/write behavior of the storage engine across MemTables and SSTables

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tempora_core::wal::{list_segments, segment_path, SyncPolicy};
use tempora_core::{
    CancellationToken, DataPoint, Point, StorageConfig, StorageEngine, StreamKey,
    StreamSelector, TemporaError, TimeRange, WriteBatch,
};

fn open(dir: &TempDir) -> StorageEngine {
    StorageEngine::open(StorageConfig::new(dir.path())).unwrap()
}

fn read(engine: &StorageEngine, selector: StreamSelector, range: TimeRange) -> Vec<Point> {
    engine
        .read(&selector, range)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

fn values(points: &[Point]) -> Vec<(i64, f64)> {
    points.iter().map(|p| (p.timestamp, p.value)).collect()
}

#[test]
fn test_read_spans_sstable_and_memtable() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let cpu = StreamKey::new("cpu").with_tag("host", "a");

    let batch = WriteBatch::new()
        .with(cpu.clone(), 1, 10.0)
        .with(cpu.clone(), 2, 20.0)
        .with(cpu.clone(), 3, 30.0);
    engine.write(&batch).unwrap();
    engine.flush().unwrap();

    engine
        .write(&WriteBatch::new().with(cpu.clone(), 4, 40.0).with(cpu.clone(), 5, 50.0))
        .unwrap();

    let points = read(&engine, StreamSelector::exact(cpu), TimeRange::new(2, 4));
    assert_eq!(values(&points), vec![(2, 20.0), (3, 30.0), (4, 40.0)]);
}

#[test]
fn test_merge_across_overlapping_sstables() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let a = StreamKey::new("cpu").with_tag("host", "a");
    let b = StreamKey::new("cpu").with_tag("host", "b");
    let mem = StreamKey::new("mem");

    let mut first = WriteBatch::new();
    for t in 1..=10 {
        first.push(a.clone(), DataPoint::new(t * 10, t as f64));
    }
    engine.write(&first).unwrap();
    engine.flush().unwrap();

    let mut second = WriteBatch::new();
    for t in 5..=15 {
        second.push(b.clone(), DataPoint::new(t * 10, 100.0 + t as f64));
    }
    engine.write(&second).unwrap();
    engine.flush().unwrap();

    engine
        .write(&WriteBatch::new().with(a.clone(), 110, 11.0).with(mem.clone(), 60, 0.5))
        .unwrap();
    assert_eq!(engine.stats().sstable_count, 2);

    let all = read(&engine, StreamSelector::All, TimeRange::all());
    assert_eq!(all.len(), 10 + 11 + 2);
    assert!(all.windows(2).all(|w| {
        w[0].timestamp < w[1].timestamp
            || (w[0].timestamp == w[1].timestamp && w[0].key < w[1].key)
    }));

    // Exactly the points inside the range, from every source
    let window = read(&engine, StreamSelector::series("cpu"), TimeRange::new(60, 110));
    let expected_a = (6..=11).count();
    let expected_b = (6..=11).count();
    assert_eq!(window.len(), expected_a + expected_b);
    assert!(window.iter().all(|p| (60..=110).contains(&p.timestamp)));
    assert!(window.iter().all(|p| p.key.name == "cpu"));

    let only_b = read(
        &engine,
        StreamSelector::series("cpu").with_tag("host", "b"),
        TimeRange::new(0, 60),
    );
    assert_eq!(values(&only_b), vec![(50, 105.0), (60, 106.0)]);
}

#[test]
fn test_randomized_streams_read_back_ascending() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::new(dir.path());
    config.wal.sync_policy = SyncPolicy::None;
    config.memtable_size_limit = 4096;
    config.sstable.block_points = 16;
    let engine = StorageEngine::open(config).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let keys: Vec<StreamKey> = (0..5)
        .map(|i| StreamKey::new("sensor").with_tag("id", i.to_string()))
        .collect();
    let mut expected: BTreeMap<StreamKey, Vec<(i64, f64)>> = BTreeMap::new();
    let mut clock = vec![0i64; keys.len()];

    for _ in 0..200 {
        let mut batch = WriteBatch::new();
        for _ in 0..rng.gen_range(1..8) {
            let i = rng.gen_range(0..keys.len());
            clock[i] += rng.gen_range(1..50);
            let value = rng.gen::<f64>();
            batch.push(keys[i].clone(), DataPoint::new(clock[i], value));
            expected.entry(keys[i].clone()).or_default().push((clock[i], value));
        }
        engine.write(&batch).unwrap();
        if rng.gen_bool(0.05) {
            engine.flush().unwrap();
        }
    }

    for (key, points) in &expected {
        let read_back = read(&engine, StreamSelector::exact(key.clone()), TimeRange::all());
        assert_eq!(&values(&read_back), points);
    }

    let lo = 200;
    let hi = 900;
    let ranged = read(&engine, StreamSelector::All, TimeRange::new(lo, hi));
    let expected_count: usize = expected
        .values()
        .map(|p| p.iter().filter(|(t, _)| (lo..=hi).contains(t)).count())
        .sum();
    assert_eq!(ranged.len(), expected_count);
    assert!(ranged.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[test]
fn test_cancelled_read_stops() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let key = StreamKey::new("m");

    let mut batch = WriteBatch::new();
    for t in 0..10_000 {
        batch.push(key.clone(), DataPoint::new(t, t as f64));
    }
    engine.write(&batch).unwrap();
    engine.flush().unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut scan = engine
        .read_with_cancel(&StreamSelector::All, TimeRange::all(), cancel)
        .unwrap();
    assert!(matches!(scan.next(), Some(Err(TemporaError::Cancelled))));
    assert!(scan.next().is_none());

    // Other reads are unaffected
    assert_eq!(read(&engine, StreamSelector::All, TimeRange::all()).len(), 10_000);
}

#[test]
fn test_concurrent_writers_on_distinct_streams() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig::new(dir.path());
    config.memtable_size_limit = 8 * 1024;
    let engine = Arc::new(StorageEngine::open(config).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let key = StreamKey::new("load").with_tag("worker", w.to_string());
                for t in 0..100 {
                    engine
                        .write(&WriteBatch::new().with(key.clone(), t, w as f64))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    engine.flush().unwrap();

    for w in 0..4 {
        let key = StreamKey::new("load").with_tag("worker", w.to_string());
        let points = read(&engine, StreamSelector::exact(key), TimeRange::all());
        let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
        assert_eq!(timestamps, (0..100).collect::<Vec<_>>());
    }
    assert_eq!(engine.stats().frozen_memtables, 0);
}

#[test]
fn test_describe_merges_sources() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let a = StreamKey::new("cpu").with_tag("host", "a");
    let b = StreamKey::new("disk");

    engine
        .write(&WriteBatch::new().with(a.clone(), 10, 1.0).with(b.clone(), 5, 1.0))
        .unwrap();
    engine.flush().unwrap();
    engine.write(&WriteBatch::new().with(a.clone(), 40, 2.0)).unwrap();

    let coverage = engine.describe();
    assert_eq!(coverage.len(), 2);
    assert_eq!(coverage[0].key, a);
    assert_eq!(coverage[0].range, TimeRange::new(10, 40));
    assert_eq!(coverage[0].points, 2);
    assert_eq!(coverage[1].key, b);
    assert_eq!(coverage[1].range, TimeRange::new(5, 5));
}

#[test]
fn test_rejected_batch_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let a = StreamKey::new("a");
    let b = StreamKey::new("b");

    engine.write(&WriteBatch::new().with(a.clone(), 10, 1.0)).unwrap();

    // The valid stream in a rejected batch is not applied either
    let batch = WriteBatch::new().with(b.clone(), 1, 1.0).with(a.clone(), 9, 2.0);
    let err = engine.write(&batch).unwrap_err();
    assert!(matches!(err, TemporaError::OutOfOrder { timestamp: 9, last: 10, .. }));

    assert!(read(&engine, StreamSelector::exact(b.clone()), TimeRange::all()).is_empty());
    engine.write(&WriteBatch::new().with(b, 1, 1.0)).unwrap();
}

/// Swap the SSTable directory for a plain file so every flush attempt fails
fn block_sstables(config: &StorageConfig) {
    let dir = config.sstable_dir();
    fs::remove_dir_all(&dir).unwrap();
    fs::write(&dir, b"not a directory").unwrap();
}

fn unblock_sstables(config: &StorageConfig) {
    let dir = config.sstable_dir();
    fs::remove_file(&dir).unwrap();
    fs::create_dir(&dir).unwrap();
}

fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for the flush worker");
        thread::sleep(Duration::from_millis(10));
    }
}

fn run(key: &StreamKey, start: i64, count: i64) -> WriteBatch {
    (start..start + count).fold(WriteBatch::new(), |batch, t| {
        batch.with(key.clone(), t, t as f64)
    })
}

fn failing_flush_config(dir: &Path) -> StorageConfig {
    let mut config = StorageConfig::new(dir);
    config.wal.sync_policy = SyncPolicy::None;
    config.flush.retry_interval = Duration::from_millis(10);
    config
}

#[test]
fn test_hard_limit_with_full_queue_rejects_write() {
    let dir = TempDir::new().unwrap();
    let mut config = failing_flush_config(dir.path());
    config.memtable_size_limit = 4096;
    config.memtable_hard_limit = 4096;
    config.flush.queue_depth = 1;
    config.flush.backpressure_timeout = Duration::from_millis(50);
    let engine = StorageEngine::open(config.clone()).unwrap();
    block_sstables(&config);
    let key = StreamKey::new("cpu");

    // Freezes the first MemTable, whose flush then fails and holds the only slot
    engine.write(&run(&key, 0, 400)).unwrap();
    wait_for(|| engine.stats().flush_failures > 0);
    // Lands in the fresh MemTable and pushes it past the hard limit
    engine.write(&run(&key, 400, 400)).unwrap();

    let before = engine.stats();
    assert_eq!(before.last_sequence, Some(2));
    assert_eq!(before.flush_queue_depth, 1);

    let err = engine.write(&run(&key, 800, 10)).unwrap_err();
    assert!(matches!(err, TemporaError::Capacity(_)), "{:?}", err);
    assert!(err.is_retryable());

    let after = engine.stats();
    assert_eq!(after.last_sequence, Some(2));
    assert_eq!(after.points_ingested, 800);
    let points = read(&engine, StreamSelector::All, TimeRange::all());
    assert_eq!(points.len(), 800);

    // Once flushes succeed again the same write goes through
    unblock_sstables(&config);
    wait_for(|| {
        let stats = engine.stats();
        stats.frozen_memtables == 0 && stats.flush_queue_depth == 0
    });
    engine.write(&run(&key, 800, 10)).unwrap();
    assert_eq!(engine.stats().last_sequence, Some(3));
}

#[test]
fn test_failed_flush_keeps_wal_until_retry_commits() {
    let dir = TempDir::new().unwrap();
    let config = failing_flush_config(dir.path());
    let engine = StorageEngine::open(config.clone()).unwrap();
    let key = StreamKey::new("cpu").with_tag("host", "a");

    engine.write(&run(&key, 0, 50)).unwrap();
    let segment = segment_path(&config.wal_dir(), list_segments(&config.wal_dir()).unwrap()[0]);
    block_sstables(&config);

    let err = engine.flush().unwrap_err();
    assert!(matches!(err, TemporaError::FlushFailed(_)), "{:?}", err);

    let stats = engine.stats();
    assert_eq!(stats.frozen_memtables, 1);
    assert_eq!(stats.sstable_count, 0);
    assert_eq!(stats.flushed_sequence, 0);
    assert!(stats.last_flush_error.is_some());
    assert!(segment.exists());
    assert_eq!(read(&engine, StreamSelector::All, TimeRange::all()).len(), 50);

    unblock_sstables(&config);
    wait_for(|| !segment.exists() && engine.stats().last_flush_error.is_none());

    let stats = engine.stats();
    assert_eq!(stats.sstable_count, 1);
    assert_eq!(stats.frozen_memtables, 0);
    assert_eq!(stats.flushed_sequence, 1);
    assert_eq!(stats.sstables_written, 1);
    assert_eq!(read(&engine, StreamSelector::All, TimeRange::all()).len(), 50);
    engine.close().unwrap();
    drop(engine);

    let engine = StorageEngine::open(config).unwrap();
    assert_eq!(read(&engine, StreamSelector::All, TimeRange::all()).len(), 50);
}
