//! Crash recovery: WAL replay, torn tails, corruption and the manifest

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tempfile::TempDir;
use tempora_core::sstable::sstable_path;
use tempora_core::wal::{
    damaged_segment_path, list_segments, segment_path, WalConfig, WalReader, WalRecord,
    RECORD_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};
use tempora_core::{
    Point, StorageConfig, StorageEngine, StreamKey, StreamSelector, TimeRange, WriteBatch,
};

fn open(dir: &TempDir) -> StorageEngine {
    StorageEngine::open(StorageConfig::new(dir.path())).unwrap()
}

fn read_all(engine: &StorageEngine) -> Vec<(String, i64, f64)> {
    engine
        .read(&StreamSelector::All, TimeRange::all())
        .unwrap()
        .map(|p| p.unwrap())
        .map(|p: Point| (p.key.canonical(), p.timestamp, p.value))
        .collect()
}

fn newest_segment(dir: &TempDir) -> PathBuf {
    let wal_dir = StorageConfig::new(dir.path()).wal_dir();
    let ids = list_segments(&wal_dir).unwrap();
    segment_path(&wal_dir, *ids.last().unwrap())
}

fn batch(name: &str, timestamp: i64, value: f64) -> WriteBatch {
    WriteBatch::new().with(StreamKey::new(name), timestamp, value)
}

#[test]
fn test_acknowledged_writes_survive_restart() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        for t in 1..=20 {
            engine.write(&batch("m", t, t as f64)).unwrap();
        }
    }

    let engine = open(&dir);
    let points = read_all(&engine);
    assert_eq!(points.len(), 20);
    assert_eq!(points[19], ("m".to_string(), 20, 20.0));
    assert_eq!(engine.stats().last_sequence, Some(20));

    // Per-stream ordering is rebuilt from the replayed points
    assert!(engine.write(&batch("m", 20, 0.0)).unwrap_err().is_validation());
    engine.write(&batch("m", 21, 21.0)).unwrap();
}

#[test]
fn test_flushed_and_unflushed_data_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        let cpu = StreamKey::new("cpu").with_tag("host", "a");
        engine
            .write(
                &WriteBatch::new()
                    .with(cpu.clone(), 1, 10.0)
                    .with(cpu.clone(), 2, 20.0)
                    .with(cpu.clone(), 3, 30.0),
            )
            .unwrap();
        engine.flush().unwrap();
        engine
            .write(&WriteBatch::new().with(cpu.clone(), 4, 40.0).with(cpu, 5, 50.0))
            .unwrap();
    }

    let engine = open(&dir);
    let stats = engine.stats();
    assert_eq!(stats.sstable_count, 1);
    assert_eq!(stats.flushed_sequence, 1);
    assert_eq!(stats.active_memtable_points, 2);

    // No point is replayed twice
    let timestamps: Vec<i64> = read_all(&engine).iter().map(|p| p.1).collect();
    assert_eq!(timestamps, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_memtable_wins_duplicate_after_restart() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.write(&batch("temp", 100, 1.0)).unwrap();
        engine.flush().unwrap();
    }

    {
        let engine = open(&dir);
        // Only this process's writes count for ordering
        engine.write(&batch("temp", 100, 2.0)).unwrap();
        assert_eq!(read_all(&engine), vec![("temp".to_string(), 100, 2.0)]);
    }

    // Still resolved the same way once replayed from the WAL
    let engine = open(&dir);
    assert_eq!(read_all(&engine), vec![("temp".to_string(), 100, 2.0)]);
}

#[test]
fn test_torn_tail_is_discarded() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        for t in 1..=3 {
            engine.write(&batch("m", t, t as f64)).unwrap();
        }
    }

    let segment = newest_segment(&dir);
    let len = fs::metadata(&segment).unwrap().len();
    let file = OpenOptions::new().write(true).open(&segment).unwrap();
    file.set_len(len - 3).unwrap();
    drop(file);

    let engine = open(&dir);
    let timestamps: Vec<i64> = read_all(&engine).iter().map(|p| p.1).collect();
    assert_eq!(timestamps, vec![1, 2]);

    // The lost write can be made again and survives the next restart
    engine.write(&batch("m", 3, 33.0)).unwrap();
    drop(engine);
    let engine = open(&dir);
    assert_eq!(read_all(&engine).last().unwrap().2, 33.0);
}

#[test]
fn test_bit_flipped_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    let batches = [batch("a", 1, 1.0), batch("b", 2, 2.0), batch("c", 3, 3.0)];
    {
        let engine = open(&dir);
        for b in &batches {
            engine.write(b).unwrap();
        }
    }

    let first_len = WalRecord::encode(1, &batches[0]).unwrap().len();
    let offset = SEGMENT_HEADER_SIZE + first_len + RECORD_HEADER_SIZE + 2;
    let segment = newest_segment(&dir);
    let mut bytes = fs::read(&segment).unwrap();
    bytes[offset] ^= 0x40;
    fs::write(&segment, &bytes).unwrap();

    let wal_config = WalConfig {
        dir: StorageConfig::new(dir.path()).wal_dir(),
        ..WalConfig::default()
    };
    let replay = WalReader::new(wal_config).replay().unwrap();
    assert_eq!(replay.records.len(), 2);
    assert_eq!(replay.corrupt.len(), 1);
    assert_eq!(replay.corrupt[0].offset, (SEGMENT_HEADER_SIZE + first_len) as u64);
    assert!(replay.torn_tail.is_none());

    let engine = open(&dir);
    let names: Vec<String> = read_all(&engine).into_iter().map(|p| p.0).collect();
    assert_eq!(names, vec!["a", "c"]);
}

#[test]
fn test_flipped_length_prefix_keeps_later_records() {
    let dir = TempDir::new().unwrap();
    let batches: Vec<WriteBatch> = (1..=5).map(|t| batch("m", t, t as f64)).collect();
    {
        let engine = open(&dir);
        for b in &batches {
            engine.write(b).unwrap();
        }
    }

    // High byte of the second record's length prefix
    let first_len = WalRecord::encode(1, &batches[0]).unwrap().len();
    let segment = newest_segment(&dir);
    let mut bytes = fs::read(&segment).unwrap();
    bytes[SEGMENT_HEADER_SIZE + first_len + 3] ^= 0x40;
    fs::write(&segment, &bytes).unwrap();

    let engine = open(&dir);
    let timestamps: Vec<i64> = read_all(&engine).into_iter().map(|p| p.1).collect();
    assert_eq!(timestamps, vec![1, 3, 4, 5]);
    assert_eq!(engine.stats().last_sequence, Some(5));
    // Nothing after the damaged record was cut off
    assert_eq!(fs::read(&segment).unwrap(), bytes);
}

#[test]
fn test_damaged_segment_header_keeps_its_records() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        for t in 1..=3 {
            engine.write(&batch("m", t, t as f64)).unwrap();
        }
    }
    {
        let engine = open(&dir);
        engine.write(&batch("m", 4, 4.0)).unwrap();
    }

    let wal_dir = StorageConfig::new(dir.path()).wal_dir();
    let oldest = list_segments(&wal_dir).unwrap()[0];
    let path = segment_path(&wal_dir, oldest);
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] = b'X';
    fs::write(&path, &bytes).unwrap();

    let engine = open(&dir);
    let timestamps: Vec<i64> = read_all(&engine).into_iter().map(|p| p.1).collect();
    assert_eq!(timestamps, vec![1, 2, 3, 4]);
    assert!(path.exists());

    // Once flushed, the damaged segment is set aside rather than deleted
    engine.flush().unwrap();
    assert!(!path.exists());
    assert_eq!(fs::read(damaged_segment_path(&wal_dir, oldest)).unwrap(), bytes);
    drop(engine);

    let engine = open(&dir);
    let timestamps: Vec<i64> = read_all(&engine).into_iter().map(|p| p.1).collect();
    assert_eq!(timestamps, vec![1, 2, 3, 4]);
}

#[test]
fn test_startup_removes_unreferenced_files() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.write(&batch("m", 1, 1.0)).unwrap();
        engine.flush().unwrap();
    }

    let sst_dir = StorageConfig::new(dir.path()).sstable_dir();
    let orphan = sstable_path(&sst_dir, 99);
    let leftover = sst_dir.join("00000000000000000002.sst.tmp");
    fs::write(&orphan, b"not an sstable").unwrap();
    fs::write(&leftover, b"partial").unwrap();

    let engine = open(&dir);
    assert!(!orphan.exists());
    assert!(!leftover.exists());
    assert!(sstable_path(&sst_dir, 1).exists());
    assert_eq!(read_all(&engine).len(), 1);
}

#[test]
fn test_corrupt_sstable_is_set_aside() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open(&dir);
        engine.write(&batch("m", 1, 1.0)).unwrap();
        engine.flush().unwrap();
        engine.write(&batch("m", 2, 2.0)).unwrap();
    }

    let sst_dir = StorageConfig::new(dir.path()).sstable_dir();
    let path = sstable_path(&sst_dir, 1);
    let mut bytes = fs::read(&path).unwrap();
    bytes[10] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let engine = open(&dir);
    assert_eq!(engine.stats().sstable_count, 0);
    assert!(!path.exists());
    assert!(path.with_extension("sst.corrupt").exists());

    // Unflushed data is still recovered from the WAL
    assert_eq!(read_all(&engine), vec![("m".to_string(), 2, 2.0)]);
}

#[test]
fn test_flushed_segments_are_retired() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    for t in 1..=5 {
        engine.write(&batch("m", t, t as f64)).unwrap();
    }
    engine.flush().unwrap();

    let wal_dir = StorageConfig::new(dir.path()).wal_dir();
    let segments = list_segments(&wal_dir).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(engine.stats().wal_segments, 1);
}
