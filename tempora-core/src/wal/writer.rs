//! WAL writer implementation

use super::record::{encode_segment_header, WalRecord, SEGMENT_HEADER_SIZE};
use super::{
    damaged_segment_path, list_segments, segment_path, Replay, SegmentInfo, SyncPolicy, WalConfig,
};
use crate::{sync_dir, Result, WriteBatch};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// WAL writer for appending records to disk
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    active: SegmentInfo,
    bytes_written: usize,
    opened_at: Instant,
    sealed: Vec<SegmentInfo>,
    next_sequence: u64,
    writes_since_sync: usize,
    last_sync: Instant,
    /// Record bytes appended since open, across segments
    appended: u64,
    /// Set when a write failed midway; the next append starts a new segment
    poisoned: bool,
}

impl WalWriter {
    /// Open the WAL for appending after `replay` has been taken.
    ///
    /// Cuts off any torn tail found by the replay, keeps the replayed
    /// segments as sealed, and starts a fresh segment. Sequence numbers
    /// continue after both the replayed records and `next_sequence`.
    pub fn open(config: WalConfig, replay: &Replay, next_sequence: u64) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let mut sealed = replay.segments.clone();
        if let Some(tail) = replay.torn_tail {
            let path = segment_path(&config.dir, tail.segment_id);
            if tail.offset < SEGMENT_HEADER_SIZE as u64 {
                fs::remove_file(&path)?;
                sealed.retain(|s| s.id != tail.segment_id);
            } else {
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(tail.offset)?;
                file.sync_all()?;
            }
            warn!(
                segment = tail.segment_id,
                offset = tail.offset,
                discarded = tail.discarded,
                "Truncated torn WAL tail"
            );
        }

        let on_disk = list_segments(&config.dir)?;
        let segment_id = on_disk
            .iter()
            .chain(sealed.iter().map(|s| &s.id))
            .max()
            .map_or(1, |id| id + 1);
        let file = Self::create_segment(&config.dir, segment_id)?;

        let next_sequence = replay
            .last_sequence()
            .map_or(next_sequence, |last| next_sequence.max(last + 1))
            .max(1);

        info!(
            segment = segment_id,
            next_sequence,
            sealed = sealed.len(),
            "Opened WAL"
        );

        let now = Instant::now();
        Ok(Self {
            config,
            inner: Mutex::new(WalWriterInner {
                file: BufWriter::new(file),
                active: SegmentInfo::empty(segment_id),
                bytes_written: SEGMENT_HEADER_SIZE,
                opened_at: now,
                sealed,
                next_sequence,
                writes_since_sync: 0,
                last_sync: now,
                appended: 0,
                poisoned: false,
            }),
        })
    }

    /// Append a batch and return its sequence number.
    ///
    /// With `SyncPolicy::Immediate` the record is on stable storage when
    /// this returns.
    pub fn append(&self, batch: &WriteBatch) -> Result<u64> {
        let mut inner = self.inner.lock();
        let sequence = inner.next_sequence;
        let encoded = WalRecord::encode(sequence, batch)?;

        if inner.poisoned || self.should_rotate(&inner, encoded.len()) {
            self.rotate_segment(&mut inner)?;
        }

        // A failed sequence is never reused, even if part of it reached disk
        inner.next_sequence += 1;

        if let Err(e) = self.write_record(&mut inner, &encoded) {
            inner.poisoned = true;
            return Err(e.into());
        }

        inner.bytes_written += encoded.len();
        inner.appended += encoded.len() as u64;
        inner.active.record(sequence);
        Ok(sequence)
    }

    /// Seal the active segment if it holds any record and start a new one.
    ///
    /// Returns the id of the segment that receives the next append.
    pub fn rotate(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.active.last_sequence.is_some() || inner.poisoned {
            self.rotate_segment(&mut inner)?;
        }
        Ok(inner.active.id)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.get_ref().sync_data()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    /// Delete every sealed segment whose records all have a sequence
    /// number at or below `flushed`. Returns the retired segment ids.
    ///
    /// Segments that replay found damaged are renamed aside instead of
    /// deleted, keeping the bytes it could not read.
    pub fn retire_through(&self, flushed: u64) -> Result<Vec<u64>> {
        let retired = {
            let mut inner = self.inner.lock();
            let (retired, kept): (Vec<SegmentInfo>, Vec<SegmentInfo>) = inner
                .sealed
                .drain(..)
                .partition(|s| s.is_covered_by(flushed));
            inner.sealed = kept;
            retired
        };

        if retired.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(retired.len());
        for segment in retired {
            let path = segment_path(&self.config.dir, segment.id);
            let outcome = if segment.damaged {
                let aside = damaged_segment_path(&self.config.dir, segment.id);
                warn!(segment = segment.id, path = %aside.display(), "Setting damaged WAL segment aside");
                fs::rename(&path, &aside)
            } else {
                fs::remove_file(&path)
            };
            match outcome {
                Ok(()) => ids.push(segment.id),
                Err(e) if e.kind() == io::ErrorKind::NotFound => ids.push(segment.id),
                // Left on disk; replay finds it covered and it is retired next run
                Err(e) => warn!(segment = segment.id, "Failed to delete WAL segment: {}", e),
            }
        }
        sync_dir(&self.config.dir)?;

        info!(flushed, segments = ?ids, "Retired WAL segments");
        Ok(ids)
    }

    /// Id of the segment currently receiving appends
    pub fn active_segment(&self) -> u64 {
        self.inner.lock().active.id
    }

    /// Sealed segments followed by the active one
    pub fn segments(&self) -> Vec<SegmentInfo> {
        let inner = self.inner.lock();
        let mut segments = inner.sealed.clone();
        segments.push(inner.active);
        segments
    }

    /// Record bytes appended since the WAL was opened
    pub fn bytes_appended(&self) -> u64 {
        self.inner.lock().appended
    }

    /// Last sequence number handed out, if any
    pub fn last_sequence(&self) -> Option<u64> {
        self.inner.lock().next_sequence.checked_sub(1).filter(|s| *s > 0)
    }

    fn should_rotate(&self, inner: &WalWriterInner, incoming: usize) -> bool {
        if inner.active.last_sequence.is_none() {
            return false;
        }
        inner.bytes_written + incoming > self.config.segment_size
            || inner.opened_at.elapsed() >= self.config.segment_age
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn write_record(&self, inner: &mut WalWriterInner, encoded: &[u8]) -> io::Result<()> {
        inner.file.write_all(encoded)?;
        inner.writes_since_sync += 1;

        if self.should_sync(inner) {
            inner.file.flush()?;
            inner.file.get_ref().sync_data()?;
            inner.writes_since_sync = 0;
            inner.last_sync = Instant::now();
        }
        Ok(())
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<()> {
        if !inner.poisoned {
            inner.file.flush()?;
            inner.file.get_ref().sync_all()?;
        }

        let segment_id = inner.active.id + 1;
        let file = Self::create_segment(&self.config.dir, segment_id)?;

        // Bytes still buffered from a failed write are discarded, not flushed
        let previous = std::mem::replace(&mut inner.file, BufWriter::new(file));
        let (_previous, _unwritten) = previous.into_parts();

        let sealed = std::mem::replace(&mut inner.active, SegmentInfo::empty(segment_id));
        inner.sealed.push(sealed);
        inner.bytes_written = SEGMENT_HEADER_SIZE;
        inner.opened_at = Instant::now();
        inner.writes_since_sync = 0;
        inner.poisoned = false;

        info!(
            sealed = sealed.id,
            segment = segment_id,
            "Rotated WAL segment"
        );
        Ok(())
    }

    fn create_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(segment_path(dir, segment_id))?;
        file.write_all(&encode_segment_header(segment_id))?;
        file.sync_all()?;
        sync_dir(dir)?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalReader;
    use crate::StreamKey;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, segment_size: usize) -> WalConfig {
        WalConfig {
            dir: dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
            segment_size,
            ..Default::default()
        }
    }

    fn batch(i: i64) -> WriteBatch {
        WriteBatch::new().with(StreamKey::new("temp").with_tag("id", "1"), i, i as f64)
    }

    #[test]
    fn test_wal_writer() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::open(config(&temp_dir, 1024), &Replay::default(), 1).unwrap();

        assert_eq!(writer.last_sequence(), None);
        assert_eq!(writer.append(&batch(1)).unwrap(), 1);
        assert_eq!(writer.append(&batch(2)).unwrap(), 2);
        assert_eq!(writer.last_sequence(), Some(2));
        let record_len = WalRecord::encode(1, &batch(1)).unwrap().len() as u64;
        assert_eq!(writer.bytes_appended(), 2 * record_len);
        writer.sync().unwrap();

        let segments = writer.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].first_sequence, Some(1));
        assert_eq!(segments[0].last_sequence, Some(2));
    }

    #[test]
    fn test_size_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::open(config(&temp_dir, 256), &Replay::default(), 1).unwrap();

        for i in 0..20 {
            writer.append(&batch(i)).unwrap();
        }

        let segments = writer.segments();
        assert!(segments.len() > 1);
        assert_eq!(list_segments(temp_dir.path()).unwrap().len(), segments.len());

        // Segments cover consecutive, non-overlapping sequence ranges
        for pair in segments.windows(2) {
            if let (Some(last), Some(first)) = (pair[0].last_sequence, pair[1].first_sequence) {
                assert_eq!(last + 1, first);
            }
        }
    }

    #[test]
    fn test_age_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(&temp_dir, usize::MAX);
        config.segment_age = Duration::ZERO;
        let writer = WalWriter::open(config, &Replay::default(), 1).unwrap();

        writer.append(&batch(1)).unwrap();
        writer.append(&batch(2)).unwrap();
        assert_eq!(writer.segments().len(), 2);
    }

    #[test]
    fn test_rotate_skips_empty_segment() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::open(config(&temp_dir, 1024), &Replay::default(), 1).unwrap();

        let first = writer.active_segment();
        assert_eq!(writer.rotate().unwrap(), first);

        writer.append(&batch(1)).unwrap();
        assert_eq!(writer.rotate().unwrap(), first + 1);
        assert_eq!(writer.segments().len(), 2);
    }

    #[test]
    fn test_retire_through() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::open(config(&temp_dir, 1 << 20), &Replay::default(), 1).unwrap();

        writer.append(&batch(1)).unwrap();
        writer.append(&batch(2)).unwrap();
        writer.rotate().unwrap();
        writer.append(&batch(3)).unwrap();
        writer.rotate().unwrap();
        writer.append(&batch(4)).unwrap();

        assert!(writer.retire_through(1).unwrap().is_empty());
        assert_eq!(writer.retire_through(2).unwrap().len(), 1);
        assert_eq!(list_segments(temp_dir.path()).unwrap().len(), 2);

        // The active segment is never retired
        assert_eq!(writer.retire_through(10).unwrap().len(), 1);
        assert_eq!(writer.segments().len(), 1);
        assert_eq!(list_segments(temp_dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_damaged_segment_is_set_aside() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir, 1 << 20);
        {
            let writer = WalWriter::open(config.clone(), &Replay::default(), 1).unwrap();
            writer.append(&batch(1)).unwrap();
            writer.append(&batch(2)).unwrap();
        }

        let segment = list_segments(temp_dir.path()).unwrap()[0];
        let path = segment_path(temp_dir.path(), segment);
        let mut data = fs::read(&path).unwrap();
        data[0] = b'X';
        fs::write(&path, &data).unwrap();

        let replay = WalReader::new(config.clone()).replay().unwrap();
        assert_eq!(replay.records.len(), 2);
        assert!(replay.segments[0].damaged);

        let writer = WalWriter::open(config, &replay, 1).unwrap();
        assert!(writer.retire_through(1).unwrap().is_empty());
        assert!(path.exists());

        assert_eq!(writer.retire_through(2).unwrap(), vec![segment]);
        assert!(!path.exists());
        assert_eq!(
            fs::read(damaged_segment_path(temp_dir.path(), segment)).unwrap(),
            data
        );
        assert_eq!(list_segments(temp_dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_continues_sequence_and_truncates_tail() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir, 1 << 20);
        {
            let writer = WalWriter::open(config.clone(), &Replay::default(), 1).unwrap();
            for i in 0..3 {
                writer.append(&batch(i)).unwrap();
            }
        }

        let segment = list_segments(temp_dir.path()).unwrap()[0];
        let path = segment_path(temp_dir.path(), segment);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let replay = WalReader::new(config.clone()).replay().unwrap();
        let tail = replay.torn_tail.unwrap();
        let writer = WalWriter::open(config.clone(), &replay, 1).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), tail.offset);
        assert_eq!(writer.append(&batch(9)).unwrap(), 4);
        assert_ne!(writer.active_segment(), segment);
        drop(writer);

        let replay = WalReader::new(config).replay().unwrap();
        assert_eq!(replay.records.len(), 4);
        assert!(replay.corrupt.is_empty());
        assert!(replay.torn_tail.is_none());
    }

    #[test]
    fn test_sequence_floor() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::open(config(&temp_dir, 1024), &Replay::default(), 50).unwrap();
        assert_eq!(writer.append(&batch(1)).unwrap(), 50);
    }
}
