//! Storage engine - top-level coordinator

use super::manifest::{remove_if_exists, Manifest, ManifestStore};
use super::scan::RangeScan;
use super::StorageConfig;
use crate::catalog::Catalog;
use crate::flush::{FlushCoordinator, FlushHandler, FlushNotifier, FlushSlot};
use crate::memtable::{check_ascending, MemTable};
use crate::sstable::{list_dir, sstable_path, write_memtable, SSTable};
use crate::wal::{Replay, WalConfig, WalReader, WalWriter};
use crate::{
    CancellationToken, Result, StreamCoverage, StreamKey, StreamSelector, TemporaError,
    TimeRange, Timestamp, WriteBatch,
};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State the flush worker shares with the foreground
struct EngineShared {
    config: StorageConfig,
    wal: WalWriter,
    catalog: Catalog,
    manifest: ManifestStore,
    sstables_written: AtomicU64,
    sstable_bytes_written: AtomicU64,
}

impl FlushHandler for EngineShared {
    fn flush(&self, memtable: &Arc<MemTable>) -> Result<()> {
        if memtable.is_empty() {
            self.catalog.discard_frozen(memtable.id());
            return Ok(());
        }

        // The id only advances once a flush is in the manifest, so a retry
        // rewrites the same file.
        let id = self.manifest.get().next_sstable_id;
        let dir = self.config.sstable_dir();
        let path = write_memtable(&dir, id, memtable, &self.config.sstable)?;
        let table = Arc::new(SSTable::open(&path, id, &self.config.sstable)?);

        let active_segment = self.wal.active_segment();
        self.manifest.update(|m| {
            m.record_flush(table.meta());
            m.active_wal_segment = active_segment;
        })?;
        let flushed = self.manifest.get().flushed_sequence;

        info!(
            sstable = id,
            memtable = memtable.id(),
            points = table.meta().point_count,
            streams = table.meta().stream_count,
            sequence = table.meta().max_sequence,
            "Committed flush"
        );
        self.sstables_written.fetch_add(1, Ordering::Relaxed);
        self.sstable_bytes_written
            .fetch_add(table.meta().file_size, Ordering::Relaxed);
        self.catalog.commit_flush(memtable.id(), table);

        match self.wal.retire_through(flushed) {
            Ok(retired) if !retired.is_empty() => {
                debug!(segments = ?retired, sequence = flushed, "Retired WAL segments");
            }
            Ok(_) => {}
            Err(e) => warn!(sequence = flushed, "Failed to retire WAL segments: {}", e),
        }
        Ok(())
    }
}

/// Per-process write bookkeeping, guarded by the write lock
#[derive(Default)]
struct WriteState {
    /// Last accepted timestamp per stream
    last_timestamps: HashMap<StreamKey, Timestamp>,
}

/// Tempora storage engine
///
/// Writes go to the WAL, then the active MemTable. Full MemTables are
/// frozen and handed to the flush worker, which turns them into SSTables.
/// Reads merge every source the catalog names for the requested range.
pub struct StorageEngine {
    shared: Arc<EngineShared>,
    flusher: FlushCoordinator,
    write_state: Mutex<WriteState>,
    next_memtable_id: AtomicU64,
    points_ingested: AtomicU64,
    closed: AtomicBool,
}

impl StorageEngine {
    /// Open or create an engine in `config.data_dir`, recovering any
    /// committed SSTables and replaying the WAL.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let wal_config = WalConfig {
            dir: config.wal_dir(),
            ..config.wal.clone()
        };
        let sstable_dir = config.sstable_dir();
        fs::create_dir_all(&config.data_dir)?;
        fs::create_dir_all(&wal_config.dir)?;
        fs::create_dir_all(&sstable_dir)?;

        let manifest_path = config.manifest_path();
        let mut manifest = Manifest::load(&manifest_path)?.unwrap_or_default();
        let tables = Self::recover_tables(&config, &mut manifest)?;

        let replay = WalReader::new(wal_config.clone()).replay()?;
        Self::report_replay(&replay);
        let missing = missing_wal_segments(&manifest, &replay);
        if !missing.is_empty() {
            error!(
                segments = ?missing,
                active = manifest.active_wal_segment,
                "WAL segments written since the last flush are missing; their writes are lost"
            );
        }

        let flushed = manifest.flushed_sequence;
        let wal = WalWriter::open(wal_config, &replay, flushed + 1)?;

        let active = MemTable::new(1);
        let mut state = WriteState::default();
        let mut replayed = 0usize;
        for record in replay.records.iter().filter(|r| r.sequence > flushed) {
            if let Err(e) = active.insert_batch(&record.batch, record.sequence) {
                warn!(sequence = record.sequence, "Skipping unreplayable WAL record: {}", e);
                continue;
            }
            for (key, points) in record.batch.iter() {
                if let Some(last) = points.last() {
                    state.last_timestamps.insert(key.clone(), last.timestamp);
                }
            }
            replayed += record.batch.len();
        }

        info!(
            data_dir = %config.data_dir.display(),
            sstables = tables.len(),
            points = replayed,
            flushed_sequence = flushed,
            "Opened storage engine"
        );

        let catalog = Catalog::new(Arc::new(active), tables);
        let manifest = ManifestStore::new(manifest_path, manifest);
        let flush_config = config.flush.clone();
        let shared = Arc::new(EngineShared {
            config,
            wal,
            catalog,
            manifest,
            sstables_written: AtomicU64::new(0),
            sstable_bytes_written: AtomicU64::new(0),
        });
        let flusher = FlushCoordinator::start(flush_config, shared.clone())?;

        if let Err(e) = shared.wal.retire_through(flushed) {
            warn!(sequence = flushed, "Failed to retire WAL segments: {}", e);
        }
        let active_segment = shared.wal.active_segment();
        shared.manifest.update(|m| m.active_wal_segment = active_segment)?;

        let engine = Self {
            shared,
            flusher,
            write_state: Mutex::new(state),
            next_memtable_id: AtomicU64::new(2),
            points_ingested: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        let active = engine.shared.catalog.active();
        if active.should_flush(engine.shared.config.memtable_size_limit) {
            if let Some(slot) = engine.flusher.try_reserve() {
                engine.freeze_active(slot, None)?;
            }
        }

        Ok(engine)
    }

    /// Open every SSTable the manifest names and clear out files it does not.
    ///
    /// A table that fails to decode is renamed to `.corrupt` and dropped
    /// from the manifest.
    fn recover_tables(
        config: &StorageConfig,
        manifest: &mut Manifest,
    ) -> Result<Vec<Arc<SSTable>>> {
        let dir = config.sstable_dir();
        let listing = list_dir(&dir)?;

        for tmp in &listing.temporaries {
            warn!(path = %tmp.display(), "Removing leftover temporary SSTable");
            remove_if_exists(tmp)?;
        }
        for id in listing.tables.iter().filter(|id| !manifest.contains(**id)) {
            warn!(sstable = id, "Removing SSTable missing from the manifest");
            remove_if_exists(&sstable_path(&dir, *id))?;
        }

        let mut tables = Vec::with_capacity(manifest.sstables.len());
        let mut dropped = Vec::new();
        for entry in &manifest.sstables {
            let path = sstable_path(&dir, entry.id);
            match SSTable::open(&path, entry.id, &config.sstable) {
                Ok(table) => tables.push(Arc::new(table)),
                Err(TemporaError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    error!(sstable = entry.id, "SSTable named in the manifest is missing");
                    dropped.push(entry.id);
                }
                Err(e) if e.is_corruption() || matches!(e, TemporaError::InvalidFormat(_)) => {
                    error!(sstable = entry.id, "Discarding unreadable SSTable: {}", e);
                    fs::rename(&path, path.with_extension("sst.corrupt"))?;
                    dropped.push(entry.id);
                }
                Err(e) => return Err(e),
            }
        }
        manifest.sstables.retain(|t| !dropped.contains(&t.id));

        Ok(tables)
    }

    fn report_replay(replay: &Replay) {
        for corrupt in &replay.corrupt {
            warn!(
                segment = corrupt.segment_id,
                offset = corrupt.offset,
                "Skipped corrupt WAL record: {}",
                corrupt.reason
            );
        }
        if let Some(torn) = &replay.torn_tail {
            info!(
                segment = torn.segment_id,
                offset = torn.offset,
                discarded = torn.discarded,
                "Discarding torn WAL tail"
            );
        }
        debug!(
            records = replay.records.len(),
            segments = replay.segments.len(),
            "Replayed WAL"
        );
    }

    /// Durably write a batch.
    ///
    /// Every stream's points must be strictly after the last point this
    /// process accepted for that stream; otherwise nothing is written.
    /// Returns once the batch is in the WAL and visible to reads.
    pub fn write(&self, batch: &WriteBatch) -> Result<()> {
        self.check_open()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.write_state.lock();
        for (key, points) in batch.iter() {
            check_ascending(key, points, state.last_timestamps.get(key).copied())?;
        }

        let mut active = self.shared.catalog.active();
        if active.size() >= self.shared.config.memtable_hard_limit {
            warn!(
                size = active.size(),
                depth = self.flusher.queue_depth(),
                "Active memtable over hard limit, waiting for the flush worker"
            );
            let slot = self.flusher.reserve()?;
            self.freeze_active(slot, None)?;
            active = self.shared.catalog.active();
        }

        let sequence = self.shared.wal.append(batch)?;
        active.insert_batch(batch, sequence)?;
        for (key, points) in batch.iter() {
            if let Some(last) = points.last() {
                state.last_timestamps.insert(key.clone(), last.timestamp);
            }
        }
        self.points_ingested
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        if active.should_flush(self.shared.config.memtable_size_limit) {
            match self.flusher.try_reserve() {
                Some(slot) => {
                    if let Err(e) = self.freeze_active(slot, None) {
                        warn!(memtable = active.id(), "Failed to schedule flush: {}", e);
                    }
                }
                None => debug!(
                    memtable = active.id(),
                    size = active.size(),
                    "Flush queue full, active memtable keeps growing"
                ),
            }
        }

        Ok(())
    }

    /// Flush the active MemTable and wait until it and every MemTable
    /// frozen before it are committed.
    ///
    /// An empty active MemTable is still queued when older ones are
    /// pending; the worker discards it once everything ahead of it is done.
    pub fn flush(&self) -> Result<()> {
        self.check_open()?;

        let (done, outcome) = bounded(1);
        {
            let _state = self.write_state.lock();
            let snapshot = self.shared.catalog.snapshot();
            if snapshot.active.is_empty() && snapshot.frozen.is_empty() {
                return Ok(());
            }
            let slot = self.flusher.reserve()?;
            self.freeze_active(slot, Some(done))?;
        }

        outcome.recv().map_err(|_| TemporaError::Closed)?
    }

    /// Swap in a fresh MemTable and queue the old one for flushing.
    ///
    /// Must be called with the write lock held so no write lands between
    /// the WAL rotation and the swap.
    fn freeze_active(&self, slot: FlushSlot<'_>, done: Option<FlushNotifier>) -> Result<()> {
        self.shared.wal.rotate()?;

        let next = MemTable::new(self.next_memtable_id.fetch_add(1, Ordering::Relaxed));
        let frozen = self.shared.catalog.freeze_active(Arc::new(next));
        info!(
            memtable = frozen.id(),
            points = frozen.len(),
            bytes = frozen.size(),
            "Froze memtable for flush"
        );
        slot.submit(frozen, done)
    }

    /// Points of the selected streams within `range`, ascending by timestamp
    pub fn read(&self, selector: &StreamSelector, range: TimeRange) -> Result<RangeScan> {
        self.read_with_cancel(selector, range, CancellationToken::new())
    }

    /// Like [`read`](Self::read), stopping with `Cancelled` once `cancel`
    /// fires
    pub fn read_with_cancel(
        &self,
        selector: &StreamSelector,
        range: TimeRange,
        cancel: CancellationToken,
    ) -> Result<RangeScan> {
        self.check_open()?;
        Ok(RangeScan::new(
            self.shared.catalog.snapshot(),
            selector,
            range,
            cancel,
        ))
    }

    /// Every known stream with its overall time coverage
    pub fn describe(&self) -> Vec<StreamCoverage> {
        self.shared.catalog.snapshot().describe()
    }

    /// Get engine statistics
    pub fn stats(&self) -> EngineStats {
        let snapshot = self.shared.catalog.snapshot();
        let manifest = self.shared.manifest.get();
        let frozen_bytes: usize = snapshot.frozen.iter().map(|m| m.size()).sum();

        EngineStats {
            active_memtable_bytes: snapshot.active.size(),
            active_memtable_points: snapshot.active.len(),
            frozen_memtables: snapshot.frozen.len(),
            memtable_bytes: snapshot.active.size() + frozen_bytes,
            flush_queue_depth: self.flusher.queue_depth(),
            sstable_count: snapshot.table_count(),
            sstable_bytes: snapshot.table_bytes(),
            wal_segments: self.shared.wal.segments().len(),
            last_sequence: self.shared.wal.last_sequence(),
            flushed_sequence: manifest.flushed_sequence,
            flushes_completed: self.flusher.completed(),
            flush_failures: self.flusher.failures(),
            last_flush_error: self.flusher.last_error(),
            points_ingested: self.points_ingested.load(Ordering::Relaxed),
            wal_bytes_written: self.shared.wal.bytes_appended(),
            sstables_written: self.shared.sstables_written.load(Ordering::Relaxed),
            sstable_bytes_written: self.shared.sstable_bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Configuration the engine was opened with
    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Stop accepting work, drain the flush queue and sync the WAL.
    ///
    /// Unflushed MemTables are recovered from the WAL on the next open.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Waits for in-flight writes
        let _state = self.write_state.lock();
        self.flusher.shutdown();
        self.shared.wal.sync()?;
        info!(
            data_dir = %self.shared.config.data_dir.display(),
            "Closed storage engine"
        );
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TemporaError::Closed);
        }
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Failed to close storage engine: {}", e);
        }
    }
}

/// Segments from the one the manifest last saw active up to the newest
/// replayed that are absent from the WAL directory.
///
/// Sealed segments are only retired once a flush covers them, and every
/// flush records the segment active at the time, so nothing at or after
/// that segment may be missing.
fn missing_wal_segments(manifest: &Manifest, replay: &Replay) -> Vec<u64> {
    let active = manifest.active_wal_segment;
    if active == 0 {
        return Vec::new();
    }
    let present: Vec<u64> = replay.segments.iter().map(|s| s.id).collect();
    let newest = present.iter().copied().max().unwrap_or(0).max(active);
    (active..=newest).filter(|id| !present.contains(id)).collect()
}

/// Storage engine statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub active_memtable_bytes: usize,
    pub active_memtable_points: usize,
    pub frozen_memtables: usize,
    /// Active plus frozen MemTables
    pub memtable_bytes: usize,
    pub flush_queue_depth: usize,
    pub sstable_count: usize,
    pub sstable_bytes: u64,
    pub wal_segments: usize,
    pub last_sequence: Option<u64>,
    pub flushed_sequence: u64,
    pub flushes_completed: u64,
    pub flush_failures: u64,
    pub last_flush_error: Option<String>,
    /// Points accepted since open, replayed points excluded
    pub points_ingested: u64,
    pub wal_bytes_written: u64,
    pub sstables_written: u64,
    pub sstable_bytes_written: u64,
}
