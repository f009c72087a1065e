//! Write-Ahead Log (WAL) implementation
//!
//! Every accepted batch is appended to the active segment and forced to
//! stable storage before the write is acknowledged. Segments rotate on
//! size or age, seal, and are retired once a committed SSTable covers
//! every sequence number they hold. On startup the segments are replayed
//! oldest to newest to rebuild the MemTable.

mod reader;
mod record;
mod writer;

pub use reader::{CorruptRecord, Replay, TornTail, WalReader};
pub use record::{RecordRead, WalRecord, RECORD_HEADER_SIZE, SEGMENT_HEADER_SIZE};
pub use writer::WalWriter;

use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// WAL sync policy
///
/// Only `Immediate` makes `append` a durability boundary; the others
/// trade acknowledged writes for throughput.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Segment size in bytes past which the next append rotates
    pub segment_size: usize,
    /// Segment age past which the next append rotates
    pub segment_age: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
            segment_age: crate::config::WAL_SEGMENT_AGE,
        }
    }
}

/// Sequence coverage of one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment id, also its position in the log
    pub id: u64,
    /// First sequence number stored, if any record is
    pub first_sequence: Option<u64>,
    /// Last sequence number stored, if any record is
    pub last_sequence: Option<u64>,
    /// Replay skipped bytes here that it could not verify
    pub damaged: bool,
}

impl SegmentInfo {
    /// A segment with no records yet
    pub fn empty(id: u64) -> Self {
        Self {
            id,
            first_sequence: None,
            last_sequence: None,
            damaged: false,
        }
    }

    /// Account for a record appended or replayed into this segment
    pub fn record(&mut self, sequence: u64) {
        if self.first_sequence.is_none() {
            self.first_sequence = Some(sequence);
        }
        self.last_sequence = Some(sequence);
    }

    /// True once every record here is covered by `flushed`
    pub fn is_covered_by(&self, flushed: u64) -> bool {
        self.last_sequence.map_or(true, |last| last <= flushed)
    }
}

/// Where a damaged segment is set aside once its readable records are flushed
pub fn damaged_segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log.corrupt", segment_id))
}

/// Path of a segment file inside the WAL directory
pub fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", segment_id))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// Segment ids present in `dir`, oldest first
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            ids.push(id);
        }
    }

    ids.sort_unstable();
    Ok(ids)
}
