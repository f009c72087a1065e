//! Storage engine - coordinates all storage components

mod engine;
mod manifest;
mod scan;

pub use engine::{EngineStats, StorageEngine};
pub use manifest::{Manifest, ManifestTable};
pub use scan::RangeScan;

use crate::flush::FlushConfig;
use crate::sstable::SSTableConfig;
use crate::wal::WalConfig;
use crate::{Result, TemporaError};
use std::path::{Path, PathBuf};

/// Manifest file name inside the data directory
pub const MANIFEST_FILE: &str = "MANIFEST.json";

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// WAL configuration; its directory is always `<data_dir>/wal`
    pub wal: WalConfig,
    /// SSTable configuration
    pub sstable: SSTableConfig,
    /// Flush coordinator configuration
    pub flush: FlushConfig,
    /// MemTable size at which a flush is scheduled
    pub memtable_size_limit: usize,
    /// MemTable size at which writers wait for the flush worker
    pub memtable_hard_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new("data")
    }
}

impl StorageConfig {
    /// Default configuration rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            wal: WalConfig {
                dir: data_dir.join("wal"),
                ..WalConfig::default()
            },
            data_dir,
            sstable: SSTableConfig::default(),
            flush: FlushConfig::default(),
            memtable_size_limit: crate::config::MEMTABLE_SIZE_LIMIT,
            memtable_hard_limit: crate::config::MEMTABLE_HARD_LIMIT,
        }
    }

    /// Directory holding WAL segments
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Directory holding SSTables
    pub fn sstable_dir(&self) -> PathBuf {
        self.data_dir.join("sst")
    }

    /// Path of the manifest
    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(TemporaError::Config(msg.to_string()))
        }

        if self.data_dir == Path::new("") {
            return invalid("data directory must be set");
        }
        if self.memtable_size_limit == 0 {
            return invalid("memtable size limit must be positive");
        }
        if self.memtable_hard_limit < self.memtable_size_limit {
            return invalid("memtable hard limit must not be below the size limit");
        }
        if self.wal.segment_size < 4096 {
            return invalid("WAL segment size must be at least 4KB");
        }
        if self.wal.segment_age.is_zero() {
            return invalid("WAL segment age must be positive");
        }
        if self.sstable.block_points == 0 {
            return invalid("SSTable block size must be positive");
        }
        if self.flush.queue_depth == 0 {
            return invalid("flush queue depth must be positive");
        }
        Ok(())
    }
}
