//! Tempora Core - persistence core of a single-node time-series store
//!
//! Durable ingestion of timestamped, tagged numeric points and retrieval
//! by time range, built as a log-structured merge write path:
//!
//! - **WAL (Write-Ahead Log)**: every accepted batch is fsynced before it becomes visible
//! - **MemTable**: per-stream, time-ordered in-memory buffer of recent writes
//! - **SSTable**: immutable columnar files produced by the background flush
//! - **Catalog**: copy-on-write snapshot routing time ranges to candidate sources
//! - **Flush coordinator**: dedicated worker turning frozen MemTables into SSTables
//!
//! Reads merge the MemTable and every overlapping SSTable by timestamp.
//! SSTables are never compacted; overlapping files are resolved at read time.

pub mod catalog;
pub mod flush;
pub mod memtable;
pub mod sstable;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TemporaError};
pub use storage::{StorageConfig, StorageEngine};
pub use tokio_util::sync::CancellationToken;
pub use types::*;

/// Tempora version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// MemTable size before a flush is triggered (64MB)
    pub const MEMTABLE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

    /// MemTable size at which writers are pushed back (256MB)
    pub const MEMTABLE_HARD_LIMIT: usize = 256 * 1024 * 1024;

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// WAL segment age before rotation
    pub const WAL_SEGMENT_AGE: Duration = Duration::from_secs(60 * 60);

    /// Frozen MemTables allowed to wait for the flush worker
    pub const FLUSH_QUEUE_DEPTH: usize = 4;

    /// Pause between attempts of a failed flush
    pub const FLUSH_RETRY_INTERVAL: Duration = Duration::from_millis(500);

    /// How long a writer waits for a flush slot before giving up
    pub const BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Make directory entry changes (create, rename, unlink) durable
pub(crate) fn sync_dir(dir: &std::path::Path) -> std::io::Result<()> {
    #[cfg(unix)]
    std::fs::File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
