//! Durable record of committed SSTables

use crate::sstable::SSTableMeta;
use crate::{sync_dir, Result, TemporaError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_VERSION: u32 = 1;

/// A committed SSTable as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestTable {
    pub id: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub point_count: u64,
    pub max_sequence: u64,
}

impl From<&SSTableMeta> for ManifestTable {
    fn from(meta: &SSTableMeta) -> Self {
        Self {
            id: meta.id,
            min_timestamp: meta.range.start,
            max_timestamp: meta.range.end,
            point_count: meta.point_count,
            max_sequence: meta.max_sequence,
        }
    }
}

/// Engine state that must survive a restart.
///
/// An SSTable exists once it is listed here; files in the data directory
/// that are not listed are leftovers of an interrupted flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    /// Id the next flush will use
    pub next_sstable_id: u64,
    /// Every WAL record at or below this sequence is in a committed SSTable
    pub flushed_sequence: u64,
    /// WAL segment receiving appends when the manifest was written; no
    /// segment from this one on may be missing at startup
    pub active_wal_segment: u64,
    /// Committed SSTables in commit order
    pub sstables: Vec<ManifestTable>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            next_sstable_id: 1,
            flushed_sequence: 0,
            active_wal_segment: 0,
            sstables: Vec::new(),
        }
    }
}

impl Manifest {
    /// Load the manifest, or `None` if the engine has never run here
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = serde_json::from_slice(&data)
            .map_err(|e| TemporaError::Corruption(format!("manifest {:?}: {}", path, e)))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(TemporaError::InvalidFormat(format!(
                "unsupported manifest version: {}",
                manifest.version
            )));
        }
        Ok(Some(manifest))
    }

    /// Write the manifest atomically: temp file, fsync, rename
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(self)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(())
    }

    /// Check if an SSTable id is committed
    pub fn contains(&self, id: u64) -> bool {
        self.sstables.iter().any(|t| t.id == id)
    }

    /// Record a committed flush
    pub fn record_flush(&mut self, meta: &SSTableMeta) {
        self.sstables.push(ManifestTable::from(meta));
        self.next_sstable_id = self.next_sstable_id.max(meta.id + 1);
        self.flushed_sequence = self.flushed_sequence.max(meta.max_sequence);
    }
}

/// The manifest plus the file it lives in
pub(crate) struct ManifestStore {
    path: PathBuf,
    current: Mutex<Manifest>,
}

impl ManifestStore {
    pub fn new(path: PathBuf, manifest: Manifest) -> Self {
        Self {
            path,
            current: Mutex::new(manifest),
        }
    }

    /// Current manifest contents
    pub fn get(&self) -> Manifest {
        self.current.lock().clone()
    }

    /// Apply `f` and persist the result; memory is only updated once the
    /// new manifest is durable.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Manifest),
    {
        let mut current = self.current.lock();
        let mut next = current.clone();
        f(&mut next);
        next.save(&self.path)?;
        *current = next;
        Ok(())
    }
}

/// Remove a file if present
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TimeRange;
    use tempfile::TempDir;

    fn meta(id: u64, max_sequence: u64) -> SSTableMeta {
        SSTableMeta {
            id,
            path: PathBuf::from(format!("{}.sst", id)),
            range: TimeRange::new(10, 20),
            point_count: 5,
            stream_count: 1,
            max_sequence,
            file_size: 100,
        }
    }

    #[test]
    fn test_manifest_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("MANIFEST.json");
        assert!(Manifest::load(&path).unwrap().is_none());

        let mut manifest = Manifest::default();
        manifest.record_flush(&meta(1, 40));
        manifest.record_flush(&meta(2, 90));
        manifest.active_wal_segment = 7;
        manifest.save(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.next_sstable_id, 3);
        assert_eq!(loaded.flushed_sequence, 90);
        assert!(loaded.contains(2) && !loaded.contains(3));
        assert!(!temp_dir.path().join("MANIFEST.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("MANIFEST.json");
        fs::write(&path, b"{\"version\": 1, \"next_sst").unwrap();
        assert!(Manifest::load(&path).unwrap_err().is_corruption());
    }

    #[test]
    fn test_store_updates_after_save() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("MANIFEST.json");
        let store = ManifestStore::new(path.clone(), Manifest::default());

        store.update(|m| m.record_flush(&meta(4, 12))).unwrap();
        assert_eq!(store.get().next_sstable_id, 5);
        assert_eq!(Manifest::load(&path).unwrap().unwrap(), store.get());

        // A failed save leaves the in-memory manifest untouched
        let broken = ManifestStore::new(
            temp_dir.path().join("missing/MANIFEST.json"),
            Manifest::default(),
        );
        assert!(broken.update(|m| m.flushed_sequence = 99).is_err());
        assert_eq!(broken.get().flushed_sequence, 0);
    }
}
