//! Time-range catalog
//!
//! The catalog is the authoritative list of every source that can hold
//! points: the active MemTable, frozen MemTables still waiting for their
//! flush, and committed SSTables. Readers take an immutable
//! [`CatalogSnapshot`]; every change builds a new snapshot and swaps the
//! pointer, so a read never observes a half-applied commit and keeps its
//! sources alive for as long as it holds the snapshot.

use crate::memtable::MemTable;
use crate::sstable::SSTable;
use crate::{StreamCoverage, StreamKey, StreamSelector, TimeRange};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// A committed SSTable as the catalog sees it
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// SSTable id; higher ids were committed later
    pub id: u64,
    /// Time range covered
    pub range: TimeRange,
    /// File path
    pub path: PathBuf,
    /// Highest WAL sequence number in the file
    pub max_sequence: u64,
    /// Open handle, shared with in-flight reads
    pub table: Arc<SSTable>,
}

impl CatalogEntry {
    /// Build an entry for an opened SSTable
    pub fn new(table: Arc<SSTable>) -> Self {
        let meta = table.meta();
        Self {
            id: meta.id,
            range: meta.range,
            path: meta.path.clone(),
            max_sequence: meta.max_sequence,
            table,
        }
    }

    /// Streams stored in the file
    pub fn stream_keys(&self) -> impl Iterator<Item = &StreamKey> {
        self.table.stream_keys()
    }
}

/// A place a read may find points
#[derive(Debug, Clone)]
pub enum Source {
    /// The MemTable receiving writes
    Active(Arc<MemTable>),
    /// A frozen MemTable whose flush has not committed yet
    Frozen(Arc<MemTable>),
    /// A committed SSTable
    Table(Arc<SSTable>),
}

impl Source {
    /// Streams of this source a selector picks
    pub fn streams(&self, selector: &StreamSelector) -> Vec<StreamKey> {
        match self {
            Source::Active(m) | Source::Frozen(m) => m.streams(selector),
            Source::Table(t) => t.streams(selector),
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Source::Active(m) => format!("memtable {}", m.id()),
            Source::Frozen(m) => format!("frozen memtable {}", m.id()),
            Source::Table(t) => format!("sstable {}", t.id()),
        }
    }
}

/// Point-in-time view of every source
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    /// MemTable receiving writes
    pub active: Arc<MemTable>,
    /// Frozen MemTables, oldest first
    pub frozen: Vec<Arc<MemTable>>,
    /// Committed SSTables ordered by minimum timestamp
    pub tables: Vec<CatalogEntry>,
}

impl CatalogSnapshot {
    /// Sources that may hold points of `selector` inside `range`.
    ///
    /// Returned newest first: the active MemTable, frozen MemTables from
    /// newest to oldest, then SSTables by descending id. A point found in
    /// an earlier source supersedes the same stream and timestamp in a
    /// later one.
    pub fn candidates(&self, range: &TimeRange, selector: &StreamSelector) -> Vec<Source> {
        let mut sources = Vec::new();
        if range.is_empty() {
            return sources;
        }

        if memtable_may_overlap(&self.active, range) {
            sources.push(Source::Active(Arc::clone(&self.active)));
        }
        for memtable in self.frozen.iter().rev() {
            if memtable_may_overlap(memtable, range) {
                sources.push(Source::Frozen(Arc::clone(memtable)));
            }
        }

        // Entries past this point start after the query ends
        let end = self.tables.partition_point(|e| e.range.start <= range.end);
        let mut tables: Vec<&CatalogEntry> = self.tables[..end]
            .iter()
            .filter(|e| range.start <= e.range.end && e.table.matches(selector))
            .collect();
        tables.sort_by(|a, b| b.id.cmp(&a.id));
        sources.extend(tables.into_iter().map(|e| Source::Table(Arc::clone(&e.table))));

        sources
    }

    /// Every known stream with its overall coverage
    pub fn describe(&self) -> Vec<StreamCoverage> {
        let mut merged: BTreeMap<StreamKey, StreamCoverage> = BTreeMap::new();
        let memtables = std::iter::once(&self.active).chain(self.frozen.iter());
        let coverage = memtables
            .flat_map(|m| m.describe())
            .chain(self.tables.iter().flat_map(|e| e.table.describe()));

        for c in coverage {
            merged
                .entry(c.key.clone())
                .and_modify(|m| {
                    m.range = m.range.union(&c.range);
                    m.points += c.points;
                })
                .or_insert(c);
        }

        merged.into_values().collect()
    }

    /// Number of committed SSTables
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Total bytes of committed SSTables
    pub fn table_bytes(&self) -> u64 {
        self.tables.iter().map(|e| e.table.meta().file_size).sum()
    }

    fn insert_table(&mut self, entry: CatalogEntry) {
        let pos = self
            .tables
            .partition_point(|e| (e.range.start, e.id) < (entry.range.start, entry.id));
        self.tables.insert(pos, entry);
    }
}

fn memtable_may_overlap(memtable: &MemTable, range: &TimeRange) -> bool {
    memtable.time_range().map_or(true, |r| r.overlaps(range))
}

/// Shared catalog, updated by copy-on-write
pub struct Catalog {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl Catalog {
    /// Create a catalog over an active MemTable and recovered SSTables
    pub fn new(active: Arc<MemTable>, tables: Vec<Arc<SSTable>>) -> Self {
        let mut snapshot = CatalogSnapshot {
            active,
            frozen: Vec::new(),
            tables: Vec::with_capacity(tables.len()),
        };
        for table in tables {
            snapshot.insert_table(CatalogEntry::new(table));
        }

        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current point-in-time view
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// The MemTable currently receiving writes
    pub fn active(&self) -> Arc<MemTable> {
        Arc::clone(&self.current.read().active)
    }

    /// Replace the active MemTable with `next`, keeping the old one
    /// readable as frozen. Returns the frozen MemTable.
    pub fn freeze_active(&self, next: Arc<MemTable>) -> Arc<MemTable> {
        let mut current = self.current.write();
        let mut snapshot = CatalogSnapshot::clone(&current);

        let frozen = std::mem::replace(&mut snapshot.active, next);
        frozen.freeze();
        snapshot.frozen.push(Arc::clone(&frozen));

        debug!(
            frozen = frozen.id(),
            active = snapshot.active.id(),
            "Swapped active memtable"
        );
        *current = Arc::new(snapshot);
        frozen
    }

    /// Publish the SSTable produced from frozen MemTable `memtable_id`
    /// and drop that MemTable from the catalog in the same swap.
    pub fn commit_flush(&self, memtable_id: u64, table: Arc<SSTable>) {
        let mut current = self.current.write();
        let mut snapshot = CatalogSnapshot::clone(&current);

        snapshot.frozen.retain(|m| m.id() != memtable_id);
        snapshot.insert_table(CatalogEntry::new(table));

        *current = Arc::new(snapshot);
    }

    /// Drop a frozen MemTable that produced no SSTable
    pub fn discard_frozen(&self, memtable_id: u64) {
        let mut current = self.current.write();
        if !current.frozen.iter().any(|m| m.id() == memtable_id) {
            return;
        }
        let mut snapshot = CatalogSnapshot::clone(&current);
        snapshot.frozen.retain(|m| m.id() != memtable_id);
        *current = Arc::new(snapshot);
    }

    /// Remove an SSTable from the catalog. The file is deleted once the
    /// last snapshot referencing it is gone.
    pub fn remove_table(&self, id: u64) -> Option<Arc<SSTable>> {
        let mut current = self.current.write();
        let pos = current.tables.iter().position(|e| e.id == id)?;

        let mut snapshot = CatalogSnapshot::clone(&current);
        let entry = snapshot.tables.remove(pos);
        entry.table.mark_obsolete();

        *current = Arc::new(snapshot);
        Some(entry.table)
    }
}
