//! MemTable implementation
//!
//! The MemTable buffers recent writes in memory, one append-only,
//! time-ordered vector per stream. Streams are indexed by a concurrent
//! skip map so writers to different streams only contend on their own
//! stream's lock. Once frozen the table is read-only and waits for the
//! flush worker to turn it into an SSTable.

use crate::{
    DataPoint, Result, StreamCoverage, StreamKey, StreamSelector, TemporaError, TimeRange,
    Timestamp, WriteBatch,
};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// Per-stream bookkeeping charged against the size counter
const STREAM_OVERHEAD: usize = 64;

/// MemTable for in-memory writes
pub struct MemTable {
    /// Unique ID for this memtable
    id: u64,
    /// Stream key -> ascending points
    streams: SkipMap<StreamKey, RwLock<Vec<DataPoint>>>,
    /// Held while adding a stream so its overhead is charged once
    new_stream: Mutex<()>,
    /// Approximate size in bytes
    size_bytes: AtomicUsize,
    /// Number of points held
    point_count: AtomicUsize,
    min_timestamp: AtomicI64,
    max_timestamp: AtomicI64,
    /// Highest WAL sequence inserted
    max_sequence: AtomicU64,
    frozen: AtomicBool,
    /// Creation time
    created_at: Instant,
}

impl MemTable {
    /// Create a new MemTable
    pub fn new(id: u64) -> Self {
        Self {
            id,
            streams: SkipMap::new(),
            new_stream: Mutex::new(()),
            size_bytes: AtomicUsize::new(0),
            point_count: AtomicUsize::new(0),
            min_timestamp: AtomicI64::new(Timestamp::MAX),
            max_timestamp: AtomicI64::new(Timestamp::MIN),
            max_sequence: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Get the MemTable ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Insert a point into a stream.
    ///
    /// Fails with `OutOfOrder` unless the timestamp is past the stream's
    /// last point in this table.
    pub fn insert(&self, key: &StreamKey, point: DataPoint) -> Result<()> {
        self.check_writable()?;
        let stream = self.stream_entry(key);
        let mut points = stream.value().write();

        if let Some(last) = points.last() {
            if point.timestamp <= last.timestamp {
                return Err(TemporaError::OutOfOrder {
                    stream: key.canonical(),
                    timestamp: point.timestamp,
                    last: last.timestamp,
                });
            }
        }

        points.push(point);
        drop(points);
        self.account(1, point.timestamp, point.timestamp);
        Ok(())
    }

    /// Insert every stream of a batch recorded under WAL `sequence`.
    ///
    /// The whole batch is checked before anything is inserted; callers
    /// serialize writers so the check still holds when the points land.
    pub fn insert_batch(&self, batch: &WriteBatch, sequence: u64) -> Result<()> {
        self.check_writable()?;

        for (key, points) in batch.iter() {
            let last = self.last_timestamp(key);
            check_ascending(key, points, last)?;
        }

        for (key, points) in batch.iter() {
            let (Some(first), Some(last)) = (points.first(), points.last()) else {
                continue;
            };
            let stream = self.stream_entry(key);
            stream.value().write().extend_from_slice(points);
            self.account(points.len(), first.timestamp, last.timestamp);
        }

        self.max_sequence.fetch_max(sequence, Ordering::AcqRel);
        Ok(())
    }

    /// Check if the MemTable should be flushed
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size_bytes.load(Ordering::Relaxed) >= size_limit
    }

    /// Make the table read-only. Returns false if it already was.
    pub fn freeze(&self) -> bool {
        !self.frozen.swap(true, Ordering::AcqRel)
    }

    /// Check if the table no longer accepts writes
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Get the current size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Number of points held
    pub fn len(&self) -> usize {
        self.point_count.load(Ordering::Relaxed)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of streams held
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Highest WAL sequence number inserted, 0 if none
    pub fn max_sequence(&self) -> u64 {
        self.max_sequence.load(Ordering::Acquire)
    }

    /// Get the age since creation
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Get the time range covered by this MemTable
    pub fn time_range(&self) -> Option<TimeRange> {
        let min = self.min_timestamp.load(Ordering::Acquire);
        let max = self.max_timestamp.load(Ordering::Acquire);
        (min <= max).then(|| TimeRange::new(min, max))
    }

    /// Timestamp of the newest point of a stream
    pub fn last_timestamp(&self, key: &StreamKey) -> Option<Timestamp> {
        self.streams
            .get(key)
            .and_then(|e| e.value().read().last().map(|p| p.timestamp))
    }

    /// Points of one stream inside `range`, copied out in ascending order
    pub fn read(&self, key: &StreamKey, range: &TimeRange) -> Vec<DataPoint> {
        let Some(entry) = self.streams.get(key) else {
            return Vec::new();
        };
        let points = entry.value().read();
        slice_range(&points, range).to_vec()
    }

    /// Stream keys matching a selector, in key order
    pub fn streams(&self, selector: &StreamSelector) -> Vec<StreamKey> {
        match selector {
            StreamSelector::Exact(key) => self
                .streams
                .get(key)
                .map(|e| vec![e.key().clone()])
                .unwrap_or_default(),
            _ => self
                .streams
                .iter()
                .filter(|e| selector.matches(e.key()))
                .map(|e| e.key().clone())
                .collect(),
        }
    }

    /// Coverage of every stream held
    pub fn describe(&self) -> Vec<StreamCoverage> {
        self.streams
            .iter()
            .filter_map(|entry| {
                let points = entry.value().read();
                let (first, last) = (points.first()?, points.last()?);
                Some(StreamCoverage {
                    key: entry.key().clone(),
                    range: TimeRange::new(first.timestamp, last.timestamp),
                    points: points.len() as u64,
                })
            })
            .collect()
    }

    /// Visit every non-empty stream in key order
    pub fn for_each_stream<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&StreamKey, &[DataPoint]) -> Result<()>,
    {
        for entry in self.streams.iter() {
            let points = entry.value().read();
            if !points.is_empty() {
                f(entry.key(), &points)?;
            }
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.is_frozen() {
            return Err(TemporaError::Internal(format!(
                "memtable {} is frozen",
                self.id
            )));
        }
        Ok(())
    }

    fn stream_entry(
        &self,
        key: &StreamKey,
    ) -> crossbeam_skiplist::map::Entry<'_, StreamKey, RwLock<Vec<DataPoint>>> {
        if let Some(entry) = self.streams.get(key) {
            return entry;
        }
        let _guard = self.new_stream.lock();
        if let Some(entry) = self.streams.get(key) {
            return entry;
        }
        self.size_bytes
            .fetch_add(key.size() + STREAM_OVERHEAD, Ordering::Relaxed);
        self.streams.insert(key.clone(), RwLock::new(Vec::new()))
    }

    fn account(&self, points: usize, first: Timestamp, last: Timestamp) {
        self.point_count.fetch_add(points, Ordering::Relaxed);
        self.size_bytes
            .fetch_add(points * DataPoint::SIZE, Ordering::Relaxed);
        self.min_timestamp.fetch_min(first, Ordering::AcqRel);
        self.max_timestamp.fetch_max(last, Ordering::AcqRel);
    }
}

impl fmt::Debug for MemTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("streams", &self.stream_count())
            .field("points", &self.len())
            .field("size", &self.size())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// Reject a run of points that is not strictly ascending past `last`
pub(crate) fn check_ascending(
    key: &StreamKey,
    points: &[DataPoint],
    mut last: Option<Timestamp>,
) -> Result<()> {
    for point in points {
        if let Some(prev) = last {
            if point.timestamp <= prev {
                return Err(TemporaError::OutOfOrder {
                    stream: key.canonical(),
                    timestamp: point.timestamp,
                    last: prev,
                });
            }
        }
        last = Some(point.timestamp);
    }
    Ok(())
}

/// Sub-slice of ascending points falling inside `range`
pub(crate) fn slice_range<'a>(points: &'a [DataPoint], range: &TimeRange) -> &'a [DataPoint] {
    if range.is_empty() {
        return &[];
    }
    let start = points.partition_point(|p| p.timestamp < range.start);
    let end = points.partition_point(|p| p.timestamp <= range.end);
    &points[start..end.max(start)]
}
