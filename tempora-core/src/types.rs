//! Core types for Tempora

use crate::{Result, TemporaError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Stream identity: series name plus tag set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    /// Series name (e.g., "cpu", "temperature")
    pub name: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
}

impl StreamKey {
    /// Create a new stream key without tags
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the stream key
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.name.len()
            + self
                .tags
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Create a canonical string representation, `name,k1=v1,k2=v2`
    pub fn canonical(&self) -> String {
        let mut s = self.name.clone();
        for (k, v) in &self.tags {
            s.push(',');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }

    /// Parse the canonical form produced by [`StreamKey::canonical`]
    pub fn parse(canonical: &str) -> Result<Self> {
        let mut parts = canonical.split(',');
        let name = parts.next().unwrap_or_default();
        let mut key = StreamKey::new(name);

        for tag in parts {
            let (k, v) = tag.split_once('=').ok_or_else(|| {
                TemporaError::Validation(format!("malformed tag '{}' in '{}'", tag, canonical))
            })?;
            key = key.with_tag(k, v);
        }

        key.validate()?;
        Ok(key)
    }

    /// Check the identity rules the ingestion layer is expected to enforce:
    /// non-empty ASCII name, ASCII tags, and no separators inside tags.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TemporaError::Validation("series name cannot be empty".into()));
        }
        if !self.name.is_ascii() {
            return Err(TemporaError::Validation(format!(
                "series name '{}' must be ASCII",
                self.name
            )));
        }
        for (k, v) in &self.tags {
            if k.is_empty() {
                return Err(TemporaError::Validation(format!(
                    "empty tag key on series '{}'",
                    self.name
                )));
            }
            if !k.is_ascii() || !v.is_ascii() {
                return Err(TemporaError::Validation(format!(
                    "tag {}={} must be ASCII",
                    k, v
                )));
            }
            if k.contains(&[',', '='][..]) || v.contains(&[',', '='][..]) {
                return Err(TemporaError::Validation(format!(
                    "tag {}={} contains a reserved separator",
                    k, v
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A single sample: timestamp and value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
}

impl DataPoint {
    /// Create a new data point
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Encoded size in bytes
    pub const SIZE: usize = 16;
}

/// A complete point with its stream key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Stream key (name + tags)
    pub key: StreamKey,
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Sample value
    pub value: f64,
}

impl Point {
    /// Create a new point
    pub fn new(key: StreamKey, timestamp: Timestamp, value: f64) -> Self {
        Self {
            key,
            timestamp,
            value,
        }
    }

    /// The sample part of this point
    pub fn data(&self) -> DataPoint {
        DataPoint::new(self.timestamp, self.value)
    }

    /// Tags of the stream this point belongs to
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.key.tags
    }
}

/// A write request: points grouped by stream, ascending within each stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    streams: BTreeMap<StreamKey, Vec<DataPoint>>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to a stream
    pub fn push(&mut self, key: StreamKey, point: DataPoint) {
        self.streams.entry(key).or_default().push(point);
    }

    /// Append a complete point
    pub fn push_point(&mut self, point: Point) {
        let data = point.data();
        self.push(point.key, data);
    }

    /// Builder-style append
    pub fn with(mut self, key: StreamKey, timestamp: Timestamp, value: f64) -> Self {
        self.push(key, DataPoint::new(timestamp, value));
        self
    }

    /// Iterate over streams and their samples
    pub fn iter(&self) -> impl Iterator<Item = (&StreamKey, &[DataPoint])> {
        self.streams.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Number of streams touched
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Total number of samples
    pub fn len(&self) -> usize {
        self.streams.values().map(Vec::len).sum()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Point> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        let mut batch = WriteBatch::new();
        for point in iter {
            batch.push_point(point);
        }
        batch
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The whole timeline
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Check if the range selects nothing
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Smallest range covering both
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Which streams a read should cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSelector {
    /// Every stream
    All,
    /// Exactly one stream
    Exact(StreamKey),
    /// Every stream of a series whose tags include the given pairs
    Series {
        name: String,
        tags: BTreeMap<String, String>,
    },
}

impl StreamSelector {
    /// Select one exact stream
    pub fn exact(key: StreamKey) -> Self {
        StreamSelector::Exact(key)
    }

    /// Select every stream of a series
    pub fn series(name: impl Into<String>) -> Self {
        StreamSelector::Series {
            name: name.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Narrow a series selector by a tag pair
    pub fn with_tag(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        match self {
            StreamSelector::Series { name, mut tags } => {
                tags.insert(key.into(), value.into());
                StreamSelector::Series { name, tags }
            }
            other => other,
        }
    }

    /// Check if a stream key is selected
    pub fn matches(&self, key: &StreamKey) -> bool {
        match self {
            StreamSelector::All => true,
            StreamSelector::Exact(exact) => exact == key,
            StreamSelector::Series { name, tags } => {
                key.name == *name && tags.iter().all(|(k, v)| key.tags.get(k) == Some(v))
            }
        }
    }
}

/// Overall coverage of one stream across every source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCoverage {
    /// The stream
    pub key: StreamKey,
    /// Earliest and latest timestamp known
    pub range: TimeRange,
    /// Points held across all sources (duplicates counted per source)
    pub points: u64,
}
