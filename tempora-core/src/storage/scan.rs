//! Merge-on-read range scan

use crate::catalog::{CatalogSnapshot, Source};
use crate::memtable::slice_range;
use crate::sstable::{BlockHandle, SSTable};
use crate::{
    CancellationToken, DataPoint, Point, Result, StreamKey, StreamSelector, TemporaError,
    TimeRange, Timestamp,
};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Points of one stream from one source
struct Cursor {
    stream: usize,
    priority: usize,
    buffer: Vec<DataPoint>,
    pos: usize,
    table: Option<Arc<SSTable>>,
    blocks: VecDeque<BlockHandle>,
}

/// Head of a cursor, ordered by timestamp, stream, then source priority
struct Head {
    timestamp: Timestamp,
    stream: usize,
    priority: usize,
    value: f64,
    cursor: usize,
}

impl Head {
    fn key(&self) -> (Timestamp, usize, usize) {
        (self.timestamp, self.stream, self.priority)
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Lazy, ordered stream of points across every candidate source.
///
/// Points come out by ascending timestamp, ties broken by stream key.
/// When several sources hold the same stream and timestamp only the
/// newest source's point is returned. SSTable blocks are read on demand;
/// the cancellation token is checked before each one.
pub struct RangeScan {
    /// Keeps every source of this read alive
    _snapshot: Arc<CatalogSnapshot>,
    range: TimeRange,
    keys: Vec<StreamKey>,
    cursors: Vec<Cursor>,
    heap: BinaryHeap<Reverse<Head>>,
    cancel: CancellationToken,
    last: Option<(Timestamp, usize)>,
    primed: bool,
    done: bool,
    skipped_blocks: usize,
}

impl RangeScan {
    pub(crate) fn new(
        snapshot: Arc<CatalogSnapshot>,
        selector: &StreamSelector,
        range: TimeRange,
        cancel: CancellationToken,
    ) -> Self {
        let sources = snapshot.candidates(&range, selector);
        let per_source: Vec<Vec<StreamKey>> =
            sources.iter().map(|s| s.streams(selector)).collect();

        let keys: Vec<StreamKey> = per_source
            .iter()
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut cursors = Vec::new();
        for (priority, (source, streams)) in sources.iter().zip(&per_source).enumerate() {
            for key in streams {
                let Ok(stream) = keys.binary_search(key) else {
                    continue;
                };
                let cursor = match source {
                    Source::Active(m) | Source::Frozen(m) => Cursor {
                        stream,
                        priority,
                        buffer: m.read(key, &range),
                        pos: 0,
                        table: None,
                        blocks: VecDeque::new(),
                    },
                    Source::Table(t) => Cursor {
                        stream,
                        priority,
                        buffer: Vec::new(),
                        pos: 0,
                        blocks: t.blocks(key, &range).into(),
                        table: Some(Arc::clone(t)),
                    },
                };
                cursors.push(cursor);
            }
        }

        debug!(
            sources = sources.len(),
            streams = keys.len(),
            cursors = cursors.len(),
            "Opened range scan"
        );

        Self {
            _snapshot: snapshot,
            range,
            keys,
            cursors,
            heap: BinaryHeap::new(),
            cancel,
            last: None,
            primed: false,
            done: false,
            skipped_blocks: 0,
        }
    }

    /// Streams this scan may return, in key order
    pub fn streams(&self) -> &[StreamKey] {
        &self.keys
    }

    /// Corrupt SSTable blocks skipped so far
    pub fn skipped_blocks(&self) -> usize {
        self.skipped_blocks
    }

    fn prime(&mut self) -> Result<()> {
        for index in 0..self.cursors.len() {
            self.advance(index)?;
        }
        self.primed = true;
        Ok(())
    }

    /// Push the next point of a cursor onto the heap, loading blocks as needed
    fn advance(&mut self, index: usize) -> Result<()> {
        loop {
            let cursor = &mut self.cursors[index];
            if let Some(point) = cursor.buffer.get(cursor.pos) {
                self.heap.push(Reverse(Head {
                    timestamp: point.timestamp,
                    stream: cursor.stream,
                    priority: cursor.priority,
                    value: point.value,
                    cursor: index,
                }));
                cursor.pos += 1;
                return Ok(());
            }

            let Some(handle) = cursor.blocks.pop_front() else {
                return Ok(());
            };
            let Some(table) = cursor.table.clone() else {
                return Ok(());
            };

            if self.cancel.is_cancelled() {
                return Err(TemporaError::Cancelled);
            }

            let key = &self.keys[cursor.stream];
            match table.load_block(key, &handle) {
                Ok(block) => {
                    cursor.buffer = slice_range(&block, &self.range).to_vec();
                    cursor.pos = 0;
                }
                Err(e) if e.is_corruption() => {
                    warn!(
                        sstable = table.id(),
                        stream = %key,
                        offset = handle.offset,
                        "Skipping unreadable block: {}",
                        e
                    );
                    self.skipped_blocks += 1;
                    cursor.buffer.clear();
                    cursor.pos = 0;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_point(&mut self) -> Result<Option<Point>> {
        if !self.primed {
            self.prime()?;
        }

        while let Some(Reverse(head)) = self.heap.pop() {
            self.advance(head.cursor)?;

            // A later pop for the same stream and timestamp comes from an
            // older source and is superseded.
            if self.last == Some((head.timestamp, head.stream)) {
                continue;
            }
            self.last = Some((head.timestamp, head.stream));

            return Ok(Some(Point::new(
                self.keys[head.stream].clone(),
                head.timestamp,
                head.value,
            )));
        }

        Ok(None)
    }
}

impl Iterator for RangeScan {
    type Item = Result<Point>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_point() {
            Ok(Some(point)) => Some(Ok(point)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
