//! SSTable reader for querying data

use super::block::{decode_block, BlockHandle};
use super::{Footer, SSTableConfig, SSTableMeta, FORMAT_VERSION, HEADER_SIZE, MAGIC};
use crate::memtable::slice_range;
use crate::{
    DataPoint, Result, StreamCoverage, StreamKey, StreamSelector, TemporaError, TimeRange,
};
use bytes::Buf;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const VERIFY_CHUNK: usize = 64 * 1024;

/// Blocks of one stream
#[derive(Debug)]
struct StreamBlocks {
    stream_ref: u32,
    blocks: Vec<BlockHandle>,
}

/// An open, immutable SSTable.
///
/// Only the footer, dictionary and index are held in memory; blocks are
/// read from disk when a scan asks for them. Shared through `Arc` by the
/// catalog and in-flight reads; once marked obsolete the file is deleted
/// when the last reference goes away.
pub struct SSTable {
    meta: SSTableMeta,
    streams: BTreeMap<StreamKey, StreamBlocks>,
    file: Mutex<File>,
    obsolete: AtomicBool,
}

impl SSTable {
    /// Open an SSTable file, verifying its footer and (if configured) body
    pub fn open(path: &Path, id: u64, config: &SSTableConfig) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + Footer::SIZE) as u64 {
            return Err(TemporaError::Corruption(format!(
                "SSTable {:?} is only {} bytes",
                path, file_size
            )));
        }

        // Read header
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        if header[..4] != MAGIC {
            return Err(TemporaError::Corruption("invalid SSTable header magic".into()));
        }
        let version = (&header[4..]).get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TemporaError::InvalidFormat(format!(
                "unsupported SSTable version: {}",
                version
            )));
        }

        // Read footer
        let body_len = file_size - Footer::SIZE as u64;
        file.seek(SeekFrom::Start(body_len))?;
        let mut footer = [0u8; Footer::SIZE];
        file.read_exact(&mut footer)?;
        let footer = Footer::decode(&footer)?;

        if footer.dictionary_offset < HEADER_SIZE as u64
            || footer.dictionary_offset.saturating_add(footer.dictionary_len) != footer.index_offset
            || footer.index_offset.saturating_add(footer.index_len) != body_len
        {
            return Err(TemporaError::Corruption(format!(
                "SSTable {:?} footer sections do not line up",
                path
            )));
        }

        if config.verify_checksums_on_open {
            Self::verify_body(&mut file, body_len, footer.body_crc)?;
        }

        // Dictionary and index are adjacent
        file.seek(SeekFrom::Start(footer.dictionary_offset))?;
        let mut sections = vec![0u8; (footer.dictionary_len + footer.index_len) as usize];
        file.read_exact(&mut sections)?;
        let (dictionary, index) = sections.split_at(footer.dictionary_len as usize);

        let keys = parse_dictionary(dictionary)?;
        let streams = parse_index(index, keys, footer.dictionary_offset)?;

        let counted: u64 = streams
            .values()
            .flat_map(|s| s.blocks.iter())
            .map(|b| b.count as u64)
            .sum();
        if counted != footer.point_count {
            return Err(TemporaError::Corruption(format!(
                "SSTable index holds {} points, footer says {}",
                counted, footer.point_count
            )));
        }

        let meta = SSTableMeta {
            id,
            path: path.to_path_buf(),
            range: TimeRange::new(footer.min_timestamp, footer.max_timestamp),
            point_count: footer.point_count,
            stream_count: streams.len(),
            max_sequence: footer.max_sequence,
            file_size,
        };
        debug!(
            sstable = id,
            streams = meta.stream_count,
            points = meta.point_count,
            "Opened SSTable"
        );

        Ok(Self {
            meta,
            streams,
            file: Mutex::new(file),
            obsolete: AtomicBool::new(false),
        })
    }

    /// Get SSTable metadata
    pub fn meta(&self) -> &SSTableMeta {
        &self.meta
    }

    /// Get the SSTable ID
    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Time range covered by this file
    pub fn range(&self) -> TimeRange {
        self.meta.range
    }

    /// Every stream stored, in key order
    pub fn stream_keys(&self) -> impl Iterator<Item = &StreamKey> {
        self.streams.keys()
    }

    /// Check if any stored stream is selected
    pub fn matches(&self, selector: &StreamSelector) -> bool {
        match selector {
            StreamSelector::Exact(key) => self.streams.contains_key(key),
            _ => self.streams.keys().any(|k| selector.matches(k)),
        }
    }

    /// Stored streams a selector picks, in key order
    pub fn streams(&self, selector: &StreamSelector) -> Vec<StreamKey> {
        match selector {
            StreamSelector::Exact(key) if self.streams.contains_key(key) => vec![key.clone()],
            StreamSelector::Exact(_) => Vec::new(),
            _ => self
                .streams
                .keys()
                .filter(|k| selector.matches(k))
                .cloned()
                .collect(),
        }
    }

    /// Blocks of a stream whose range intersects `range`, in time order
    pub fn blocks(&self, key: &StreamKey, range: &TimeRange) -> Vec<BlockHandle> {
        self.streams
            .get(key)
            .map(|s| {
                s.blocks
                    .iter()
                    .filter(|b| b.range.overlaps(range))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read and verify one block of a stream
    pub fn load_block(&self, key: &StreamKey, handle: &BlockHandle) -> Result<Vec<DataPoint>> {
        let stream = self.streams.get(key).ok_or_else(|| {
            TemporaError::Internal(format!("stream {} not in SSTable {}", key, self.meta.id))
        })?;

        let mut data = vec![0u8; handle.len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(handle.offset))?;
            file.read_exact(&mut data)?;
        }

        decode_block(&data, stream.stream_ref, handle.count).map_err(|e| {
            warn!(
                sstable = self.meta.id,
                offset = handle.offset,
                "Corrupt SSTable block: {}",
                e
            );
            e
        })
    }

    /// Points of one stream inside `range`, in ascending order
    pub fn read(&self, key: &StreamKey, range: &TimeRange) -> Result<Vec<DataPoint>> {
        let mut points = Vec::new();
        for handle in self.blocks(key, range) {
            let block = self.load_block(key, &handle)?;
            points.extend_from_slice(slice_range(&block, range));
        }
        Ok(points)
    }

    /// Coverage of every stream stored
    pub fn describe(&self) -> Vec<StreamCoverage> {
        self.streams
            .iter()
            .filter_map(|(key, stream)| {
                let (first, last) = (stream.blocks.first()?, stream.blocks.last()?);
                Some(StreamCoverage {
                    key: key.clone(),
                    range: TimeRange::new(first.range.start, last.range.end),
                    points: stream.blocks.iter().map(|b| b.count as u64).sum(),
                })
            })
            .collect()
    }

    /// Delete the file once the last reference is dropped
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Check if the file is scheduled for deletion
    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    fn verify_body(file: &mut File, body_len: u64, expected: u32) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = body_len;
        let mut chunk = vec![0u8; VERIFY_CHUNK];

        while remaining > 0 {
            let n = remaining.min(VERIFY_CHUNK as u64) as usize;
            file.read_exact(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }

        let actual = hasher.finalize();
        if actual != expected {
            return Err(TemporaError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }
}

impl Drop for SSTable {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        match fs::remove_file(&self.meta.path) {
            Ok(()) => info!(sstable = self.meta.id, "Deleted obsolete SSTable"),
            Err(e) => warn!(sstable = self.meta.id, "Failed to delete obsolete SSTable: {}", e),
        }
    }
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("meta", &self.meta)
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

fn corrupt(what: &str) -> TemporaError {
    TemporaError::Corruption(format!("truncated SSTable {}", what))
}

fn parse_dictionary(mut data: &[u8]) -> Result<Vec<StreamKey>> {
    if data.remaining() < 4 {
        return Err(corrupt("dictionary"));
    }
    let string_count = data.get_u32_le() as usize;
    let mut strings = Vec::with_capacity(string_count.min(data.len()));
    for _ in 0..string_count {
        if data.remaining() < 2 {
            return Err(corrupt("dictionary"));
        }
        let len = data.get_u16_le() as usize;
        if data.remaining() < len {
            return Err(corrupt("dictionary"));
        }
        let s = std::str::from_utf8(&data[..len])
            .map_err(|e| TemporaError::Corruption(format!("dictionary string: {}", e)))?;
        strings.push(s.to_string());
        data.advance(len);
    }

    let lookup = |id: u32| -> Result<String> {
        strings
            .get(id as usize)
            .cloned()
            .ok_or_else(|| TemporaError::Corruption(format!("dictionary ref {} out of range", id)))
    };

    if data.remaining() < 4 {
        return Err(corrupt("dictionary"));
    }
    let stream_count = data.get_u32_le() as usize;
    let mut keys = Vec::with_capacity(stream_count.min(data.len()));
    for _ in 0..stream_count {
        if data.remaining() < 6 {
            return Err(corrupt("dictionary"));
        }
        let mut key = StreamKey::new(lookup(data.get_u32_le())?);
        let tag_count = data.get_u16_le() as usize;
        if data.remaining() < tag_count * 8 {
            return Err(corrupt("dictionary"));
        }
        for _ in 0..tag_count {
            let k = lookup(data.get_u32_le())?;
            let v = lookup(data.get_u32_le())?;
            key.tags.insert(k, v);
        }
        keys.push(key);
    }

    Ok(keys)
}

fn parse_index(
    mut data: &[u8],
    keys: Vec<StreamKey>,
    blocks_end: u64,
) -> Result<BTreeMap<StreamKey, StreamBlocks>> {
    if data.remaining() < 4 {
        return Err(corrupt("index"));
    }
    let count = data.get_u32_le() as usize;

    let mut streams: BTreeMap<StreamKey, StreamBlocks> = BTreeMap::new();
    for _ in 0..count {
        let (stream_ref, handle) = BlockHandle::decode_from(&mut data)?;
        let key = keys.get(stream_ref as usize).ok_or_else(|| {
            TemporaError::Corruption(format!("index names unknown stream {}", stream_ref))
        })?;
        let end = handle.offset.saturating_add(handle.len as u64);
        if handle.offset < HEADER_SIZE as u64 || end > blocks_end {
            return Err(TemporaError::Corruption(format!(
                "block at {} lies outside the data section",
                handle.offset
            )));
        }

        streams
            .entry(key.clone())
            .or_insert_with(|| StreamBlocks {
                stream_ref,
                blocks: Vec::new(),
            })
            .blocks
            .push(handle);
    }

    Ok(streams)
}
