//! SSTable builder for writing sorted data to disk

use super::block::{encode_block, BlockHandle};
use super::{sstable_path, temp_path, Footer, SSTableConfig, FORMAT_VERSION, HEADER_SIZE, MAGIC};
use crate::memtable::{check_ascending, MemTable};
use crate::{sync_dir, DataPoint, Result, StreamKey, TemporaError, TimeRange, Timestamp};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Streams SSTable sections into a writer.
///
/// Streams must be added in ascending key order. Blocks are written as
/// they are produced; the dictionary, index and footer follow on
/// [`SSTableBuilder::finish`].
pub struct SSTableBuilder<W: Write> {
    writer: W,
    config: SSTableConfig,
    hasher: crc32fast::Hasher,
    offset: u64,

    // Dictionary
    strings: Vec<String>,
    string_ids: HashMap<String, u32>,
    streams: Vec<(u32, Vec<(u32, u32)>)>,
    last_key: Option<StreamKey>,

    // Index data
    index: Vec<(u32, BlockHandle)>,

    // Stats
    point_count: u64,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
}

impl<W: Write> SSTableBuilder<W> {
    /// Create a new SSTable builder and write the file header
    pub fn new(writer: W, config: SSTableConfig) -> Result<Self> {
        let mut builder = Self {
            writer,
            config,
            hasher: crc32fast::Hasher::new(),
            offset: 0,
            strings: Vec::new(),
            string_ids: HashMap::new(),
            streams: Vec::new(),
            last_key: None,
            index: Vec::new(),
            point_count: 0,
            min_timestamp: Timestamp::MAX,
            max_timestamp: Timestamp::MIN,
        };

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_slice(&MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        builder.write(&header)?;
        Ok(builder)
    }

    /// Add every point of one stream
    pub fn add_stream(&mut self, key: &StreamKey, points: &[DataPoint]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last {
                return Err(TemporaError::Internal(format!(
                    "stream {} added after {}",
                    key, last
                )));
            }
        }
        let (Some(first), Some(last)) = (points.first(), points.last()) else {
            return Ok(());
        };
        check_ascending(key, points, None)?;

        let stream_ref = self.intern_stream(key)?;
        for chunk in points.chunks(self.config.block_points.max(1)) {
            let encoded = encode_block(stream_ref, chunk, self.config.compression);
            let handle = BlockHandle {
                offset: self.offset,
                len: encoded.len() as u32,
                count: chunk.len() as u32,
                range: TimeRange::new(chunk[0].timestamp, chunk[chunk.len() - 1].timestamp),
            };
            self.write(&encoded)?;
            self.index.push((stream_ref, handle));
        }

        self.point_count += points.len() as u64;
        self.min_timestamp = self.min_timestamp.min(first.timestamp);
        self.max_timestamp = self.max_timestamp.max(last.timestamp);
        self.last_key = Some(key.clone());
        Ok(())
    }

    /// Write dictionary, index and footer; returns the writer
    pub fn finish(mut self, max_sequence: u64) -> Result<W> {
        let dictionary = self.encode_dictionary()?;
        let dictionary_offset = self.offset;
        self.write(&dictionary)?;

        let mut index =
            BytesMut::with_capacity(4 + self.index.len() * BlockHandle::INDEX_ENTRY_SIZE);
        index.put_u32_le(self.index.len() as u32);
        for (stream_ref, handle) in &self.index {
            handle.encode_into(*stream_ref, &mut index);
        }
        let index_offset = self.offset;
        self.write(&index)?;

        let footer = Footer {
            dictionary_offset,
            dictionary_len: dictionary.len() as u64,
            index_offset,
            index_len: index.len() as u64,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            point_count: self.point_count,
            max_sequence,
            body_crc: self.hasher.clone().finalize(),
        };
        self.writer.write_all(&footer.encode())?;
        self.writer.flush()?;

        debug!(
            streams = self.streams.len(),
            blocks = self.index.len(),
            points = self.point_count,
            bytes = self.offset + Footer::SIZE as u64,
            "Finished SSTable"
        );
        Ok(self.writer)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn intern(&mut self, s: &str) -> Result<u32> {
        if let Some(id) = self.string_ids.get(s) {
            return Ok(*id);
        }
        if s.len() > u16::MAX as usize {
            return Err(TemporaError::Validation(format!(
                "dictionary string of {} bytes is too long",
                s.len()
            )));
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        Ok(id)
    }

    fn intern_stream(&mut self, key: &StreamKey) -> Result<u32> {
        let name = self.intern(&key.name)?;
        let mut tags = Vec::with_capacity(key.tags.len());
        for (k, v) in &key.tags {
            tags.push((self.intern(k)?, self.intern(v)?));
        }
        self.streams.push((name, tags));
        Ok(self.streams.len() as u32 - 1)
    }

    fn encode_dictionary(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.strings.len() as u32);
        for s in &self.strings {
            buf.put_u16_le(s.len() as u16);
            buf.put_slice(s.as_bytes());
        }

        buf.put_u32_le(self.streams.len() as u32);
        for (name, tags) in &self.streams {
            if tags.len() > u16::MAX as usize {
                return Err(TemporaError::Validation("too many tags on one stream".into()));
            }
            buf.put_u32_le(*name);
            buf.put_u16_le(tags.len() as u16);
            for (k, v) in tags {
                buf.put_u32_le(*k);
                buf.put_u32_le(*v);
            }
        }

        Ok(buf)
    }
}

/// Encode a MemTable into SSTable bytes
pub fn encode(memtable: &MemTable, config: &SSTableConfig) -> Result<Vec<u8>> {
    let mut builder = SSTableBuilder::new(Vec::new(), config.clone())?;
    memtable.for_each_stream(|key, points| builder.add_stream(key, points))?;
    builder.finish(memtable.max_sequence())
}

/// Write a MemTable as SSTable `id` in `dir`.
///
/// The file is written under a temporary name, synced, then renamed into
/// place; the rename is the point at which the SSTable exists.
pub fn write_memtable(
    dir: &Path,
    id: u64,
    memtable: &MemTable,
    config: &SSTableConfig,
) -> Result<PathBuf> {
    let tmp = temp_path(dir, id);
    let path = sstable_path(dir, id);

    if let Err(e) = write_file(&tmp, memtable, config) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, &path)?;
    sync_dir(dir)?;

    info!(
        sstable = id,
        memtable = memtable.id(),
        points = memtable.len(),
        "Wrote SSTable {:?}",
        path
    );
    Ok(path)
}

fn write_file(tmp: &Path, memtable: &MemTable, config: &SSTableConfig) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp)?;
    let mut builder = SSTableBuilder::new(BufWriter::new(file), config.clone())?;
    memtable.for_each_stream(|key, points| builder.add_stream(key, points))?;
    let file: File = builder
        .finish(memtable.max_sequence())?
        .into_inner()
        .map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}
