//! SSTable (Sorted String Table) implementation
//!
//! Immutable on-disk storage produced by a flush. Layout:
//!
//! ```text
//! +--------+-----------------+------------+-------+--------+
//! | header | stream blocks.. | dictionary | index | footer |
//! +--------+-----------------+------------+-------+--------+
//! ```
//!
//! - Each stream is split into blocks of consecutive points; a block holds
//!   a delta-encoded timestamp column and a value column, optionally LZ4
//!   compressed, followed by its own CRC32.
//! - The dictionary interns series names and tag strings; blocks and
//!   index entries refer to streams by position in it.
//! - The index lists every block with its offset and time range so a
//!   reader seeks straight to the blocks a range read needs.
//! - The fixed-size footer carries section offsets, the global time
//!   range, a CRC over everything before it, and a CRC of itself.

mod block;
mod builder;
mod reader;

pub use block::BlockHandle;
pub use builder::{encode, write_memtable, SSTableBuilder};
pub use reader::SSTable;

use crate::{Result, TemporaError, TimeRange, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use std::fs;
use std::path::{Path, PathBuf};

/// SSTable file format version
pub const FORMAT_VERSION: u32 = 1;

/// Magic bytes opening and closing every SSTable
pub const MAGIC: [u8; 4] = *b"TSST";

/// Header: magic + version
pub const HEADER_SIZE: usize = 8;

/// SSTable metadata
#[derive(Debug, Clone, PartialEq)]
pub struct SSTableMeta {
    /// Unique ID, increasing in commit order
    pub id: u64,
    /// File path
    pub path: PathBuf,
    /// Earliest and latest timestamp stored
    pub range: TimeRange,
    /// Number of points
    pub point_count: u64,
    /// Number of streams
    pub stream_count: usize,
    /// Highest WAL sequence number covered by this file
    pub max_sequence: u64,
    /// File size in bytes
    pub file_size: u64,
}

impl SSTableMeta {
    /// Check if the SSTable may contain data in time range
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.range.overlaps(range)
    }
}

/// SSTable configuration
#[derive(Debug, Clone)]
pub struct SSTableConfig {
    /// Maximum points per block
    pub block_points: usize,
    /// Compress block columns with LZ4 when it saves space
    pub compression: bool,
    /// Verify the whole-body checksum when a file is opened
    pub verify_checksums_on_open: bool,
}

impl Default for SSTableConfig {
    fn default() -> Self {
        Self {
            block_points: 4096,
            compression: true,
            verify_checksums_on_open: true,
        }
    }
}

/// Fixed-size trailer locating every other section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Footer {
    pub dictionary_offset: u64,
    pub dictionary_len: u64,
    pub index_offset: u64,
    pub index_len: u64,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub point_count: u64,
    pub max_sequence: u64,
    /// CRC32 over every byte before the footer
    pub body_crc: u32,
}

impl Footer {
    /// Encoded size: eight u64 fields, two CRCs, magic
    pub const SIZE: usize = 8 * 8 + 4 + 4 + 4;

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64_le(self.dictionary_offset);
        buf.put_u64_le(self.dictionary_len);
        buf.put_u64_le(self.index_offset);
        buf.put_u64_le(self.index_len);
        buf.put_i64_le(self.min_timestamp);
        buf.put_i64_le(self.max_timestamp);
        buf.put_u64_le(self.point_count);
        buf.put_u64_le(self.max_sequence);
        buf.put_u32_le(self.body_crc);
        let footer_crc = crc32fast::hash(&buf);
        buf.put_u32_le(footer_crc);
        buf.put_slice(&MAGIC);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::SIZE {
            return Err(TemporaError::InvalidFormat("SSTable footer too short".into()));
        }
        if data[Self::SIZE - 4..] != MAGIC {
            return Err(TemporaError::Corruption("invalid SSTable footer magic".into()));
        }

        let covered = Self::SIZE - 8;
        let mut cursor = &data[covered..];
        let expected = cursor.get_u32_le();
        let actual = crc32fast::hash(&data[..covered]);
        if expected != actual {
            return Err(TemporaError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = &data[..covered];
        Ok(Self {
            dictionary_offset: cursor.get_u64_le(),
            dictionary_len: cursor.get_u64_le(),
            index_offset: cursor.get_u64_le(),
            index_len: cursor.get_u64_le(),
            min_timestamp: cursor.get_i64_le(),
            max_timestamp: cursor.get_i64_le(),
            point_count: cursor.get_u64_le(),
            max_sequence: cursor.get_u64_le(),
            body_crc: cursor.get_u32_le(),
        })
    }
}

/// Final path of an SSTable inside the data directory
pub fn sstable_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:020}.sst", id))
}

/// Path an SSTable is written to before being renamed into place
pub fn temp_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:020}.sst.tmp", id))
}

/// SSTable files found in a data directory
#[derive(Debug, Default)]
pub struct DirListing {
    /// Ids of complete SSTables, ascending
    pub tables: Vec<u64>,
    /// Leftover temporary files from interrupted flushes
    pub temporaries: Vec<PathBuf>,
}

/// List SSTables and leftover temporaries in `dir`
pub fn list_dir(dir: &Path) -> Result<DirListing> {
    let mut listing = DirListing::default();
    if !dir.exists() {
        return Ok(listing);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".sst.tmp") {
            listing.temporaries.push(path);
        } else if let Some(id) = name.strip_suffix(".sst").and_then(|s| s.parse().ok()) {
            listing.tables.push(id);
        }
    }

    listing.tables.sort_unstable();
    Ok(listing)
}
