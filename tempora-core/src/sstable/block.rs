//! SSTable data block implementation

use crate::{DataPoint, Result, TemporaError, TimeRange};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Block header: stream ref, point count, flags, payload length
pub const BLOCK_HEADER_SIZE: usize = 4 + 4 + 1 + 4;

/// Block trailer: CRC32 over header and payload
pub const BLOCK_TRAILER_SIZE: usize = 4;

const FLAG_LZ4: u8 = 0x01;

/// Location and coverage of one block, as recorded in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Byte offset of the block in the file
    pub offset: u64,
    /// Encoded length including header and trailer
    pub len: u32,
    /// Number of points
    pub count: u32,
    /// First and last timestamp
    pub range: TimeRange,
}

impl BlockHandle {
    /// Encoded size of an index entry (stream ref + handle)
    pub const INDEX_ENTRY_SIZE: usize = 4 + 8 + 4 + 4 + 8 + 8;

    pub(crate) fn encode_into(&self, stream_ref: u32, buf: &mut BytesMut) {
        buf.put_u32_le(stream_ref);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.count);
        buf.put_i64_le(self.range.start);
        buf.put_i64_le(self.range.end);
    }

    pub(crate) fn decode_from(cursor: &mut &[u8]) -> Result<(u32, Self)> {
        if cursor.remaining() < Self::INDEX_ENTRY_SIZE {
            return Err(TemporaError::Corruption("truncated SSTable index".into()));
        }
        let stream_ref = cursor.get_u32_le();
        let handle = Self {
            offset: cursor.get_u64_le(),
            len: cursor.get_u32_le(),
            count: cursor.get_u32_le(),
            range: TimeRange::new(cursor.get_i64_le(), cursor.get_i64_le()),
        };
        Ok((stream_ref, handle))
    }
}

/// Encode a run of ascending points as one block
pub fn encode_block(stream_ref: u32, points: &[DataPoint], compress: bool) -> Bytes {
    let columns = encode_columns(points);
    let (flags, payload) = if compress {
        let compressed = lz4_flex::compress_prepend_size(&columns);
        if compressed.len() < columns.len() {
            (FLAG_LZ4, compressed)
        } else {
            (0, columns)
        }
    } else {
        (0, columns)
    };

    let mut buf =
        BytesMut::with_capacity(BLOCK_HEADER_SIZE + payload.len() + BLOCK_TRAILER_SIZE);
    buf.put_u32_le(stream_ref);
    buf.put_u32_le(points.len() as u32);
    buf.put_u8(flags);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    buf.freeze()
}

/// Verify and decode a block read from disk
pub fn decode_block(data: &[u8], stream_ref: u32, count: u32) -> Result<Vec<DataPoint>> {
    if data.len() < BLOCK_HEADER_SIZE + BLOCK_TRAILER_SIZE {
        return Err(TemporaError::Corruption("SSTable block too short".into()));
    }

    let body_len = data.len() - BLOCK_TRAILER_SIZE;
    let expected = (&data[body_len..]).get_u32_le();
    let actual = crc32fast::hash(&data[..body_len]);
    if expected != actual {
        return Err(TemporaError::ChecksumMismatch { expected, actual });
    }

    let mut cursor = &data[..BLOCK_HEADER_SIZE];
    let block_ref = cursor.get_u32_le();
    let block_count = cursor.get_u32_le();
    let flags = cursor.get_u8();
    let payload_len = cursor.get_u32_le() as usize;

    if block_ref != stream_ref || block_count != count {
        return Err(TemporaError::Corruption(format!(
            "block header (stream {}, {} points) disagrees with index (stream {}, {} points)",
            block_ref, block_count, stream_ref, count
        )));
    }
    if BLOCK_HEADER_SIZE + payload_len != body_len {
        return Err(TemporaError::Corruption("SSTable block length mismatch".into()));
    }

    let payload = &data[BLOCK_HEADER_SIZE..body_len];
    if flags & FLAG_LZ4 != 0 {
        let columns = lz4_flex::decompress_size_prepended(payload)
            .map_err(|e| TemporaError::Corruption(format!("LZ4 block: {}", e)))?;
        decode_columns(&columns, count as usize)
    } else {
        decode_columns(payload, count as usize)
    }
}

/// Timestamp column (first absolute, then deltas) followed by value column
fn encode_columns(points: &[DataPoint]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(points.len() * DataPoint::SIZE);
    let mut prev = 0i64;
    for (i, point) in points.iter().enumerate() {
        let encoded = if i == 0 {
            point.timestamp
        } else {
            point.timestamp.wrapping_sub(prev)
        };
        buf.put_i64_le(encoded);
        prev = point.timestamp;
    }
    for point in points {
        buf.put_f64_le(point.value);
    }
    buf
}

fn decode_columns(data: &[u8], count: usize) -> Result<Vec<DataPoint>> {
    if data.len() != count * DataPoint::SIZE {
        return Err(TemporaError::Corruption(format!(
            "block columns hold {} bytes, expected {}",
            data.len(),
            count * DataPoint::SIZE
        )));
    }

    let (mut timestamps, mut values) = data.split_at(count * 8);
    let mut points = Vec::with_capacity(count);
    let mut ts = 0i64;
    for i in 0..count {
        let encoded = timestamps.get_i64_le();
        ts = if i == 0 { encoded } else { ts.wrapping_add(encoded) };
        points.push(DataPoint::new(ts, values.get_f64_le()));
    }
    Ok(points)
}
