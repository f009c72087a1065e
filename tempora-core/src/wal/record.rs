//! WAL record and segment header serialization

use crate::{Result, TemporaError, WriteBatch};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Segment file magic bytes
pub const SEGMENT_MAGIC: [u8; 4] = *b"TWAL";

/// Segment format version
pub const SEGMENT_VERSION: u16 = 1;

/// Segment header: magic, version, segment id
pub const SEGMENT_HEADER_SIZE: usize = 4 + 2 + 8;

/// Record header: payload length, sequence, header checksum, payload checksum
pub const RECORD_HEADER_SIZE: usize = 4 + 8 + 4 + 4;

/// A single durable write: one accepted batch and its sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Process-wide monotonic sequence number
    pub sequence: u64,
    /// The accepted write batch
    pub batch: WriteBatch,
}

/// Outcome of decoding one record from the front of a buffer
#[derive(Debug)]
pub enum RecordRead {
    /// A valid record and the number of bytes it occupies
    Complete { record: WalRecord, len: usize },
    /// The buffer ends before the record does
    Truncated,
    /// The length or sequence failed verification, so the record's extent
    /// is unknown
    BadHeader { error: TemporaError },
    /// The record is framed correctly but its content cannot be trusted
    Corrupt { len: usize, error: TemporaError },
}

impl WalRecord {
    /// Create a new record
    pub fn new(sequence: u64, batch: WriteBatch) -> Self {
        Self { sequence, batch }
    }

    /// Serialize a record with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: payload length
    /// - 8 bytes: sequence number
    /// - 4 bytes: CRC32 over payload length and sequence number
    /// - 4 bytes: CRC32 over sequence number and payload
    /// - N bytes: bincode-encoded batch
    pub fn encode(sequence: u64, batch: &WriteBatch) -> Result<Bytes> {
        let payload = bincode::serialize(batch)?;
        if payload.len() > u32::MAX as usize {
            return Err(TemporaError::Validation(format!(
                "batch of {} bytes exceeds the WAL record limit",
                payload.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_u64_le(sequence);
        buf.put_u32_le(Self::header_checksum(payload.len() as u32, sequence));
        buf.put_u32_le(Self::checksum(sequence, &payload));
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode the record at the front of `data`, validating both checksums.
    ///
    /// The length is only trusted once the header checksum matches.
    pub fn decode(data: &[u8]) -> RecordRead {
        if data.len() < RECORD_HEADER_SIZE {
            return RecordRead::Truncated;
        }

        let mut cursor = &data[..RECORD_HEADER_SIZE];
        let raw_len = cursor.get_u32_le();
        let sequence = cursor.get_u64_le();
        let header_expected = cursor.get_u32_le();
        let expected = cursor.get_u32_le();

        let header_actual = Self::header_checksum(raw_len, sequence);
        if header_expected != header_actual {
            return RecordRead::BadHeader {
                error: TemporaError::ChecksumMismatch {
                    expected: header_expected,
                    actual: header_actual,
                },
            };
        }

        let payload_len = raw_len as usize;
        let len = RECORD_HEADER_SIZE + payload_len;
        if data.len() < len {
            return RecordRead::Truncated;
        }

        let payload = &data[RECORD_HEADER_SIZE..len];
        let actual = Self::checksum(sequence, payload);
        if expected != actual {
            return RecordRead::Corrupt {
                len,
                error: TemporaError::ChecksumMismatch { expected, actual },
            };
        }

        match bincode::deserialize::<WriteBatch>(payload) {
            Ok(batch) => RecordRead::Complete {
                record: WalRecord { sequence, batch },
                len,
            },
            Err(e) => RecordRead::Corrupt {
                len,
                error: TemporaError::Corruption(format!(
                    "record {} has a valid checksum but an undecodable payload: {}",
                    sequence, e
                )),
            },
        }
    }

    fn header_checksum(payload_len: u32, sequence: u64) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload_len.to_le_bytes());
        hasher.update(&sequence.to_le_bytes());
        hasher.finalize()
    }

    fn checksum(sequence: u64, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&sequence.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }
}

/// Encode the header written at the start of every segment
pub fn encode_segment_header(segment_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_SIZE);
    buf.put_slice(&SEGMENT_MAGIC);
    buf.put_u16_le(SEGMENT_VERSION);
    buf.put_u64_le(segment_id);
    buf.freeze()
}

/// Decode a segment header, returning the segment id it names
pub fn decode_segment_header(data: &[u8]) -> Result<u64> {
    if data.len() < SEGMENT_HEADER_SIZE {
        return Err(TemporaError::InvalidFormat("segment header too short".into()));
    }

    let mut cursor = &data[..SEGMENT_HEADER_SIZE];
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if magic != SEGMENT_MAGIC {
        return Err(TemporaError::Corruption("invalid WAL segment magic".into()));
    }

    let version = cursor.get_u16_le();
    if version != SEGMENT_VERSION {
        return Err(TemporaError::InvalidFormat(format!(
            "unsupported WAL segment version: {}",
            version
        )));
    }

    Ok(cursor.get_u64_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamKey;

    fn sample_batch() -> WriteBatch {
        let key = StreamKey::new("temperature").with_tag("sensor", "s1");
        WriteBatch::new()
            .with(key.clone(), 1_000_000, 23.5)
            .with(key, 2_000_000, 23.75)
    }

    #[test]
    fn test_record_serialization() {
        let batch = sample_batch();
        let encoded = WalRecord::encode(42, &batch).unwrap();

        match WalRecord::decode(&encoded) {
            RecordRead::Complete { record, len } => {
                assert_eq!(len, encoded.len());
                assert_eq!(record.sequence, 42);
                assert_eq!(record.batch, batch);
            }
            other => panic!("expected a complete record, got {:?}", other),
        }
    }

    #[test]
    fn test_checksum_validation() {
        let mut encoded = WalRecord::encode(7, &sample_batch()).unwrap().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        match WalRecord::decode(&encoded) {
            RecordRead::Corrupt { len, error } => {
                assert_eq!(len, encoded.len());
                assert!(error.is_corruption());
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_is_covered_by_checksum() {
        let mut encoded = WalRecord::encode(7, &sample_batch()).unwrap().to_vec();
        encoded[4] ^= 0x01;
        assert!(matches!(
            WalRecord::decode(&encoded),
            RecordRead::BadHeader { .. }
        ));
    }

    #[test]
    fn test_length_is_covered_by_checksum() {
        let mut encoded = WalRecord::encode(7, &sample_batch()).unwrap().to_vec();
        // A grown length would otherwise read as a record running past the buffer
        encoded[3] ^= 0x80;
        match WalRecord::decode(&encoded) {
            RecordRead::BadHeader { error } => assert!(error.is_corruption()),
            other => panic!("expected a bad header, got {:?}", other),
        }

        let mut shrunk = WalRecord::encode(7, &sample_batch()).unwrap().to_vec();
        shrunk[0] ^= 0x01;
        assert!(matches!(
            WalRecord::decode(&shrunk),
            RecordRead::BadHeader { .. }
        ));
    }

    #[test]
    fn test_truncated_record() {
        let encoded = WalRecord::encode(1, &sample_batch()).unwrap();
        assert!(matches!(
            WalRecord::decode(&encoded[..encoded.len() - 3]),
            RecordRead::Truncated
        ));
        assert!(matches!(WalRecord::decode(&encoded[..5]), RecordRead::Truncated));
    }

    #[test]
    fn test_segment_header() {
        let header = encode_segment_header(9);
        assert_eq!(decode_segment_header(&header).unwrap(), 9);

        let mut bad = header.to_vec();
        bad[0] = b'X';
        assert!(decode_segment_header(&bad).unwrap_err().is_corruption());
        assert!(decode_segment_header(&header[..3]).is_err());
    }
}
