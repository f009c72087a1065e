//! WAL reader for recovery

use super::record::{
    decode_segment_header, RecordRead, WalRecord, RECORD_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};
use super::{list_segments, segment_path, SegmentInfo, WalConfig};
use crate::{Result, WriteBatch};
use std::fs;
use tracing::{debug, info, warn};

/// A record that failed verification and was skipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRecord {
    /// Segment holding the record
    pub segment_id: u64,
    /// Byte offset of the record inside the segment
    pub offset: u64,
    /// What was wrong with it
    pub reason: String,
}

/// Incomplete fragment found at the physical end of the newest segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TornTail {
    /// Newest segment id
    pub segment_id: u64,
    /// Offset where the fragment starts; everything before it is intact
    pub offset: u64,
    /// Bytes discarded
    pub discarded: u64,
}

/// Everything recovered from the WAL directory
#[derive(Debug, Default)]
pub struct Replay {
    /// Intact records in sequence order
    pub records: Vec<WalRecord>,
    /// Sequence coverage of every segment found, oldest first
    pub segments: Vec<SegmentInfo>,
    /// Records skipped because they failed verification
    pub corrupt: Vec<CorruptRecord>,
    /// Torn write at the end of the log, if any
    pub torn_tail: Option<TornTail>,
}

impl Replay {
    /// Highest sequence number recovered
    pub fn last_sequence(&self) -> Option<u64> {
        self.records.last().map(|r| r.sequence)
    }

    /// Recovered batches in replay order
    pub fn batches(&self) -> impl Iterator<Item = &WriteBatch> {
        self.records.iter().map(|r| &r.batch)
    }

    fn flag(&mut self, segment_id: u64, offset: usize, reason: String) {
        warn!(
            segment = segment_id,
            offset, "Skipping corrupt WAL record: {}", reason
        );
        self.corrupt.push(CorruptRecord {
            segment_id,
            offset: offset as u64,
            reason,
        });
    }
}

/// WAL reader for recovering records after a crash
pub struct WalReader {
    config: WalConfig,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(config: WalConfig) -> Self {
        Self { config }
    }

    /// Scan all segments oldest to newest and collect every intact record
    ///
    /// A checksum failure anywhere but the physical end of the newest
    /// segment is corruption: the record is flagged and skipped. When a
    /// record header fails, scanning resumes at the next record that
    /// verifies. Only a fragment with no valid record after it at the end of
    /// the newest segment is a torn write, which ends the replay without
    /// error.
    pub fn replay(&self) -> Result<Replay> {
        let ids = list_segments(&self.config.dir)?;
        let newest = ids.last().copied();
        let mut replay = Replay::default();

        for id in ids {
            let data = fs::read(segment_path(&self.config.dir, id))?;
            let before = replay.records.len();
            self.replay_segment(id, &data, Some(id) == newest, &mut replay);
            info!(
                segment = id,
                records = replay.records.len() - before,
                "Replayed WAL segment"
            );
        }

        if let Some(tail) = replay.torn_tail {
            info!(
                segment = tail.segment_id,
                offset = tail.offset,
                discarded = tail.discarded,
                "Discarding torn WAL tail"
            );
        }

        Ok(replay)
    }

    fn replay_segment(&self, id: u64, data: &[u8], newest: bool, replay: &mut Replay) {
        let mut info = SegmentInfo::empty(id);

        if data.len() < SEGMENT_HEADER_SIZE {
            if newest {
                replay.torn_tail = Some(TornTail {
                    segment_id: id,
                    offset: 0,
                    discarded: data.len() as u64,
                });
            } else {
                replay.flag(id, 0, "segment header truncated".into());
                info.damaged = true;
            }
            replay.segments.push(info);
            return;
        }

        // Records are still scanned after a bad segment header
        match decode_segment_header(data) {
            Ok(header_id) if header_id == id => {}
            Ok(header_id) => {
                replay.flag(id, 0, format!("segment header names segment {}", header_id));
                info.damaged = true;
            }
            Err(e) => {
                replay.flag(id, 0, e.to_string());
                info.damaged = true;
            }
        }

        let mut offset = SEGMENT_HEADER_SIZE;
        while offset < data.len() {
            match WalRecord::decode(&data[offset..]) {
                RecordRead::Complete { record, len } => {
                    let stale = replay
                        .last_sequence()
                        .map_or(false, |last| record.sequence <= last);
                    if stale {
                        replay.flag(
                            id,
                            offset,
                            format!("sequence {} does not advance the log", record.sequence),
                        );
                        info.damaged = true;
                    } else {
                        debug!(segment = id, sequence = record.sequence, "Recovered record");
                        info.record(record.sequence);
                        replay.records.push(record);
                    }
                    offset += len;
                }
                RecordRead::Corrupt { len, .. } if newest && offset + len == data.len() => {
                    replay.torn_tail = Some(Self::torn(id, offset, data.len()));
                    break;
                }
                RecordRead::Corrupt { len, error } => {
                    replay.flag(id, offset, error.to_string());
                    info.damaged = true;
                    offset += len;
                }
                framing => {
                    // Extent unknown: resume at the next record that verifies
                    match Self::resync(data, offset + 1) {
                        Some(next) => {
                            let reason = match framing {
                                RecordRead::BadHeader { error } => error.to_string(),
                                _ => "record length runs into the next record".to_string(),
                            };
                            replay.flag(
                                id,
                                offset,
                                format!("{}; skipped {} bytes", reason, next - offset),
                            );
                            info.damaged = true;
                            offset = next;
                        }
                        None if newest => {
                            replay.torn_tail = Some(Self::torn(id, offset, data.len()));
                            break;
                        }
                        None => {
                            replay.flag(
                                id,
                                offset,
                                "unreadable record at the end of a sealed segment".into(),
                            );
                            info.damaged = true;
                            break;
                        }
                    }
                }
            }
        }

        replay.segments.push(info);
    }

    /// First offset at or after `from` where a complete record verifies
    fn resync(data: &[u8], from: usize) -> Option<usize> {
        (from..data.len().saturating_sub(RECORD_HEADER_SIZE - 1)).find(|&offset| {
            matches!(
                WalRecord::decode(&data[offset..]),
                RecordRead::Complete { .. }
            )
        })
    }

    fn torn(segment_id: u64, offset: usize, end: usize) -> TornTail {
        TornTail {
            segment_id,
            offset: offset as u64,
            discarded: (end - offset) as u64,
        }
    }
}
