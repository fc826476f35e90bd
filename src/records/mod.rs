//! Record formats.
//!
//! | Magic | Cluster versions | Module |
//! |-------|------------------|--------|
//! | 0 | < 0.10 | [`legacy`] |
//! | 1 | 0.10.x | [`legacy`] |
//! | 2 | >= 0.11 | [`batch`] |
//!
//! [`encode_records`] picks the layout from the magic byte and
//! [`decode_records`] walks a fetched record set of any mix of formats,
//! tolerating the truncated trailing entry brokers send at the size limit.

pub mod batch;
pub mod legacy;

pub use batch::{ControlRecordType, Record, RecordBatch};

use bytes::Bytes;

use crate::compression::CompressionCodec;
use crate::constants::{NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE};
use crate::error::{Error, Result};
use crate::protocol::peek_entry;
use crate::types::RecordHeader;

/// A record handed to the encoder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordData {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
}

/// Batch-level fields used when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMeta {
    pub base_offset: i64,
    pub codec: CompressionCodec,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub transactional: bool,
    pub control: bool,
}

impl Default for BatchMeta {
    fn default() -> Self {
        BatchMeta {
            base_offset: 0,
            codec: CompressionCodec::None,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            base_sequence: NO_SEQUENCE,
            transactional: false,
            control: false,
        }
    }
}

/// A record with its absolute offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub offset: i64,
    /// -1 for magic 0 records.
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl DecodedRecord {
    pub fn to_record_data(&self) -> RecordData {
        RecordData {
            key: self.key.clone(),
            value: self.value.clone(),
            headers: self.headers.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// One decoded log entry: a v2 batch, a compressed legacy wrapper, or a
/// single uncompressed legacy message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub magic: i8,
    pub base_offset: i64,
    pub last_offset: i64,
    pub codec: CompressionCodec,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub transactional: bool,
    pub control: bool,
    pub control_type: Option<ControlRecordType>,
    pub records: Vec<DecodedRecord>,
}

/// Result of decoding a fetched record set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedRecordSet {
    pub batches: Vec<DecodedBatch>,
    /// The set ended with an incomplete entry that was dropped.
    pub partial_trailing: bool,
}

/// Encodes `records` in the record format identified by `magic`.
pub fn encode_records(
    magic: i8,
    meta: &BatchMeta,
    compression_level: i32,
    records: &[RecordData],
) -> Result<Bytes> {
    if meta.codec.min_magic() > magic {
        return Err(Error::UnsupportedCompression(format!(
            "{} needs record format v{} but v{} was requested",
            meta.codec,
            meta.codec.min_magic(),
            magic
        )));
    }
    match magic {
        2 => RecordBatch::from_records(meta, records).encode(compression_level),
        0 | 1 => legacy::encode_message_set(magic, meta, compression_level, records),
        other => Err(Error::UnsupportedVersion(format!("record format v{}", other))),
    }
}

/// Decodes every complete entry of a record set.
pub fn decode_records(mut data: Bytes) -> Result<DecodedRecordSet> {
    let mut set = DecodedRecordSet::default();
    while !data.is_empty() {
        let Some(header) = peek_entry(&data) else {
            set.partial_trailing = true;
            break;
        };
        let entry = data.split_to(header.total_len);
        let batch = match header.magic {
            2 => RecordBatch::decode(entry)?.into_decoded(),
            0 | 1 => legacy::decode_entry(entry)?,
            other => {
                return Err(Error::Encoding(format!("unknown record format v{}", other)));
            }
        };
        set.batches.push(batch);
    }
    Ok(set)
}

/// Upper bound of the encoded size of one record in the given format.
pub fn estimated_record_size(
    magic: i8,
    key: Option<&Bytes>,
    value: Option<&Bytes>,
    headers: &[RecordHeader],
) -> usize {
    let payload = key.map_or(0, Bytes::len) + value.map_or(0, Bytes::len);
    match magic {
        2 => {
            let header_bytes: usize = headers
                .iter()
                .map(|h| 10 + h.key.len() + h.value.as_ref().map_or(0, Bytes::len))
                .sum();
            batch::MAX_RECORD_OVERHEAD + payload + header_bytes
        }
        1 => legacy::MESSAGE_OVERHEAD_V1 + payload,
        _ => legacy::MESSAGE_OVERHEAD_V0 + payload,
    }
}
