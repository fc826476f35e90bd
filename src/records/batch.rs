//! Record batch (magic 2) encoding and decoding.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    bytes::complete::take,
    number::complete::{be_i8, be_i16, be_i32, be_i64, be_u32},
};
use nombytes::NomBytes;

use super::{DecodedBatch, DecodedRecord, RecordData};
use crate::compression::CompressionCodec;
use crate::constants::{
    BATCH_LOG_OVERHEAD, COMPRESSION_CODEC_MASK, CONTROL_FLAG_MASK, MAX_PROTOCOL_ARRAY_SIZE,
    MIN_BATCH_HEADER_SIZE, TIMESTAMP_TYPE_MASK, TRANSACTIONAL_FLAG_MASK,
};
use crate::encode::{encode_varint, encode_varint_bytes, encode_varlong};
use crate::error::{Error, Result};
use crate::parser::{parse_error, parse_varint, parse_varint_bytes, parse_varlong};
use crate::protocol::{CrcValidationResult, stamp_batch_crc, validate_batch_crc};
use crate::types::RecordHeader;

/// Upper bound of the per-record framing overhead inside a v2 batch.
pub const MAX_RECORD_OVERHEAD: usize = 5 * 5 + 10 + 1;

/// A single record inside a v2 batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub attributes: i8,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl Record {
    fn encode_into(&self, buffer: &mut BytesMut) {
        let mut body = BytesMut::new();
        body.put_i8(self.attributes);
        encode_varlong(&mut body, self.timestamp_delta);
        encode_varint(&mut body, self.offset_delta);
        encode_varint_bytes(&mut body, self.key.as_deref());
        encode_varint_bytes(&mut body, self.value.as_deref());
        encode_varint(&mut body, self.headers.len() as i32);
        for header in &self.headers {
            encode_varint_bytes(&mut body, Some(&header.key));
            encode_varint_bytes(&mut body, header.value.as_deref());
        }

        encode_varint(buffer, body.len() as i32);
        buffer.put_slice(&body);
    }
}

fn parse_record(s: NomBytes) -> IResult<NomBytes, Record> {
    let (s, length) = parse_varint(s)?;
    if length < 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    let (s, body) = take(length as usize)(s)?;

    let (b, attributes) = be_i8(body)?;
    let (b, timestamp_delta) = parse_varlong(b)?;
    let (b, offset_delta) = parse_varint(b)?;
    let (b, key) = parse_varint_bytes(b)?;
    let (b, value) = parse_varint_bytes(b)?;
    let (mut b, count) = parse_varint(b)?;
    if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&count) {
        return Err(nom::Err::Failure(nom::error::Error::new(
            b,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    let mut headers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (next, key) = parse_varint_bytes(b)?;
        let (next, value) = parse_varint_bytes(next)?;
        headers.push(RecordHeader {
            key: key.unwrap_or_default(),
            value,
        });
        b = next;
    }

    Ok((
        s,
        Record {
            attributes,
            timestamp_delta,
            offset_delta,
            key,
            value,
            headers,
        },
    ))
}

/// Kind of marker carried by a control batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecordType {
    Abort,
    Commit,
}

impl ControlRecordType {
    /// Control record key: version (i16) followed by type (i16).
    pub fn key(self) -> Bytes {
        let mut key = BytesMut::with_capacity(4);
        key.put_i16(0);
        key.put_i16(match self {
            ControlRecordType::Abort => 0,
            ControlRecordType::Commit => 1,
        });
        key.freeze()
    }

    /// Control record value: version (i16) followed by the coordinator epoch.
    pub fn value(coordinator_epoch: i32) -> Bytes {
        let mut value = BytesMut::with_capacity(6);
        value.put_i16(0);
        value.put_i32(coordinator_epoch);
        value.freeze()
    }

    pub fn parse(key: &[u8]) -> Option<Self> {
        match key.get(2..4)? {
            [0, 0] => Some(ControlRecordType::Abort),
            [0, 1] => Some(ControlRecordType::Commit),
            _ => None,
        }
    }
}

/// A v2 record batch with its records decompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub codec: CompressionCodec,
    pub log_append_time: bool,
    pub transactional: bool,
    pub control: bool,
    pub last_offset_delta: i32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub records: Vec<Record>,
}

impl RecordBatch {
    /// Builds a batch whose records get consecutive offset deltas.
    pub fn from_records(meta: &super::BatchMeta, records: &[RecordData]) -> Self {
        let first_timestamp = records.iter().map(|r| r.timestamp).min().unwrap_or(0);
        let max_timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or(0);
        let records = records
            .iter()
            .enumerate()
            .map(|(i, r)| Record {
                attributes: 0,
                timestamp_delta: r.timestamp - first_timestamp,
                offset_delta: i as i32,
                key: r.key.clone(),
                value: r.value.clone(),
                headers: r.headers.clone(),
            })
            .collect::<Vec<_>>();

        RecordBatch {
            base_offset: meta.base_offset,
            partition_leader_epoch: 0,
            codec: meta.codec,
            log_append_time: false,
            transactional: meta.transactional,
            control: meta.control,
            last_offset_delta: records.len().saturating_sub(1) as i32,
            first_timestamp,
            max_timestamp,
            producer_id: meta.producer_id,
            producer_epoch: meta.producer_epoch,
            base_sequence: meta.base_sequence,
            records,
        }
    }

    /// A single-record commit or abort marker.
    pub fn control_batch(
        kind: ControlRecordType,
        producer_id: i64,
        producer_epoch: i16,
        base_offset: i64,
        timestamp: i64,
    ) -> Self {
        RecordBatch {
            base_offset,
            partition_leader_epoch: 0,
            codec: CompressionCodec::None,
            log_append_time: false,
            transactional: true,
            control: true,
            last_offset_delta: 0,
            first_timestamp: timestamp,
            max_timestamp: timestamp,
            producer_id,
            producer_epoch,
            base_sequence: -1,
            records: vec![Record {
                key: Some(kind.key()),
                value: Some(ControlRecordType::value(0)),
                ..Default::default()
            }],
        }
    }

    pub fn attributes(&self) -> i16 {
        let mut attributes = self.codec.id() as i16 & COMPRESSION_CODEC_MASK;
        if self.log_append_time {
            attributes |= TIMESTAMP_TYPE_MASK;
        }
        if self.transactional {
            attributes |= TRANSACTIONAL_FLAG_MASK;
        }
        if self.control {
            attributes |= CONTROL_FLAG_MASK;
        }
        attributes
    }

    pub fn last_offset(&self) -> i64 {
        self.base_offset + self.last_offset_delta as i64
    }

    /// Marker type of a control batch.
    pub fn control_type(&self) -> Option<ControlRecordType> {
        if !self.control {
            return None;
        }
        self.records
            .first()
            .and_then(|r| r.key.as_deref())
            .and_then(ControlRecordType::parse)
    }

    pub fn encode(&self, compression_level: i32) -> Result<Bytes> {
        let mut body = BytesMut::new();
        for record in &self.records {
            record.encode_into(&mut body);
        }
        let payload = self.codec.compress(&body, compression_level)?;

        let mut buf = BytesMut::with_capacity(MIN_BATCH_HEADER_SIZE + payload.len());
        buf.put_i64(self.base_offset);
        buf.put_i32((MIN_BATCH_HEADER_SIZE - BATCH_LOG_OVERHEAD + payload.len()) as i32);
        buf.put_i32(self.partition_leader_epoch);
        buf.put_i8(2);
        buf.put_u32(0);
        buf.put_i16(self.attributes());
        buf.put_i32(self.last_offset_delta);
        buf.put_i64(self.first_timestamp);
        buf.put_i64(self.max_timestamp);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
        buf.put_i32(self.base_sequence);
        buf.put_i32(self.records.len() as i32);
        buf.put_slice(&payload);

        stamp_batch_crc(&mut buf);
        Ok(buf.freeze())
    }

    /// Decodes one complete batch, verifying its CRC.
    pub fn decode(entry: Bytes) -> Result<Self> {
        match validate_batch_crc(&entry) {
            CrcValidationResult::Valid => {}
            CrcValidationResult::Invalid { expected, actual } => {
                return Err(Error::Encoding(format!(
                    "record batch crc mismatch: stored {:#010x}, computed {:#010x}",
                    expected, actual
                )));
            }
            CrcValidationResult::TooSmall => {
                return Err(Error::Encoding("record batch too small".to_string()));
            }
        }

        let (_, (mut batch, count, payload)) =
            parse_batch_header(NomBytes::new(entry)).map_err(parse_error("record batch"))?;

        let payload = batch.codec.decompress(&payload)?;
        let mut input = NomBytes::new(payload);
        for _ in 0..count {
            let (next, record) = parse_record(input).map_err(parse_error("record"))?;
            batch.records.push(record);
            input = next;
        }
        Ok(batch)
    }

    pub fn into_decoded(self) -> DecodedBatch {
        let last_offset = self.last_offset();
        let base_offset = self.base_offset;
        let first_timestamp = self.first_timestamp;
        let max_timestamp = self.max_timestamp;
        let log_append_time = self.log_append_time;
        let control_type = self.control_type();

        let records = self
            .records
            .into_iter()
            .map(|r| DecodedRecord {
                offset: base_offset + r.offset_delta as i64,
                timestamp: if log_append_time {
                    max_timestamp
                } else {
                    first_timestamp + r.timestamp_delta
                },
                key: r.key,
                value: r.value,
                headers: r.headers,
            })
            .collect();

        DecodedBatch {
            magic: 2,
            base_offset,
            last_offset,
            codec: self.codec,
            producer_id: self.producer_id,
            producer_epoch: self.producer_epoch,
            base_sequence: self.base_sequence,
            transactional: self.transactional,
            control: self.control,
            control_type,
            records,
        }
    }
}

fn parse_batch_header(s: NomBytes) -> IResult<NomBytes, (RecordBatch, i32, Bytes)> {
    let (s, base_offset) = be_i64(s)?;
    let (s, _batch_length) = be_i32(s)?;
    let (s, partition_leader_epoch) = be_i32(s)?;
    let (s, _magic) = be_i8(s)?;
    let (s, _crc) = be_u32(s)?;
    let (s, attributes) = be_i16(s)?;
    let (s, last_offset_delta) = be_i32(s)?;
    let (s, first_timestamp) = be_i64(s)?;
    let (s, max_timestamp) = be_i64(s)?;
    let (s, producer_id) = be_i64(s)?;
    let (s, producer_epoch) = be_i16(s)?;
    let (s, base_sequence) = be_i32(s)?;
    let (s, count) = be_i32(s)?;

    let codec = CompressionCodec::from_id((attributes & COMPRESSION_CODEC_MASK) as i8).map_err(
        |_| {
            nom::Err::Failure(nom::error::Error::new(
                s.clone(),
                nom::error::ErrorKind::Verify,
            ))
        },
    )?;
    if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&count) {
        return Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::TooLarge,
        )));
    }

    let payload = s.into_bytes();
    Ok((
        NomBytes::new(Bytes::new()),
        (
            RecordBatch {
                base_offset,
                partition_leader_epoch,
                codec,
                log_append_time: attributes & TIMESTAMP_TYPE_MASK != 0,
                transactional: attributes & TRANSACTIONAL_FLAG_MASK != 0,
                control: attributes & CONTROL_FLAG_MASK != 0,
                last_offset_delta,
                first_timestamp,
                max_timestamp,
                producer_id,
                producer_epoch,
                base_sequence,
                records: Vec::with_capacity(count as usize),
            },
            count,
            payload,
        ),
    ))
}
