//! Legacy message sets (magic 0 and 1).
//!
//! A compressed message set is a single wrapper message whose value holds the
//! compressed inner messages. For magic 1 the inner offsets are relative and
//! the wrapper carries the absolute offset of the last inner message; for
//! magic 0 the inner offsets are absolute.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i8, be_i32, be_i64, be_u32},
};
use nombytes::NomBytes;

use super::{BatchMeta, DecodedBatch, DecodedRecord, RecordData};
use crate::compression::CompressionCodec;
use crate::constants::{COMPRESSION_CODEC_MASK, NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE};
use crate::error::{Error, Result};
use crate::parser::{parse_error, parse_nullable_bytes};
use crate::protocol::{crc32_ieee, peek_entry};

/// Timestamp-type bit of a magic 1 message.
const LOG_APPEND_TIME_MASK: i8 = 0x08;

/// Per-message framing: offset, size, crc, magic, attributes, key and value lengths.
pub const MESSAGE_OVERHEAD_V0: usize = 8 + 4 + 4 + 1 + 1 + 4 + 4;
pub const MESSAGE_OVERHEAD_V1: usize = MESSAGE_OVERHEAD_V0 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Message {
    magic: i8,
    attributes: i8,
    timestamp: i64,
    key: Option<Bytes>,
    value: Option<Bytes>,
}

impl Message {
    fn codec(&self) -> Result<CompressionCodec> {
        CompressionCodec::from_id((self.attributes as i16 & COMPRESSION_CODEC_MASK) as i8)
    }

    fn write_entry(&self, offset: i64, buffer: &mut BytesMut) {
        let mut body = BytesMut::new();
        body.put_i8(self.magic);
        body.put_i8(self.attributes);
        if self.magic >= 1 {
            body.put_i64(self.timestamp);
        }
        put_nullable_bytes(&mut body, self.key.as_deref());
        put_nullable_bytes(&mut body, self.value.as_deref());

        buffer.put_i64(offset);
        buffer.put_i32((body.len() + 4) as i32);
        buffer.put_u32(crc32_ieee(&body));
        buffer.put_slice(&body);
    }
}

fn put_nullable_bytes(buffer: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buffer.put_i32(data.len() as i32);
            buffer.put_slice(data);
        }
        None => buffer.put_i32(-1),
    }
}

fn parse_message_entry(s: NomBytes) -> IResult<NomBytes, (i64, u32, Bytes)> {
    let (s, offset) = be_i64(s)?;
    let (s, _size) = be_i32(s)?;
    let (s, crc) = be_u32(s)?;
    Ok((NomBytes::new(Bytes::new()), (offset, crc, s.into_bytes())))
}

fn parse_message_body(s: NomBytes) -> IResult<NomBytes, Message> {
    let (s, magic) = be_i8(s)?;
    let (s, attributes) = be_i8(s)?;
    let (s, timestamp) = if magic >= 1 { be_i64(s)? } else { (s, -1) };
    let (s, key) = parse_nullable_bytes(s)?;
    let (s, value) = parse_nullable_bytes(s)?;
    Ok((
        s,
        Message {
            magic,
            attributes,
            timestamp,
            key,
            value,
        },
    ))
}

fn decode_message(entry: Bytes) -> Result<(i64, Message)> {
    let (_, (offset, crc, body)) =
        parse_message_entry(NomBytes::new(entry)).map_err(parse_error("message"))?;
    let actual = crc32_ieee(&body);
    if actual != crc {
        return Err(Error::Encoding(format!(
            "message crc mismatch: stored {:#010x}, computed {:#010x}",
            crc, actual
        )));
    }
    let (_, message) = parse_message_body(NomBytes::new(body)).map_err(parse_error("message"))?;
    Ok((offset, message))
}

/// Encodes records as a magic 0/1 message set, compressed into a single
/// wrapper message when the codec asks for it.
pub fn encode_message_set(
    magic: i8,
    meta: &BatchMeta,
    compression_level: i32,
    records: &[RecordData],
) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    let message = |r: &RecordData| Message {
        magic,
        attributes: 0,
        timestamp: r.timestamp,
        key: r.key.clone(),
        value: r.value.clone(),
    };

    if meta.codec == CompressionCodec::None {
        for (i, record) in records.iter().enumerate() {
            message(record).write_entry(meta.base_offset + i as i64, &mut buffer);
        }
        return Ok(buffer.freeze());
    }

    let mut inner = BytesMut::new();
    for (i, record) in records.iter().enumerate() {
        let offset = if magic >= 1 {
            i as i64
        } else {
            meta.base_offset + i as i64
        };
        message(record).write_entry(offset, &mut inner);
    }

    let wrapper = Message {
        magic,
        attributes: meta.codec.id(),
        timestamp: records.iter().map(|r| r.timestamp).max().unwrap_or(-1),
        key: None,
        value: Some(meta.codec.compress(&inner, compression_level)?),
    };
    let last_offset = meta.base_offset + records.len().saturating_sub(1) as i64;
    wrapper.write_entry(last_offset, &mut buffer);
    Ok(buffer.freeze())
}

/// Decodes one complete message-set entry, expanding compressed wrappers.
pub fn decode_entry(entry: Bytes) -> Result<DecodedBatch> {
    let (offset, message) = decode_message(entry)?;
    let codec = message.codec()?;

    let records = if codec == CompressionCodec::None {
        vec![DecodedRecord {
            offset,
            timestamp: message.timestamp,
            key: message.key,
            value: message.value,
            headers: vec![],
        }]
    } else {
        let compressed = message.value.unwrap_or_default();
        let mut inner = codec.decompress(&compressed)?;
        let mut messages = Vec::new();
        while !inner.is_empty() {
            let header = peek_entry(&inner)
                .ok_or_else(|| Error::Encoding("truncated compressed message set".into()))?;
            let (inner_offset, inner_message) = decode_message(inner.split_to(header.total_len))?;
            if inner_message.codec()? != CompressionCodec::None {
                return Err(Error::Encoding("nested compressed message".into()));
            }
            messages.push((inner_offset, inner_message));
        }

        let last_relative = messages.last().map(|(o, _)| *o).unwrap_or(0);
        let log_append_time = message.attributes & LOG_APPEND_TIME_MASK != 0;
        messages
            .into_iter()
            .map(|(inner_offset, m)| DecodedRecord {
                offset: if message.magic >= 1 {
                    offset - last_relative + inner_offset
                } else {
                    inner_offset
                },
                timestamp: if log_append_time {
                    message.timestamp
                } else {
                    m.timestamp
                },
                key: m.key,
                value: m.value,
                headers: vec![],
            })
            .collect::<Vec<_>>()
    };

    let base_offset = records.first().map(|r| r.offset).unwrap_or(offset);
    let last_offset = records.last().map(|r| r.offset).unwrap_or(offset);
    Ok(DecodedBatch {
        magic: message.magic,
        base_offset,
        last_offset,
        codec,
        producer_id: NO_PRODUCER_ID,
        producer_epoch: NO_PRODUCER_EPOCH,
        base_sequence: NO_SEQUENCE,
        transactional: false,
        control: false,
        control_type: None,
        records,
    })
}
