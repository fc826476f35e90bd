//! ListOffsets API codec.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i8, be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, KafkaCodec, check_version, run_parser};
use crate::constants::CONSUMER_REPLICA_ID;
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_string};
use crate::types::IsolationLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsRequest {
    pub replica_id: i32,
    pub isolation_level: IsolationLevel,
    pub topics: Vec<ListOffsetsTopic>,
}

impl ListOffsetsRequest {
    /// Request for a single partition.
    pub fn single(topic: &str, partition: i32, timestamp: i64) -> Self {
        ListOffsetsRequest {
            replica_id: CONSUMER_REPLICA_ID,
            isolation_level: IsolationLevel::ReadUncommitted,
            topics: vec![ListOffsetsTopic {
                name: topic.to_string(),
                partitions: vec![ListOffsetsPartition {
                    partition_index: partition,
                    timestamp,
                    max_num_offsets: 1,
                }],
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsPartition {
    pub partition_index: i32,
    /// Target time in ms, or `OFFSET_NEWEST` / `OFFSET_OLDEST`.
    pub timestamp: i64,
    /// v0 only.
    pub max_num_offsets: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOffsetsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<ListOffsetsTopicResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsTopicResponse {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

/// One partition's answer. v0 returns a list of offsets; only its first
/// entry is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOffsetsPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub timestamp: i64,
    pub offset: i64,
}

impl ListOffsetsResponse {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&ListOffsetsPartitionResponse> {
        self.topics
            .iter()
            .find(|t| t.name == topic)
            .and_then(|t| t.partitions.iter().find(|p| p.partition_index == partition))
    }
}

fn encode_list_offsets_request<W: BufMut>(
    request: &ListOffsetsRequest,
    buffer: &mut W,
    version: i16,
) -> Result<()> {
    request.replica_id.encode(buffer)?;
    if version >= 2 {
        request.isolation_level.as_i8().encode(buffer)?;
    }
    encode_as_array(buffer, &request.topics, |b, topic| {
        topic.name.encode(b)?;
        encode_as_array(b, &topic.partitions, |b, p| {
            p.partition_index.encode(b)?;
            p.timestamp.encode(b)?;
            if version == 0 {
                p.max_num_offsets.encode(b)?;
            }
            Ok(())
        })
    })
}

fn parse_list_offsets_partition(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ListOffsetsPartition> {
    let (s, partition_index) = be_i32(s)?;
    let (s, timestamp) = be_i64(s)?;
    let (s, max_num_offsets) = if version == 0 { be_i32(s)? } else { (s, 1) };
    Ok((
        s,
        ListOffsetsPartition {
            partition_index,
            timestamp,
            max_num_offsets,
        },
    ))
}

fn parse_list_offsets_topic(s: NomBytes, version: i16) -> IResult<NomBytes, ListOffsetsTopic> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) = parse_array(move |s| parse_list_offsets_partition(s, version))(s)?;
    Ok((s, ListOffsetsTopic { name, partitions }))
}

pub fn parse_list_offsets_request(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ListOffsetsRequest> {
    let (s, replica_id) = be_i32(s)?;
    let (s, isolation_level) = if version >= 2 { be_i8(s)? } else { (s, 0) };
    let (s, topics) = parse_array(move |s| parse_list_offsets_topic(s, version))(s)?;
    Ok((
        s,
        ListOffsetsRequest {
            replica_id,
            isolation_level: IsolationLevel::from_i8(isolation_level),
            topics,
        },
    ))
}

fn encode_list_offsets_response<W: BufMut>(
    response: &ListOffsetsResponse,
    buffer: &mut W,
    version: i16,
) -> Result<()> {
    if version >= 2 {
        response.throttle_time_ms.encode(buffer)?;
    }
    encode_as_array(buffer, &response.topics, |b, topic| {
        topic.name.encode(b)?;
        encode_as_array(b, &topic.partitions, |b, p| {
            p.partition_index.encode(b)?;
            (p.error_code as i16).encode(b)?;
            if version == 0 {
                let offsets: &[i64] = if p.offset >= 0 {
                    std::slice::from_ref(&p.offset)
                } else {
                    &[]
                };
                offsets.encode(b)
            } else {
                p.timestamp.encode(b)?;
                p.offset.encode(b)
            }
        })
    })
}

fn parse_list_offsets_partition_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ListOffsetsPartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, timestamp, offset) = if version == 0 {
        let (s, offsets) = parse_array(be_i64)(s)?;
        (s, -1, offsets.first().copied().unwrap_or(-1))
    } else {
        let (s, timestamp) = be_i64(s)?;
        let (s, offset) = be_i64(s)?;
        (s, timestamp, offset)
    };
    Ok((
        s,
        ListOffsetsPartitionResponse {
            partition_index,
            error_code: KafkaCode::from_wire(error_code),
            timestamp,
            offset,
        },
    ))
}

fn parse_list_offsets_topic_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ListOffsetsTopicResponse> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) =
        parse_array(move |s| parse_list_offsets_partition_response(s, version))(s)?;
    Ok((s, ListOffsetsTopicResponse { name, partitions }))
}

pub fn parse_list_offsets_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ListOffsetsResponse> {
    let (s, throttle_time_ms) = if version >= 2 { be_i32(s)? } else { (s, 0) };
    let (s, topics) = parse_array(move |s| parse_list_offsets_topic_response(s, version))(s)?;
    Ok((
        s,
        ListOffsetsResponse {
            throttle_time_ms,
            topics,
        },
    ))
}

/// Codec for the ListOffsets API.
pub struct ListOffsetsCodec;

impl KafkaCodec for ListOffsetsCodec {
    type Request = ListOffsetsRequest;
    type Response = ListOffsetsResponse;

    fn api_key() -> ApiKey {
        ApiKey::ListOffsets
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        2
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(64);
        encode_list_offsets_request(request, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "list offsets request", |s| {
            parse_list_offsets_request(s, version)
        })
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(64);
        encode_list_offsets_response(response, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "list offsets response", |s| {
            parse_list_offsets_response(s, version)
        })
    }
}
