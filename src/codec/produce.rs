//! Produce API codec.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, KafkaCodec, check_version, run_parser};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bytes, parse_nullable_string, parse_string};

/// Produce request data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopicData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceTopicData {
    pub name: String,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducePartitionData {
    pub partition_index: i32,
    /// Encoded record set in the format matching the request version.
    pub records: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProduceResponse {
    pub responses: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducePartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub base_offset: i64,
    pub log_append_time: i64,
    pub log_start_offset: i64,
}

impl ProducePartitionResponse {
    /// Create an error response for a partition.
    pub fn error(partition_index: i32, error_code: KafkaCode) -> Self {
        Self {
            partition_index,
            error_code,
            base_offset: -1,
            log_append_time: -1,
            log_start_offset: -1,
        }
    }

    /// Create a success response for a partition.
    pub fn success(partition_index: i32, base_offset: i64) -> Self {
        Self {
            partition_index,
            error_code: KafkaCode::None,
            base_offset,
            log_append_time: -1,
            log_start_offset: 0,
        }
    }
}

impl ProduceResponse {
    /// Looks up the result for one partition.
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&ProducePartitionResponse> {
        self.responses
            .iter()
            .find(|t| t.name == topic)
            .and_then(|t| t.partitions.iter().find(|p| p.partition_index == partition))
    }
}

fn encode_produce_request<W: BufMut>(
    request: &ProduceRequest,
    buffer: &mut W,
    version: i16,
) -> Result<()> {
    if version >= 3 {
        request.transactional_id.as_deref().encode(buffer)?;
    }
    request.acks.encode(buffer)?;
    request.timeout_ms.encode(buffer)?;
    encode_as_array(buffer, &request.topics, |b, topic| {
        topic.name.encode(b)?;
        encode_as_array(b, &topic.partitions, |b, p| {
            p.partition_index.encode(b)?;
            p.records.as_ref().encode(b)
        })
    })
}

pub fn parse_produce_request(s: NomBytes, version: i16) -> IResult<NomBytes, ProduceRequest> {
    let (s, transactional_id) = if version >= 3 {
        parse_nullable_string(s)?
    } else {
        (s, None)
    };
    let (s, acks) = be_i16(s)?;
    let (s, timeout_ms) = be_i32(s)?;
    let (s, topics) = parse_array(parse_produce_topic)(s)?;

    Ok((
        s,
        ProduceRequest {
            transactional_id,
            acks,
            timeout_ms,
            topics,
        },
    ))
}

fn parse_produce_topic(s: NomBytes) -> IResult<NomBytes, ProduceTopicData> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_produce_partition)(s)?;
    Ok((s, ProduceTopicData { name, partitions }))
}

fn parse_produce_partition(s: NomBytes) -> IResult<NomBytes, ProducePartitionData> {
    let (s, partition_index) = be_i32(s)?;
    let (s, records) = parse_bytes(s)?;
    Ok((
        s,
        ProducePartitionData {
            partition_index,
            records,
        },
    ))
}

fn encode_produce_response<W: BufMut>(
    response: &ProduceResponse,
    buffer: &mut W,
    version: i16,
) -> Result<()> {
    encode_as_array(buffer, &response.responses, |b, topic| {
        topic.name.encode(b)?;
        encode_as_array(b, &topic.partitions, |b, p| {
            p.partition_index.encode(b)?;
            (p.error_code as i16).encode(b)?;
            p.base_offset.encode(b)?;
            if version >= 2 {
                p.log_append_time.encode(b)?;
            }
            if version >= 5 {
                p.log_start_offset.encode(b)?;
            }
            Ok(())
        })
    })?;
    if version >= 1 {
        response.throttle_time_ms.encode(buffer)?;
    }
    Ok(())
}

fn parse_produce_partition_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ProducePartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, base_offset) = be_i64(s)?;
    let (s, log_append_time) = if version >= 2 { be_i64(s)? } else { (s, -1) };
    let (s, log_start_offset) = if version >= 5 { be_i64(s)? } else { (s, -1) };
    Ok((
        s,
        ProducePartitionResponse {
            partition_index,
            error_code: KafkaCode::from_wire(error_code),
            base_offset,
            log_append_time,
            log_start_offset,
        },
    ))
}

fn parse_produce_topic_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ProduceTopicResponse> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) = parse_array(move |s| parse_produce_partition_response(s, version))(s)?;
    Ok((s, ProduceTopicResponse { name, partitions }))
}

pub fn parse_produce_response(s: NomBytes, version: i16) -> IResult<NomBytes, ProduceResponse> {
    let (s, responses) = parse_array(move |s| parse_produce_topic_response(s, version))(s)?;
    let (s, throttle_time_ms) = if version >= 1 { be_i32(s)? } else { (s, 0) };
    Ok((
        s,
        ProduceResponse {
            responses,
            throttle_time_ms,
        },
    ))
}

/// Codec for the Produce API.
///
/// - v0-v1 carry magic 0 message sets, v2 magic 1, v3+ record batches
/// - v3+ carries the transactional id
/// - v2+ responses carry the log append time, v5+ the log start offset
pub struct ProduceCodec;

impl KafkaCodec for ProduceCodec {
    type Request = ProduceRequest;
    type Response = ProduceResponse;

    fn api_key() -> ApiKey {
        ApiKey::Produce
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        7
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let size: usize = request
            .topics
            .iter()
            .flat_map(|t| t.partitions.iter().map(|p| p.records.len() + 8))
            .sum();
        let mut buffer = BytesMut::with_capacity(64 + size);
        encode_produce_request(request, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "produce request", |s| parse_produce_request(s, version))
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(128);
        encode_produce_response(response, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "produce response", |s| parse_produce_response(s, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ProduceRequest {
        ProduceRequest {
            transactional_id: Some("txn-1".to_string()),
            acks: -1,
            timeout_ms: 30_000,
            topics: vec![ProduceTopicData {
                name: "events".to_string(),
                partitions: vec![
                    ProducePartitionData {
                        partition_index: 0,
                        records: Bytes::from_static(b"batch-0"),
                    },
                    ProducePartitionData {
                        partition_index: 3,
                        records: Bytes::from_static(b"batch-3"),
                    },
                ],
            }],
        }
    }

    fn sample_response() -> ProduceResponse {
        ProduceResponse {
            responses: vec![ProduceTopicResponse {
                name: "events".to_string(),
                partitions: vec![
                    ProducePartitionResponse {
                        partition_index: 0,
                        error_code: KafkaCode::None,
                        base_offset: 42,
                        log_append_time: 1_000,
                        log_start_offset: 5,
                    },
                    ProducePartitionResponse::error(1, KafkaCode::NotLeaderForPartition),
                ],
            }],
            throttle_time_ms: 7,
        }
    }

    #[test]
    fn test_produce_codec_version_range() {
        assert_eq!(ProduceCodec::api_key(), ApiKey::Produce);
        assert!(ProduceCodec::is_version_supported(0));
        assert!(ProduceCodec::is_version_supported(7));
        assert!(!ProduceCodec::is_version_supported(8));
    }

    #[test]
    fn test_request_round_trip_per_version() {
        for v in 0..=7 {
            let bytes = ProduceCodec::encode_request(&sample_request(), v).unwrap();
            let decoded = ProduceCodec::decode_request(NomBytes::new(bytes), v).unwrap();
            let mut expected = sample_request();
            if v < 3 {
                expected.transactional_id = None;
            }
            assert_eq!(decoded, expected, "version {}", v);
        }
    }

    #[test]
    fn test_response_round_trip_per_version() {
        for v in 0..=7 {
            let bytes = ProduceCodec::encode_response(&sample_response(), v).unwrap();
            let decoded = ProduceCodec::decode_response(NomBytes::new(bytes), v).unwrap();
            let mut expected = sample_response();
            for p in &mut expected.responses[0].partitions {
                if v < 2 {
                    p.log_append_time = -1;
                }
                if v < 5 {
                    p.log_start_offset = -1;
                }
            }
            if v < 1 {
                expected.throttle_time_ms = 0;
            }
            assert_eq!(decoded, expected, "version {}", v);
        }
    }

    #[test]
    fn test_partition_lookup() {
        let response = sample_response();
        assert_eq!(response.partition("events", 0).unwrap().base_offset, 42);
        assert!(response.partition("events", 9).is_none());
        assert!(response.partition("other", 0).is_none());
    }

    #[test]
    fn test_v3_request_layout() {
        let mut request = sample_request();
        request.transactional_id = None;
        request.topics.clear();
        let bytes = ProduceCodec::encode_request(&request, 3).unwrap();
        // null transactional id, acks, timeout, empty topic array
        assert_eq!(
            bytes.as_ref(),
            &[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0x75, 0x30, 0, 0, 0, 0]
        );
    }
}
