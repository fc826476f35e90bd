//! Fetch API codec.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i8, be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, KafkaCodec, check_version, run_parser};
use crate::constants::CONSUMER_REPLICA_ID;
use crate::encode::{ToByte, encode_as_array, encode_nullable_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bytes, parse_nullable_array, parse_string};
use crate::types::IsolationLevel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: IsolationLevel,
    pub session_id: i32,
    pub session_epoch: i32,
    pub topics: Vec<FetchTopic>,
    pub forgotten_topics: Vec<ForgottenTopic>,
}

impl Default for FetchRequest {
    fn default() -> Self {
        FetchRequest {
            replica_id: CONSUMER_REPLICA_ID,
            max_wait_ms: 0,
            min_bytes: 1,
            max_bytes: i32::MAX,
            isolation_level: IsolationLevel::ReadUncommitted,
            session_id: 0,
            // -1 is the sessionless "full fetch" epoch
            session_epoch: -1,
            topics: vec![],
            forgotten_topics: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopic {
    pub name: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartition {
    pub partition: i32,
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgottenTopic {
    pub name: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub session_id: i32,
    pub responses: Vec<FetchTopicResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTopicResponse {
    pub topic: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    /// `None` when the version predates transactions or the list is null.
    pub aborted_transactions: Option<Vec<AbortedTransaction>>,
    pub records: Bytes,
}

impl FetchPartitionResponse {
    pub fn error(partition_index: i32, error_code: KafkaCode) -> Self {
        FetchPartitionResponse {
            partition_index,
            error_code,
            high_watermark: -1,
            last_stable_offset: -1,
            log_start_offset: -1,
            aborted_transactions: None,
            records: Bytes::new(),
        }
    }
}

impl FetchResponse {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&FetchPartitionResponse> {
        self.responses
            .iter()
            .find(|t| t.topic == topic)
            .and_then(|t| t.partitions.iter().find(|p| p.partition_index == partition))
    }
}

fn encode_fetch_request<W: BufMut>(request: &FetchRequest, buffer: &mut W, version: i16) -> Result<()> {
    request.replica_id.encode(buffer)?;
    request.max_wait_ms.encode(buffer)?;
    request.min_bytes.encode(buffer)?;
    if version >= 3 {
        request.max_bytes.encode(buffer)?;
    }
    if version >= 4 {
        request.isolation_level.as_i8().encode(buffer)?;
    }
    if version >= 7 {
        request.session_id.encode(buffer)?;
        request.session_epoch.encode(buffer)?;
    }
    encode_as_array(buffer, &request.topics, |b, topic| {
        topic.name.encode(b)?;
        encode_as_array(b, &topic.partitions, |b, p| {
            p.partition.encode(b)?;
            if version >= 9 {
                p.current_leader_epoch.encode(b)?;
            }
            p.fetch_offset.encode(b)?;
            if version >= 5 {
                p.log_start_offset.encode(b)?;
            }
            p.partition_max_bytes.encode(b)
        })
    })?;
    if version >= 7 {
        encode_as_array(buffer, &request.forgotten_topics, |b, t| {
            t.name.encode(b)?;
            t.partitions.encode(b)
        })?;
    }
    Ok(())
}

fn parse_fetch_partition(s: NomBytes, version: i16) -> IResult<NomBytes, FetchPartition> {
    let (s, partition) = be_i32(s)?;
    let (s, current_leader_epoch) = if version >= 9 { be_i32(s)? } else { (s, -1) };
    let (s, fetch_offset) = be_i64(s)?;
    let (s, log_start_offset) = if version >= 5 { be_i64(s)? } else { (s, -1) };
    let (s, partition_max_bytes) = be_i32(s)?;
    Ok((
        s,
        FetchPartition {
            partition,
            current_leader_epoch,
            fetch_offset,
            log_start_offset,
            partition_max_bytes,
        },
    ))
}

fn parse_fetch_topic(s: NomBytes, version: i16) -> IResult<NomBytes, FetchTopic> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) = parse_array(move |s| parse_fetch_partition(s, version))(s)?;
    Ok((s, FetchTopic { name, partitions }))
}

fn parse_forgotten_topic(s: NomBytes) -> IResult<NomBytes, ForgottenTopic> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) = parse_array(be_i32)(s)?;
    Ok((s, ForgottenTopic { name, partitions }))
}

pub fn parse_fetch_request(s: NomBytes, version: i16) -> IResult<NomBytes, FetchRequest> {
    let (s, replica_id) = be_i32(s)?;
    let (s, max_wait_ms) = be_i32(s)?;
    let (s, min_bytes) = be_i32(s)?;
    let (s, max_bytes) = if version >= 3 { be_i32(s)? } else { (s, i32::MAX) };
    let (s, isolation_level) = if version >= 4 { be_i8(s)? } else { (s, 0) };
    let (s, session_id) = if version >= 7 { be_i32(s)? } else { (s, 0) };
    let (s, session_epoch) = if version >= 7 { be_i32(s)? } else { (s, -1) };
    let (s, topics) = parse_array(move |s| parse_fetch_topic(s, version))(s)?;
    let (s, forgotten_topics) = if version >= 7 {
        parse_array(parse_forgotten_topic)(s)?
    } else {
        (s, vec![])
    };
    Ok((
        s,
        FetchRequest {
            replica_id,
            max_wait_ms,
            min_bytes,
            max_bytes,
            isolation_level: IsolationLevel::from_i8(isolation_level),
            session_id,
            session_epoch,
            topics,
            forgotten_topics,
        },
    ))
}

fn encode_fetch_response<W: BufMut>(
    response: &FetchResponse,
    buffer: &mut W,
    version: i16,
) -> Result<()> {
    if version >= 1 {
        response.throttle_time_ms.encode(buffer)?;
    }
    if version >= 7 {
        (response.error_code as i16).encode(buffer)?;
        response.session_id.encode(buffer)?;
    }
    encode_as_array(buffer, &response.responses, |b, topic| {
        topic.topic.encode(b)?;
        encode_as_array(b, &topic.partitions, |b, p| {
            p.partition_index.encode(b)?;
            (p.error_code as i16).encode(b)?;
            p.high_watermark.encode(b)?;
            if version >= 4 {
                p.last_stable_offset.encode(b)?;
            }
            if version >= 5 {
                p.log_start_offset.encode(b)?;
            }
            if version >= 4 {
                encode_nullable_array(b, p.aborted_transactions.as_deref(), |b, t| {
                    t.producer_id.encode(b)?;
                    t.first_offset.encode(b)
                })?;
            }
            p.records.as_ref().encode(b)
        })
    })
}

fn parse_aborted_transaction(s: NomBytes) -> IResult<NomBytes, AbortedTransaction> {
    let (s, producer_id) = be_i64(s)?;
    let (s, first_offset) = be_i64(s)?;
    Ok((
        s,
        AbortedTransaction {
            producer_id,
            first_offset,
        },
    ))
}

fn parse_fetch_partition_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, FetchPartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, high_watermark) = be_i64(s)?;
    let (s, last_stable_offset) = if version >= 4 { be_i64(s)? } else { (s, -1) };
    let (s, log_start_offset) = if version >= 5 { be_i64(s)? } else { (s, -1) };
    let (s, aborted_transactions) = if version >= 4 {
        parse_nullable_array(parse_aborted_transaction)(s)?
    } else {
        (s, None)
    };
    let (s, records) = parse_bytes(s)?;
    Ok((
        s,
        FetchPartitionResponse {
            partition_index,
            error_code: KafkaCode::from_wire(error_code),
            high_watermark,
            last_stable_offset,
            log_start_offset,
            aborted_transactions,
            records,
        },
    ))
}

fn parse_fetch_topic_response(s: NomBytes, version: i16) -> IResult<NomBytes, FetchTopicResponse> {
    let (s, topic) = parse_string(s)?;
    let (s, partitions) = parse_array(move |s| parse_fetch_partition_response(s, version))(s)?;
    Ok((s, FetchTopicResponse { topic, partitions }))
}

pub fn parse_fetch_response(s: NomBytes, version: i16) -> IResult<NomBytes, FetchResponse> {
    let (s, throttle_time_ms) = if version >= 1 { be_i32(s)? } else { (s, 0) };
    let (s, error_code, session_id) = if version >= 7 {
        let (s, error_code) = be_i16(s)?;
        let (s, session_id) = be_i32(s)?;
        (s, error_code, session_id)
    } else {
        (s, 0, 0)
    };
    let (s, responses) = parse_array(move |s| parse_fetch_topic_response(s, version))(s)?;
    Ok((
        s,
        FetchResponse {
            throttle_time_ms,
            error_code: KafkaCode::from_wire(error_code),
            session_id,
            responses,
        },
    ))
}

/// Codec for the Fetch API.
///
/// # Supported Versions
///
/// - v1 adds the throttle time, v3 the response size limit
/// - v4 adds isolation, the last stable offset and aborted transactions
/// - v5 adds log start offsets
/// - v7 adds fetch sessions, v9 the current leader epoch
pub struct FetchCodec;

impl KafkaCodec for FetchCodec {
    type Request = FetchRequest;
    type Response = FetchResponse;

    fn api_key() -> ApiKey {
        ApiKey::Fetch
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        10
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(128);
        encode_fetch_request(request, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "fetch request", |s| parse_fetch_request(s, version))
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let size: usize = response
            .responses
            .iter()
            .flat_map(|t| t.partitions.iter().map(|p| p.records.len() + 64))
            .sum();
        let mut buffer = BytesMut::with_capacity(32 + size);
        encode_fetch_response(response, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "fetch response", |s| parse_fetch_response(s, version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> FetchRequest {
        FetchRequest {
            max_wait_ms: 250,
            min_bytes: 1,
            max_bytes: 1 << 20,
            isolation_level: IsolationLevel::ReadCommitted,
            session_id: 3,
            session_epoch: 4,
            topics: vec![FetchTopic {
                name: "events".to_string(),
                partitions: vec![FetchPartition {
                    partition: 2,
                    current_leader_epoch: 8,
                    fetch_offset: 100,
                    log_start_offset: 10,
                    partition_max_bytes: 32_768,
                }],
            }],
            forgotten_topics: vec![ForgottenTopic {
                name: "old".to_string(),
                partitions: vec![0, 1],
            }],
            ..FetchRequest::default()
        }
    }

    fn request_for_version(version: i16) -> FetchRequest {
        let mut expected = sample_request();
        if version < 3 {
            expected.max_bytes = i32::MAX;
        }
        if version < 4 {
            expected.isolation_level = IsolationLevel::ReadUncommitted;
        }
        if version < 7 {
            expected.session_id = 0;
            expected.session_epoch = -1;
            expected.forgotten_topics.clear();
        }
        for p in &mut expected.topics[0].partitions {
            if version < 9 {
                p.current_leader_epoch = -1;
            }
            if version < 5 {
                p.log_start_offset = -1;
            }
        }
        expected
    }

    fn sample_response() -> FetchResponse {
        FetchResponse {
            throttle_time_ms: 5,
            error_code: KafkaCode::None,
            session_id: 3,
            responses: vec![FetchTopicResponse {
                topic: "events".to_string(),
                partitions: vec![
                    FetchPartitionResponse {
                        partition_index: 2,
                        error_code: KafkaCode::None,
                        high_watermark: 120,
                        last_stable_offset: 110,
                        log_start_offset: 10,
                        aborted_transactions: Some(vec![AbortedTransaction {
                            producer_id: 9,
                            first_offset: 105,
                        }]),
                        records: Bytes::from_static(b"records"),
                    },
                    FetchPartitionResponse::error(3, KafkaCode::OffsetOutOfRange),
                ],
            }],
        }
    }

    fn response_for_version(version: i16) -> FetchResponse {
        let mut expected = sample_response();
        if version < 1 {
            expected.throttle_time_ms = 0;
        }
        if version < 7 {
            expected.session_id = 0;
        }
        for p in &mut expected.responses[0].partitions {
            if version < 4 {
                p.last_stable_offset = -1;
                p.aborted_transactions = None;
            }
            if version < 5 {
                p.log_start_offset = -1;
            }
        }
        expected
    }

    #[test]
    fn test_request_round_trip_per_version() {
        for v in 0..=10 {
            let bytes = FetchCodec::encode_request(&sample_request(), v).unwrap();
            let decoded = FetchCodec::decode_request(NomBytes::new(bytes), v).unwrap();
            assert_eq!(decoded, request_for_version(v), "version {}", v);
        }
    }

    #[test]
    fn test_response_round_trip_per_version() {
        for v in 0..=10 {
            let bytes = FetchCodec::encode_response(&sample_response(), v).unwrap();
            let decoded = FetchCodec::decode_response(NomBytes::new(bytes), v).unwrap();
            assert_eq!(decoded, response_for_version(v), "version {}", v);
        }
    }

    #[test]
    fn test_null_aborted_transactions() {
        let mut response = sample_response();
        response.responses[0].partitions[0].aborted_transactions = None;
        let bytes = FetchCodec::encode_response(&response, 4).unwrap();
        let decoded = FetchCodec::decode_response(NomBytes::new(bytes), 4).unwrap();
        assert_eq!(decoded.responses[0].partitions[0].aborted_transactions, None);
    }

    #[test]
    fn test_partition_lookup() {
        let response = sample_response();
        assert_eq!(response.partition("events", 2).unwrap().high_watermark, 120);
        assert_eq!(
            response.partition("events", 3).unwrap().error_code,
            KafkaCode::OffsetOutOfRange
        );
        assert!(response.partition("events", 4).is_none());
    }

    #[test]
    fn test_v0_request_layout() {
        let request = FetchRequest {
            max_wait_ms: 100,
            min_bytes: 1,
            ..FetchRequest::default()
        };
        let bytes = FetchCodec::encode_request(&request, 0).unwrap();
        assert_eq!(
            bytes.as_ref(),
            &[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 100, 0, 0, 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_unsupported_version() {
        assert!(FetchCodec::encode_request(&sample_request(), 11).is_err());
    }
}
