//! Codecs for the producer-identity and transaction APIs:
//! InitProducerId, AddPartitionsToTxn and EndTxn.
//!
//! v1 of each is identical on the wire to v0; it only changes how the broker
//! reports throttling.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, KafkaCodec, check_version, run_parser};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bool, parse_nullable_string, parse_string};
use crate::types::{ProducerEpoch, ProducerId};

// ============================================================================
// InitProducerId
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProducerIdRequest {
    /// `None` for a purely idempotent producer.
    pub transactional_id: Option<String>,
    pub transaction_timeout_ms: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitProducerIdResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
}

pub fn parse_init_producer_id_request(
    s: NomBytes,
    _version: i16,
) -> IResult<NomBytes, InitProducerIdRequest> {
    let (s, transactional_id) = parse_nullable_string(s)?;
    let (s, transaction_timeout_ms) = be_i32(s)?;
    Ok((
        s,
        InitProducerIdRequest {
            transactional_id,
            transaction_timeout_ms,
        },
    ))
}

pub fn parse_init_producer_id_response(
    s: NomBytes,
    _version: i16,
) -> IResult<NomBytes, InitProducerIdResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, producer_id) = be_i64(s)?;
    let (s, producer_epoch) = be_i16(s)?;
    Ok((
        s,
        InitProducerIdResponse {
            throttle_time_ms,
            error_code: KafkaCode::from_wire(error_code),
            producer_id: ProducerId(producer_id),
            producer_epoch: ProducerEpoch(producer_epoch),
        },
    ))
}

pub struct InitProducerIdCodec;

impl KafkaCodec for InitProducerIdCodec {
    type Request = InitProducerIdRequest;
    type Response = InitProducerIdResponse;

    fn api_key() -> ApiKey {
        ApiKey::InitProducerId
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        1
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(32);
        request.transactional_id.as_deref().encode(&mut buffer)?;
        request.transaction_timeout_ms.encode(&mut buffer)?;
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "init producer id request", |s| {
            parse_init_producer_id_request(s, version)
        })
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(16);
        response.throttle_time_ms.encode(&mut buffer)?;
        (response.error_code as i16).encode(&mut buffer)?;
        response.producer_id.encode(&mut buffer)?;
        response.producer_epoch.encode(&mut buffer)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "init producer id response", |s| {
            parse_init_producer_id_response(s, version)
        })
    }
}

// ============================================================================
// AddPartitionsToTxn
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPartitionsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
    pub topics: Vec<AddPartitionsToTxnTopic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPartitionsToTxnTopic {
    pub name: String,
    pub partitions: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddPartitionsToTxnResponse {
    pub throttle_time_ms: i32,
    pub results: Vec<AddPartitionsToTxnTopicResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddPartitionsToTxnTopicResult {
    pub name: String,
    /// `(partition, error)` pairs.
    pub partitions: Vec<(i32, KafkaCode)>,
}

impl AddPartitionsToTxnResponse {
    /// Every `(topic, partition, error)` triple in the response.
    pub fn errors(&self) -> impl Iterator<Item = (&str, i32, KafkaCode)> + '_ {
        self.results.iter().flat_map(|t| {
            t.partitions
                .iter()
                .map(move |(p, code)| (t.name.as_str(), *p, *code))
        })
    }
}

fn parse_add_partitions_topic(s: NomBytes) -> IResult<NomBytes, AddPartitionsToTxnTopic> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) = parse_array(be_i32)(s)?;
    Ok((s, AddPartitionsToTxnTopic { name, partitions }))
}

pub fn parse_add_partitions_to_txn_request(
    s: NomBytes,
    _version: i16,
) -> IResult<NomBytes, AddPartitionsToTxnRequest> {
    let (s, transactional_id) = parse_string(s)?;
    let (s, producer_id) = be_i64(s)?;
    let (s, producer_epoch) = be_i16(s)?;
    let (s, topics) = parse_array(parse_add_partitions_topic)(s)?;
    Ok((
        s,
        AddPartitionsToTxnRequest {
            transactional_id,
            producer_id: ProducerId(producer_id),
            producer_epoch: ProducerEpoch(producer_epoch),
            topics,
        },
    ))
}

fn parse_partition_result(s: NomBytes) -> IResult<NomBytes, (i32, KafkaCode)> {
    let (s, partition) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    Ok((s, (partition, KafkaCode::from_wire(error_code))))
}

fn parse_add_partitions_result(s: NomBytes) -> IResult<NomBytes, AddPartitionsToTxnTopicResult> {
    let (s, name) = parse_string(s)?;
    let (s, partitions) = parse_array(parse_partition_result)(s)?;
    Ok((s, AddPartitionsToTxnTopicResult { name, partitions }))
}

pub fn parse_add_partitions_to_txn_response(
    s: NomBytes,
    _version: i16,
) -> IResult<NomBytes, AddPartitionsToTxnResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, results) = parse_array(parse_add_partitions_result)(s)?;
    Ok((
        s,
        AddPartitionsToTxnResponse {
            throttle_time_ms,
            results,
        },
    ))
}

fn encode_add_partitions_response<W: BufMut>(
    response: &AddPartitionsToTxnResponse,
    buffer: &mut W,
) -> Result<()> {
    response.throttle_time_ms.encode(buffer)?;
    encode_as_array(buffer, &response.results, |b, topic| {
        topic.name.encode(b)?;
        encode_as_array(b, &topic.partitions, |b, (partition, code)| {
            partition.encode(b)?;
            (*code as i16).encode(b)
        })
    })
}

pub struct AddPartitionsToTxnCodec;

impl KafkaCodec for AddPartitionsToTxnCodec {
    type Request = AddPartitionsToTxnRequest;
    type Response = AddPartitionsToTxnResponse;

    fn api_key() -> ApiKey {
        ApiKey::AddPartitionsToTxn
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        1
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(64);
        request.transactional_id.encode(&mut buffer)?;
        request.producer_id.encode(&mut buffer)?;
        request.producer_epoch.encode(&mut buffer)?;
        encode_as_array(&mut buffer, &request.topics, |b, topic| {
            topic.name.encode(b)?;
            topic.partitions.encode(b)
        })?;
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "add partitions to txn request", |s| {
            parse_add_partitions_to_txn_request(s, version)
        })
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(64);
        encode_add_partitions_response(response, &mut buffer)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "add partitions to txn response", |s| {
            parse_add_partitions_to_txn_response(s, version)
        })
    }
}

// ============================================================================
// EndTxn
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndTxnRequest {
    pub transactional_id: String,
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
    pub committed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndTxnResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
}

pub fn parse_end_txn_request(s: NomBytes, _version: i16) -> IResult<NomBytes, EndTxnRequest> {
    let (s, transactional_id) = parse_string(s)?;
    let (s, producer_id) = be_i64(s)?;
    let (s, producer_epoch) = be_i16(s)?;
    let (s, committed) = parse_bool(s)?;
    Ok((
        s,
        EndTxnRequest {
            transactional_id,
            producer_id: ProducerId(producer_id),
            producer_epoch: ProducerEpoch(producer_epoch),
            committed,
        },
    ))
}

pub fn parse_end_txn_response(s: NomBytes, _version: i16) -> IResult<NomBytes, EndTxnResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    Ok((
        s,
        EndTxnResponse {
            throttle_time_ms,
            error_code: KafkaCode::from_wire(error_code),
        },
    ))
}

pub struct EndTxnCodec;

impl KafkaCodec for EndTxnCodec {
    type Request = EndTxnRequest;
    type Response = EndTxnResponse;

    fn api_key() -> ApiKey {
        ApiKey::EndTxn
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        1
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(32);
        request.transactional_id.encode(&mut buffer)?;
        request.producer_id.encode(&mut buffer)?;
        request.producer_epoch.encode(&mut buffer)?;
        request.committed.encode(&mut buffer)?;
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "end txn request", |s| parse_end_txn_request(s, version))
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(8);
        response.throttle_time_ms.encode(&mut buffer)?;
        (response.error_code as i16).encode(&mut buffer)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "end txn response", |s| parse_end_txn_response(s, version))
    }
}
