//! Metadata API codec.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use super::{ApiKey, KafkaCodec, check_version, run_parser};
use crate::encode::{ToByte, encode_as_array, encode_nullable_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bool, parse_nullable_array, parse_nullable_string, parse_string};
use crate::types::BrokerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    /// `None` asks for every topic in the cluster.
    pub topics: Option<Vec<String>>,
    pub allow_auto_topic_creation: bool,
}

impl MetadataRequest {
    pub fn all_topics() -> Self {
        MetadataRequest {
            topics: None,
            allow_auto_topic_creation: false,
        }
    }

    pub fn for_topics(topics: Vec<String>) -> Self {
        MetadataRequest {
            topics: Some(topics),
            allow_auto_topic_creation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBroker {
    pub node_id: BrokerId,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

impl MetadataBroker {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub error_code: KafkaCode,
    pub partition_index: i32,
    pub leader_id: BrokerId,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    pub offline_replicas: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub error_code: KafkaCode,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResponse {
    pub throttle_time_ms: i32,
    pub brokers: Vec<MetadataBroker>,
    pub cluster_id: Option<String>,
    pub controller_id: BrokerId,
    pub topics: Vec<TopicMetadata>,
}

impl Default for MetadataResponse {
    fn default() -> Self {
        MetadataResponse {
            throttle_time_ms: 0,
            brokers: vec![],
            cluster_id: None,
            controller_id: BrokerId::INVALID,
            topics: vec![],
        }
    }
}

fn encode_metadata_request<W: BufMut>(
    request: &MetadataRequest,
    buffer: &mut W,
    version: i16,
) -> Result<()> {
    match (&request.topics, version) {
        // v0 has no null array: an empty list means every topic
        (None, 0) => encode_as_array(buffer, &[] as &[String], |b, t| t.encode(b))?,
        (topics, _) => encode_nullable_array(buffer, topics.as_deref(), |b, t| t.encode(b))?,
    }
    if version >= 4 {
        request.allow_auto_topic_creation.encode(buffer)?;
    }
    Ok(())
}

pub fn parse_metadata_request(s: NomBytes, version: i16) -> IResult<NomBytes, MetadataRequest> {
    let (s, topics) = parse_nullable_array(parse_string)(s)?;
    let topics = match topics {
        Some(t) if t.is_empty() && version == 0 => None,
        other => other,
    };
    let (s, allow_auto_topic_creation) = if version >= 4 {
        parse_bool(s)?
    } else {
        (s, true)
    };
    Ok((
        s,
        MetadataRequest {
            topics,
            allow_auto_topic_creation,
        },
    ))
}

fn encode_metadata_response<W: BufMut>(
    response: &MetadataResponse,
    buffer: &mut W,
    version: i16,
) -> Result<()> {
    if version >= 3 {
        response.throttle_time_ms.encode(buffer)?;
    }
    encode_as_array(buffer, &response.brokers, |b, broker| {
        broker.node_id.encode(b)?;
        broker.host.encode(b)?;
        broker.port.encode(b)?;
        if version >= 1 {
            broker.rack.as_deref().encode(b)?;
        }
        Ok(())
    })?;
    if version >= 2 {
        response.cluster_id.as_deref().encode(buffer)?;
    }
    if version >= 1 {
        response.controller_id.encode(buffer)?;
    }
    encode_as_array(buffer, &response.topics, |b, topic| {
        (topic.error_code as i16).encode(b)?;
        topic.name.encode(b)?;
        if version >= 1 {
            topic.is_internal.encode(b)?;
        }
        encode_as_array(b, &topic.partitions, |b, p| {
            (p.error_code as i16).encode(b)?;
            p.partition_index.encode(b)?;
            p.leader_id.encode(b)?;
            p.replica_nodes.encode(b)?;
            p.isr_nodes.encode(b)?;
            if version >= 5 {
                p.offline_replicas.encode(b)?;
            }
            Ok(())
        })
    })
}

fn parse_metadata_broker(s: NomBytes, version: i16) -> IResult<NomBytes, MetadataBroker> {
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parse_string(s)?;
    let (s, port) = be_i32(s)?;
    let (s, rack) = if version >= 1 {
        parse_nullable_string(s)?
    } else {
        (s, None)
    };
    Ok((
        s,
        MetadataBroker {
            node_id: BrokerId(node_id),
            host,
            port,
            rack,
        },
    ))
}

fn parse_partition_metadata(s: NomBytes, version: i16) -> IResult<NomBytes, PartitionMetadata> {
    let (s, error_code) = be_i16(s)?;
    let (s, partition_index) = be_i32(s)?;
    let (s, leader_id) = be_i32(s)?;
    let (s, replica_nodes) = parse_array(be_i32)(s)?;
    let (s, isr_nodes) = parse_array(be_i32)(s)?;
    let (s, offline_replicas) = if version >= 5 {
        parse_array(be_i32)(s)?
    } else {
        (s, vec![])
    };
    Ok((
        s,
        PartitionMetadata {
            error_code: KafkaCode::from_wire(error_code),
            partition_index,
            leader_id: BrokerId(leader_id),
            replica_nodes,
            isr_nodes,
            offline_replicas,
        },
    ))
}

fn parse_topic_metadata(s: NomBytes, version: i16) -> IResult<NomBytes, TopicMetadata> {
    let (s, error_code) = be_i16(s)?;
    let (s, name) = parse_string(s)?;
    let (s, is_internal) = if version >= 1 {
        parse_bool(s)?
    } else {
        (s, false)
    };
    let (s, partitions) = parse_array(move |s| parse_partition_metadata(s, version))(s)?;
    Ok((
        s,
        TopicMetadata {
            error_code: KafkaCode::from_wire(error_code),
            name,
            is_internal,
            partitions,
        },
    ))
}

pub fn parse_metadata_response(s: NomBytes, version: i16) -> IResult<NomBytes, MetadataResponse> {
    let (s, throttle_time_ms) = if version >= 3 { be_i32(s)? } else { (s, 0) };
    let (s, brokers) = parse_array(move |s| parse_metadata_broker(s, version))(s)?;
    let (s, cluster_id) = if version >= 2 {
        parse_nullable_string(s)?
    } else {
        (s, None)
    };
    let (s, controller_id) = if version >= 1 { be_i32(s)? } else { (s, -1) };
    let (s, topics) = parse_array(move |s| parse_topic_metadata(s, version))(s)?;
    Ok((
        s,
        MetadataResponse {
            throttle_time_ms,
            brokers,
            cluster_id,
            controller_id: BrokerId(controller_id),
            topics,
        },
    ))
}

/// Codec for the Metadata API.
///
/// - v1 adds racks, the controller id and the internal flag
/// - v2 adds the cluster id
/// - v3 adds the throttle time
/// - v4 adds `allow_auto_topic_creation`
/// - v5 adds offline replicas
pub struct MetadataCodec;

impl KafkaCodec for MetadataCodec {
    type Request = MetadataRequest;
    type Response = MetadataResponse;

    fn api_key() -> ApiKey {
        ApiKey::Metadata
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        5
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(64);
        encode_metadata_request(request, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "metadata request", |s| parse_metadata_request(s, version))
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(256);
        encode_metadata_response(response, &mut buffer, version)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "metadata response", |s| parse_metadata_response(s, version))
    }
}
