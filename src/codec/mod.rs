//! Kafka protocol codec layer.
//!
//! Every API the client speaks implements [`KafkaCodec`], which pairs a
//! request type with its response type and knows how to move both across the
//! wire in either direction. The client encodes requests and decodes
//! responses; the in-process mock broker does the reverse with the same code.
//!
//! Only the non-flexible encodings are implemented: request header v1 and
//! response header v0.
//!
//! # Supported APIs
//!
//! | API | Key | Versions | Codec |
//! |-----|-----|----------|-------|
//! | Produce | 0 | 0-7 | `ProduceCodec` |
//! | Fetch | 1 | 0-10 | `FetchCodec` |
//! | ListOffsets | 2 | 0-2 | `ListOffsetsCodec` |
//! | Metadata | 3 | 0-5 | `MetadataCodec` |
//! | FindCoordinator | 10 | 0-2 | `FindCoordinatorCodec` |
//! | ApiVersions | 18 | 0-2 | `ApiVersionsCodec` |
//! | InitProducerId | 22 | 0-1 | `InitProducerIdCodec` |
//! | AddPartitionsToTxn | 24 | 0-1 | `AddPartitionsToTxnCodec` |
//! | EndTxn | 26 | 0-1 | `EndTxnCodec` |
//!
//! # Example
//!
//! ```rust,ignore
//! use kafkaesque_client::codec::{KafkaCodec, MetadataCodec, MetadataRequest};
//!
//! let body = MetadataCodec::encode_request(&MetadataRequest::all_topics(), 5)?;
//! // ... send over a connection ...
//! let response = MetadataCodec::decode_response(NomBytes::new(payload), 5)?;
//! ```

mod coordinator;
mod fetch;
mod metadata;
mod offsets;
mod produce;
mod txn;
mod versions;

pub use coordinator::{FindCoordinatorCodec, FindCoordinatorRequest, FindCoordinatorResponse};
pub use fetch::{
    AbortedTransaction, FetchCodec, FetchPartition, FetchPartitionResponse, FetchRequest,
    FetchResponse, FetchTopic, FetchTopicResponse, ForgottenTopic,
};
pub use metadata::{
    MetadataBroker, MetadataCodec, MetadataRequest, MetadataResponse, PartitionMetadata,
    TopicMetadata,
};
pub use offsets::{
    ListOffsetsCodec, ListOffsetsPartition, ListOffsetsPartitionResponse, ListOffsetsRequest,
    ListOffsetsResponse, ListOffsetsTopic, ListOffsetsTopicResponse,
};
pub use produce::{
    ProduceCodec, ProducePartitionData, ProducePartitionResponse, ProduceRequest,
    ProduceResponse, ProduceTopicData, ProduceTopicResponse,
};
pub use txn::{
    AddPartitionsToTxnCodec, AddPartitionsToTxnRequest, AddPartitionsToTxnResponse,
    AddPartitionsToTxnTopic, AddPartitionsToTxnTopicResult, EndTxnCodec, EndTxnRequest,
    EndTxnResponse, InitProducerIdCodec, InitProducerIdRequest, InitProducerIdResponse,
};
pub use versions::{ApiVersionRange, ApiVersionsCodec, ApiVersionsRequest, ApiVersionsResponse};

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::encode::ToByte;
use crate::error::{Error, Result};
use crate::parser::{parse_error, parse_nullable_string};

/// API keys understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    FindCoordinator = 10,
    ApiVersions = 18,
    InitProducerId = 22,
    AddPartitionsToTxn = 24,
    EndTxn = 26,
}

impl ApiKey {
    pub const ALL: [ApiKey; 9] = [
        ApiKey::Produce,
        ApiKey::Fetch,
        ApiKey::ListOffsets,
        ApiKey::Metadata,
        ApiKey::FindCoordinator,
        ApiKey::ApiVersions,
        ApiKey::InitProducerId,
        ApiKey::AddPartitionsToTxn,
        ApiKey::EndTxn,
    ];

    pub fn from_i16(key: i16) -> Option<ApiKey> {
        ApiKey::ALL.into_iter().find(|k| *k as i16 == key)
    }

    /// Version range implemented by the codec for this key.
    pub fn version_range(self) -> (i16, i16) {
        match self {
            ApiKey::Produce => (ProduceCodec::min_version(), ProduceCodec::max_version()),
            ApiKey::Fetch => (FetchCodec::min_version(), FetchCodec::max_version()),
            ApiKey::ListOffsets => (ListOffsetsCodec::min_version(), ListOffsetsCodec::max_version()),
            ApiKey::Metadata => (MetadataCodec::min_version(), MetadataCodec::max_version()),
            ApiKey::FindCoordinator => (
                FindCoordinatorCodec::min_version(),
                FindCoordinatorCodec::max_version(),
            ),
            ApiKey::ApiVersions => (ApiVersionsCodec::min_version(), ApiVersionsCodec::max_version()),
            ApiKey::InitProducerId => (
                InitProducerIdCodec::min_version(),
                InitProducerIdCodec::max_version(),
            ),
            ApiKey::AddPartitionsToTxn => (
                AddPartitionsToTxnCodec::min_version(),
                AddPartitionsToTxnCodec::max_version(),
            ),
            ApiKey::EndTxn => (EndTxnCodec::min_version(), EndTxnCodec::max_version()),
        }
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Trait for Kafka protocol codecs.
///
/// The request and response types are plain data; all version-dependent
/// layout decisions live in the codec.
pub trait KafkaCodec {
    type Request;
    type Response;

    fn api_key() -> ApiKey;

    fn min_version() -> i16;

    fn max_version() -> i16;

    fn is_version_supported(version: i16) -> bool {
        version >= Self::min_version() && version <= Self::max_version()
    }

    /// Encodes a request body (without the request header).
    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes>;

    /// Decodes a request body (after the header has been stripped).
    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request>;

    /// Encodes a response body (without the correlation id).
    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes>;

    /// Decodes a response body (after the correlation id has been stripped).
    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response>;
}

/// Fails with `UnsupportedVersion` unless the codec implements `version`.
pub(crate) fn check_version<C: KafkaCodec>(version: i16) -> Result<()> {
    if C::is_version_supported(version) {
        Ok(())
    } else {
        Err(Error::UnsupportedVersion(format!(
            "{} v{} (supported {}-{})",
            C::api_key(),
            version,
            C::min_version(),
            C::max_version()
        )))
    }
}

/// Runs a top-level parser, mapping nom failures to `Error::Encoding`.
pub(crate) fn run_parser<T>(
    bytes: NomBytes,
    what: &str,
    parser: impl FnOnce(NomBytes) -> IResult<NomBytes, T>,
) -> Result<T> {
    let (_, value) = parser(bytes).map_err(parse_error(what))?;
    Ok(value)
}

/// Request header v1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl ToByte for RequestHeader {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.api_key.encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.as_deref().encode(buffer)?;
        Ok(())
    }
}

pub fn parse_request_header(s: NomBytes) -> IResult<NomBytes, RequestHeader> {
    let (s, api_key) = be_i16(s)?;
    let (s, api_version) = be_i16(s)?;
    let (s, correlation_id) = be_i32(s)?;
    let (s, client_id) = parse_nullable_string(s)?;
    Ok((
        s,
        RequestHeader {
            api_key,
            api_version,
            correlation_id,
            client_id,
        },
    ))
}

/// Size-prefixed request frame: header followed by the encoded body.
pub fn encode_request_frame(header: &RequestHeader, body: &[u8]) -> Result<Bytes> {
    let mut frame = BytesMut::with_capacity(4 + 10 + body.len());
    frame.put_i32(0);
    header.encode(&mut frame)?;
    frame.put_slice(body);
    let size = (frame.len() - 4) as i32;
    frame[0..4].copy_from_slice(&size.to_be_bytes());
    Ok(frame.freeze())
}

/// Size-prefixed response frame: correlation id followed by the body.
pub fn encode_response_frame(correlation_id: i32, body: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_i32((4 + body.len()) as i32);
    frame.put_i32(correlation_id);
    frame.put_slice(body);
    frame.freeze()
}

/// Splits the correlation id off a response payload (size prefix already removed).
pub fn split_response_header(mut payload: Bytes) -> Result<(i32, Bytes)> {
    if payload.len() < 4 {
        return Err(Error::Encoding(format!(
            "response of {} bytes has no header",
            payload.len()
        )));
    }
    let header = payload.split_to(4);
    let correlation_id = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    Ok((correlation_id, payload))
}
