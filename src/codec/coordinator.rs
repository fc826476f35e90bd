//! FindCoordinator API codec.

use bytes::{Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i8, be_i16, be_i32},
};
use nombytes::NomBytes;

use super::{ApiKey, KafkaCodec, check_version, run_parser};
use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_nullable_string, parse_string};
use crate::types::{BrokerId, CoordinatorType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindCoordinatorRequest {
    pub key: String,
    pub key_type: CoordinatorType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindCoordinatorResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub error_message: Option<String>,
    pub node_id: BrokerId,
    pub host: String,
    pub port: i32,
}

impl FindCoordinatorResponse {
    pub fn error(error_code: KafkaCode) -> Self {
        FindCoordinatorResponse {
            throttle_time_ms: 0,
            error_code,
            error_message: None,
            node_id: BrokerId::INVALID,
            host: String::new(),
            port: -1,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn parse_find_coordinator_request(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, FindCoordinatorRequest> {
    let (s, key) = parse_string(s)?;
    let (s, key_type) = if version >= 1 { be_i8(s)? } else { (s, 0) };
    Ok((
        s,
        FindCoordinatorRequest {
            key,
            key_type: CoordinatorType::from_i8(key_type),
        },
    ))
}

pub fn parse_find_coordinator_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, FindCoordinatorResponse> {
    let (s, throttle_time_ms) = if version >= 1 { be_i32(s)? } else { (s, 0) };
    let (s, error_code) = be_i16(s)?;
    let (s, error_message) = if version >= 1 {
        parse_nullable_string(s)?
    } else {
        (s, None)
    };
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parse_string(s)?;
    let (s, port) = be_i32(s)?;
    Ok((
        s,
        FindCoordinatorResponse {
            throttle_time_ms,
            error_code: KafkaCode::from_wire(error_code),
            error_message,
            node_id: BrokerId(node_id),
            host,
            port,
        },
    ))
}

/// Codec for the FindCoordinator API.
///
/// v0 only knows group coordinators; v1 adds the key type and an error
/// message; v2 is identical on the wire.
pub struct FindCoordinatorCodec;

impl KafkaCodec for FindCoordinatorCodec {
    type Request = FindCoordinatorRequest;
    type Response = FindCoordinatorResponse;

    fn api_key() -> ApiKey {
        ApiKey::FindCoordinator
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        2
    }

    fn encode_request(request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(32 + request.key.len());
        request.key.encode(&mut buffer)?;
        if version >= 1 {
            request.key_type.as_i8().encode(&mut buffer)?;
        }
        Ok(buffer.freeze())
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        run_parser(bytes, "find coordinator request", |s| {
            parse_find_coordinator_request(s, version)
        })
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(32 + response.host.len());
        if version >= 1 {
            response.throttle_time_ms.encode(&mut buffer)?;
        }
        (response.error_code as i16).encode(&mut buffer)?;
        if version >= 1 {
            response.error_message.as_deref().encode(&mut buffer)?;
        }
        response.node_id.encode(&mut buffer)?;
        response.host.encode(&mut buffer)?;
        response.port.encode(&mut buffer)?;
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "find coordinator response", |s| {
            parse_find_coordinator_response(s, version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip_per_version() {
        for v in 0..=2 {
            let request = FindCoordinatorRequest {
                key: "txn-1".to_string(),
                key_type: CoordinatorType::Transaction,
            };
            let bytes = FindCoordinatorCodec::encode_request(&request, v).unwrap();
            let decoded = FindCoordinatorCodec::decode_request(NomBytes::new(bytes), v).unwrap();
            let expected_type = if v == 0 {
                CoordinatorType::Group
            } else {
                CoordinatorType::Transaction
            };
            assert_eq!(decoded.key, "txn-1");
            assert_eq!(decoded.key_type, expected_type, "version {}", v);
        }
    }

    #[test]
    fn test_response_round_trip_per_version() {
        let response = FindCoordinatorResponse {
            throttle_time_ms: 4,
            error_code: KafkaCode::None,
            error_message: Some("ok".to_string()),
            node_id: BrokerId(2),
            host: "localhost".to_string(),
            port: 9094,
        };
        for v in 0..=2 {
            let bytes = FindCoordinatorCodec::encode_response(&response, v).unwrap();
            let decoded = FindCoordinatorCodec::decode_response(NomBytes::new(bytes), v).unwrap();
            let mut expected = response.clone();
            if v == 0 {
                expected.throttle_time_ms = 0;
                expected.error_message = None;
            }
            assert_eq!(decoded, expected, "version {}", v);
        }
        assert_eq!(response.address(), "localhost:9094");
    }

    #[test]
    fn test_error_response() {
        let response = FindCoordinatorResponse::error(KafkaCode::CoordinatorNotAvailable);
        let bytes = FindCoordinatorCodec::encode_response(&response, 1).unwrap();
        let decoded = FindCoordinatorCodec::decode_response(NomBytes::new(bytes), 1).unwrap();
        assert_eq!(decoded.error_code, KafkaCode::CoordinatorNotAvailable);
        assert_eq!(decoded.node_id, BrokerId::INVALID);
    }
}
