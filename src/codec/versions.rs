//! ApiVersions API codec.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use super::{ApiKey, KafkaCodec, check_version, run_parser};
use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::parse_array;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiVersionsRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersionRange {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiVersionsResponse {
    pub error_code: KafkaCode,
    pub api_versions: Vec<ApiVersionRange>,
    pub throttle_time_ms: i32,
}

impl ApiVersionsResponse {
    /// Advertised range for `key`, if the broker knows it.
    pub fn range_for(&self, key: ApiKey) -> Option<ApiVersionRange> {
        self.api_versions
            .iter()
            .copied()
            .find(|r| r.api_key == key as i16)
    }
}

impl ToByte for ApiVersionRange {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.api_key.encode(buffer)?;
        self.min_version.encode(buffer)?;
        self.max_version.encode(buffer)?;
        Ok(())
    }
}

fn parse_api_version_range(s: NomBytes) -> IResult<NomBytes, ApiVersionRange> {
    let (s, api_key) = be_i16(s)?;
    let (s, min_version) = be_i16(s)?;
    let (s, max_version) = be_i16(s)?;
    Ok((
        s,
        ApiVersionRange {
            api_key,
            min_version,
            max_version,
        },
    ))
}

pub fn parse_api_versions_response(
    s: NomBytes,
    version: i16,
) -> IResult<NomBytes, ApiVersionsResponse> {
    let (s, error_code) = be_i16(s)?;
    let (s, api_versions) = parse_array(parse_api_version_range)(s)?;
    let (s, throttle_time_ms) = if version >= 1 { be_i32(s)? } else { (s, 0) };
    Ok((
        s,
        ApiVersionsResponse {
            error_code: KafkaCode::from_wire(error_code),
            api_versions,
            throttle_time_ms,
        },
    ))
}

/// Codec for the ApiVersions API.
///
/// The request body is empty for every non-flexible version; v1 adds the
/// throttle time to the response.
pub struct ApiVersionsCodec;

impl KafkaCodec for ApiVersionsCodec {
    type Request = ApiVersionsRequest;
    type Response = ApiVersionsResponse;

    fn api_key() -> ApiKey {
        ApiKey::ApiVersions
    }

    fn min_version() -> i16 {
        0
    }

    fn max_version() -> i16 {
        2
    }

    fn encode_request(_request: &Self::Request, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        Ok(Bytes::new())
    }

    fn decode_request(_bytes: NomBytes, version: i16) -> Result<Self::Request> {
        check_version::<Self>(version)?;
        Ok(ApiVersionsRequest)
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        check_version::<Self>(version)?;
        let mut buffer = BytesMut::with_capacity(8 + response.api_versions.len() * 6);
        (response.error_code as i16).encode(&mut buffer)?;
        encode_array(&mut buffer, &response.api_versions)?;
        if version >= 1 {
            response.throttle_time_ms.encode(&mut buffer)?;
        }
        Ok(buffer.freeze())
    }

    fn decode_response(bytes: NomBytes, version: i16) -> Result<Self::Response> {
        check_version::<Self>(version)?;
        run_parser(bytes, "api versions response", |s| {
            parse_api_versions_response(s, version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ApiVersionsResponse {
        ApiVersionsResponse {
            error_code: KafkaCode::None,
            api_versions: vec![
                ApiVersionRange {
                    api_key: 0,
                    min_version: 0,
                    max_version: 7,
                },
                ApiVersionRange {
                    api_key: 1,
                    min_version: 0,
                    max_version: 10,
                },
            ],
            throttle_time_ms: 25,
        }
    }

    #[test]
    fn test_request_body_is_empty() {
        for v in 0..=2 {
            assert!(ApiVersionsCodec::encode_request(&ApiVersionsRequest, v)
                .unwrap()
                .is_empty());
        }
    }

    #[test]
    fn test_response_round_trip_per_version() {
        for v in 0..=2 {
            let bytes = ApiVersionsCodec::encode_response(&sample(), v).unwrap();
            let decoded = ApiVersionsCodec::decode_response(NomBytes::new(bytes), v).unwrap();
            let mut expected = sample();
            if v == 0 {
                expected.throttle_time_ms = 0;
            }
            assert_eq!(decoded, expected, "version {}", v);
        }
    }

    #[test]
    fn test_range_for() {
        let response = sample();
        assert_eq!(response.range_for(ApiKey::Fetch).unwrap().max_version, 10);
        assert!(response.range_for(ApiKey::EndTxn).is_none());
    }

    #[test]
    fn test_unsupported_version() {
        assert!(ApiVersionsCodec::encode_request(&ApiVersionsRequest, 3).is_err());
    }
}
