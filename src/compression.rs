//! Compression codecs for record batches and legacy message sets.
//!
//! The codec id lives in the low three bits of the attributes field for every
//! record format. Compression is applied to a whole batch at once.

use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::version::KafkaVersion;

/// Prefix written by the xerial snappy framing used by the JVM client.
const XERIAL_SNAPPY_MAGIC: &[u8] = b"\x82SNAPPY\x00";
const XERIAL_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

/// Level value meaning "use the codec's default".
pub const DEFAULT_COMPRESSION_LEVEL: i32 = -1000;

impl CompressionCodec {
    pub const ALL: [CompressionCodec; 5] = [
        CompressionCodec::None,
        CompressionCodec::Gzip,
        CompressionCodec::Snappy,
        CompressionCodec::Lz4,
        CompressionCodec::Zstd,
    ];

    pub fn id(self) -> i8 {
        match self {
            CompressionCodec::None => 0,
            CompressionCodec::Gzip => 1,
            CompressionCodec::Snappy => 2,
            CompressionCodec::Lz4 => 3,
            CompressionCodec::Zstd => 4,
        }
    }

    pub fn from_id(id: i8) -> Result<Self> {
        match id {
            0 => Ok(CompressionCodec::None),
            1 => Ok(CompressionCodec::Gzip),
            2 => Ok(CompressionCodec::Snappy),
            3 => Ok(CompressionCodec::Lz4),
            4 => Ok(CompressionCodec::Zstd),
            other => Err(Error::UnsupportedCompression(format!("codec id {}", other))),
        }
    }

    /// Oldest cluster version able to store this codec.
    pub fn min_version(self) -> KafkaVersion {
        match self {
            CompressionCodec::None | CompressionCodec::Gzip | CompressionCodec::Snappy => {
                KafkaVersion::MIN_VERSION
            }
            CompressionCodec::Lz4 => KafkaVersion::V0_10_0_0,
            CompressionCodec::Zstd => KafkaVersion::V2_1_0_0,
        }
    }

    /// Lowest record format (magic) able to carry this codec.
    pub fn min_magic(self) -> i8 {
        match self {
            CompressionCodec::Lz4 => 1,
            CompressionCodec::Zstd => 2,
            _ => 0,
        }
    }

    pub fn compress(self, data: &[u8], level: i32) -> Result<Bytes> {
        let encoding = codec_error(self);
        let compressed = match self {
            CompressionCodec::None => return Ok(Bytes::copy_from_slice(data)),
            CompressionCodec::Gzip => {
                let level = if level == DEFAULT_COMPRESSION_LEVEL {
                    Compression::default()
                } else {
                    Compression::new(level.clamp(0, 9) as u32)
                };
                let mut encoder = GzEncoder::new(BytesMut::new().writer(), level);
                encoder.write_all(data).map_err(&encoding)?;
                encoder.finish().map_err(&encoding)?.into_inner()
            }
            CompressionCodec::Snappy => {
                let out = snap::raw::Encoder::new()
                    .compress_vec(data)
                    .map_err(|e| Error::Encoding(format!("snappy: {}", e)))?;
                BytesMut::from(&out[..])
            }
            CompressionCodec::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(BytesMut::new().writer());
                encoder.write_all(data).map_err(&encoding)?;
                encoder
                    .finish()
                    .map_err(|e| Error::Encoding(format!("lz4: {}", e)))?
                    .into_inner()
            }
            CompressionCodec::Zstd => {
                let level = if level == DEFAULT_COMPRESSION_LEVEL { 0 } else { level };
                let mut encoder = zstd::stream::write::Encoder::new(BytesMut::new().writer(), level)
                    .map_err(&encoding)?;
                encoder.write_all(data).map_err(&encoding)?;
                encoder.finish().map_err(&encoding)?.into_inner()
            }
        };
        Ok(compressed.freeze())
    }

    pub fn decompress(self, data: &[u8]) -> Result<Bytes> {
        let mut out = Vec::new();
        match self {
            CompressionCodec::None => return Ok(Bytes::copy_from_slice(data)),
            CompressionCodec::Gzip => {
                MultiGzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Encoding(format!("gzip: {}", e)))?;
            }
            CompressionCodec::Snappy => out = decompress_snappy(data)?,
            CompressionCodec::Lz4 => {
                lz4_flex::frame::FrameDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::Encoding(format!("lz4: {}", e)))?;
            }
            CompressionCodec::Zstd => {
                out = zstd::stream::decode_all(data)
                    .map_err(|e| Error::Encoding(format!("zstd: {}", e)))?;
            }
        }
        Ok(Bytes::from(out))
    }
}

/// Maps a compressor I/O failure to an encoding error.
fn codec_error(codec: CompressionCodec) -> impl Fn(std::io::Error) -> Error {
    move |e| Error::Encoding(format!("{}: {}", codec, e))
}

/// Raw snappy, or the xerial chunked framing some producers emit.
fn decompress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = snap::raw::Decoder::new();
    if !data.starts_with(XERIAL_SNAPPY_MAGIC) {
        return decoder
            .decompress_vec(data)
            .map_err(|e| Error::Encoding(format!("snappy: {}", e)));
    }

    let mut out = Vec::new();
    let mut rest = data.get(XERIAL_HEADER_LEN..).unwrap_or_default();
    while !rest.is_empty() {
        let (len, tail) = rest
            .split_first_chunk::<4>()
            .ok_or_else(|| Error::Encoding("snappy: truncated chunk header".into()))?;
        let len = u32::from_be_bytes(*len) as usize;
        let chunk = tail
            .get(..len)
            .ok_or_else(|| Error::Encoding("snappy: truncated chunk".into()))?;
        out.extend(
            decoder
                .decompress_vec(chunk)
                .map_err(|e| Error::Encoding(format!("snappy: {}", e)))?,
        );
        rest = &tail[len..];
    }
    Ok(out)
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionCodec::None => "none",
            CompressionCodec::Gzip => "gzip",
            CompressionCodec::Snappy => "snappy",
            CompressionCodec::Lz4 => "lz4",
            CompressionCodec::Zstd => "zstd",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CompressionCodec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(CompressionCodec::None),
            "gzip" => Ok(CompressionCodec::Gzip),
            "snappy" => Ok(CompressionCodec::Snappy),
            "lz4" => Ok(CompressionCodec::Lz4),
            "zstd" => Ok(CompressionCodec::Zstd),
            other => Err(Error::UnsupportedCompression(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
        Lorem ipsum dolor sit amet, consectetur adipiscing elit.";

    #[test]
    fn test_compressor_failure_is_encoding_error() {
        let err = codec_error(CompressionCodec::Zstd)(std::io::Error::other("out of memory"));
        assert_eq!(err, Error::Encoding("zstd: out of memory".to_string()));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_every_codec_restores_payload() {
        for codec in CompressionCodec::ALL {
            let compressed = codec.compress(PAYLOAD, DEFAULT_COMPRESSION_LEVEL).unwrap();
            let restored = codec.decompress(&compressed).unwrap();
            assert_eq!(&restored[..], PAYLOAD, "codec {}", codec);
        }
    }

    #[test]
    fn test_explicit_levels() {
        let gz = CompressionCodec::Gzip.compress(PAYLOAD, 9).unwrap();
        assert_eq!(&CompressionCodec::Gzip.decompress(&gz).unwrap()[..], PAYLOAD);
        let zs = CompressionCodec::Zstd.compress(PAYLOAD, 3).unwrap();
        assert_eq!(&CompressionCodec::Zstd.decompress(&zs).unwrap()[..], PAYLOAD);
    }

    #[test]
    fn test_xerial_snappy_framing() {
        let chunk = snap::raw::Encoder::new().compress_vec(PAYLOAD).unwrap();
        let mut framed = Vec::new();
        framed.extend_from_slice(XERIAL_SNAPPY_MAGIC);
        framed.extend_from_slice(&1u32.to_be_bytes());
        framed.extend_from_slice(&1u32.to_be_bytes());
        framed.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        framed.extend_from_slice(&chunk);

        let restored = CompressionCodec::Snappy.decompress(&framed).unwrap();
        assert_eq!(&restored[..], PAYLOAD);
    }

    #[test]
    fn test_corrupt_input_is_encoding_error() {
        let err = CompressionCodec::Gzip.decompress(b"not gzip").unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_codec_ids() {
        for codec in CompressionCodec::ALL {
            assert_eq!(CompressionCodec::from_id(codec.id()).unwrap(), codec);
        }
        assert!(CompressionCodec::from_id(7).is_err());
    }

    #[test]
    fn test_min_versions() {
        assert_eq!(CompressionCodec::Lz4.min_version(), KafkaVersion::V0_10_0_0);
        assert_eq!(CompressionCodec::Zstd.min_version(), KafkaVersion::V2_1_0_0);
        assert_eq!(CompressionCodec::Gzip.min_magic(), 0);
        assert_eq!(CompressionCodec::Zstd.min_magic(), 2);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("LZ4".parse::<CompressionCodec>().unwrap(), CompressionCodec::Lz4);
        assert!("brotli".parse::<CompressionCodec>().is_err());
    }
}
