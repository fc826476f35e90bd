//! Cluster versions and the protocol features they unlock.
//!
//! A [`KafkaVersion`] is the minimum broker version the client may assume.
//! Every request version and record format is derived from it, so the same
//! client can speak to a 0.8 cluster or a 2.x one.

use std::fmt;
use std::str::FromStr;

use crate::compression::CompressionCodec;
use crate::error::Error;

/// A Kafka release, e.g. `0.10.2.0` or `2.1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KafkaVersion([u16; 4]);

impl KafkaVersion {
    pub const fn new(major: u16, minor: u16, patch: u16, build: u16) -> Self {
        KafkaVersion([major, minor, patch, build])
    }

    pub const V0_8_2_0: Self = Self::new(0, 8, 2, 0);
    pub const V0_8_2_1: Self = Self::new(0, 8, 2, 1);
    pub const V0_8_2_2: Self = Self::new(0, 8, 2, 2);
    pub const V0_9_0_0: Self = Self::new(0, 9, 0, 0);
    pub const V0_9_0_1: Self = Self::new(0, 9, 0, 1);
    pub const V0_10_0_0: Self = Self::new(0, 10, 0, 0);
    pub const V0_10_0_1: Self = Self::new(0, 10, 0, 1);
    pub const V0_10_1_0: Self = Self::new(0, 10, 1, 0);
    pub const V0_10_1_1: Self = Self::new(0, 10, 1, 1);
    pub const V0_10_2_0: Self = Self::new(0, 10, 2, 0);
    pub const V0_10_2_1: Self = Self::new(0, 10, 2, 1);
    pub const V0_11_0_0: Self = Self::new(0, 11, 0, 0);
    pub const V0_11_0_1: Self = Self::new(0, 11, 0, 1);
    pub const V0_11_0_2: Self = Self::new(0, 11, 0, 2);
    pub const V1_0_0_0: Self = Self::new(1, 0, 0, 0);
    pub const V1_1_0_0: Self = Self::new(1, 1, 0, 0);
    pub const V1_1_1_0: Self = Self::new(1, 1, 1, 0);
    pub const V2_0_0_0: Self = Self::new(2, 0, 0, 0);
    pub const V2_0_1_0: Self = Self::new(2, 0, 1, 0);
    pub const V2_1_0_0: Self = Self::new(2, 1, 0, 0);
    pub const V2_2_0_0: Self = Self::new(2, 2, 0, 0);
    pub const V2_3_0_0: Self = Self::new(2, 3, 0, 0);

    pub const MIN_VERSION: Self = Self::V0_8_2_0;
    pub const MAX_VERSION: Self = Self::V2_3_0_0;

    #[inline]
    pub fn is_at_least(self, other: KafkaVersion) -> bool {
        self >= other
    }

    pub fn produce_version(self) -> i16 {
        if self.is_at_least(Self::V2_1_0_0) {
            7
        } else if self.is_at_least(Self::V1_0_0_0) {
            5
        } else if self.is_at_least(Self::V0_11_0_0) {
            3
        } else if self.is_at_least(Self::V0_10_0_0) {
            2
        } else if self.is_at_least(Self::V0_9_0_0) {
            1
        } else {
            0
        }
    }

    pub fn fetch_version(self) -> i16 {
        if self.is_at_least(Self::V2_1_0_0) {
            10
        } else if self.is_at_least(Self::V1_0_0_0) {
            5
        } else if self.is_at_least(Self::V0_11_0_0) {
            4
        } else if self.is_at_least(Self::V0_10_1_0) {
            3
        } else if self.is_at_least(Self::V0_10_0_0) {
            2
        } else if self.is_at_least(Self::V0_9_0_0) {
            1
        } else {
            0
        }
    }

    pub fn metadata_version(self) -> i16 {
        if self.is_at_least(Self::V1_0_0_0) {
            5
        } else if self.is_at_least(Self::V0_11_0_0) {
            4
        } else if self.is_at_least(Self::V0_10_1_0) {
            2
        } else if self.is_at_least(Self::V0_10_0_0) {
            1
        } else {
            0
        }
    }

    pub fn list_offsets_version(self) -> i16 {
        if self.is_at_least(Self::V0_11_0_0) {
            2
        } else if self.is_at_least(Self::V0_10_1_0) {
            1
        } else {
            0
        }
    }

    pub fn find_coordinator_version(self) -> i16 {
        if self.is_at_least(Self::V2_0_0_0) {
            2
        } else if self.is_at_least(Self::V0_11_0_0) {
            1
        } else {
            0
        }
    }

    /// Version shared by InitProducerId, AddPartitionsToTxn and EndTxn.
    pub fn transaction_api_version(self) -> i16 {
        if self.is_at_least(Self::V2_0_0_0) { 1 } else { 0 }
    }

    pub fn api_versions_version(self) -> i16 {
        if self.is_at_least(Self::V2_0_0_0) {
            2
        } else if self.is_at_least(Self::V0_11_0_0) {
            1
        } else {
            0
        }
    }

    /// Clusters from 0.10 onwards answer `ApiVersions`.
    pub fn supports_api_versions(self) -> bool {
        self.is_at_least(Self::V0_10_0_0)
    }

    /// Idempotent and transactional producers need 0.11 record batches.
    pub fn supports_idempotence(self) -> bool {
        self.is_at_least(Self::V0_11_0_0)
    }

    /// Record format used by produce requests: magic 0, 1 or 2.
    pub fn record_magic(self) -> i8 {
        magic_for_produce_version(self.produce_version())
    }

    pub fn supports_codec(self, codec: CompressionCodec) -> bool {
        self.is_at_least(codec.min_version())
    }

    pub const SUPPORTED_VERSIONS: &'static [KafkaVersion] = &[
        Self::V0_8_2_0,
        Self::V0_8_2_1,
        Self::V0_8_2_2,
        Self::V0_9_0_0,
        Self::V0_9_0_1,
        Self::V0_10_0_0,
        Self::V0_10_0_1,
        Self::V0_10_1_0,
        Self::V0_10_1_1,
        Self::V0_10_2_0,
        Self::V0_10_2_1,
        Self::V0_11_0_0,
        Self::V0_11_0_1,
        Self::V0_11_0_2,
        Self::V1_0_0_0,
        Self::V1_1_0_0,
        Self::V1_1_1_0,
        Self::V2_0_0_0,
        Self::V2_0_1_0,
        Self::V2_1_0_0,
        Self::V2_2_0_0,
        Self::V2_3_0_0,
    ];
}

/// Record format carried by a produce request of the given version.
pub fn magic_for_produce_version(version: i16) -> i8 {
    match version {
        v if v >= 3 => 2,
        2 => 1,
        _ => 0,
    }
}

/// Record format a broker returns for a fetch request of the given version.
pub fn magic_for_fetch_version(version: i16) -> i8 {
    match version {
        v if v >= 4 => 2,
        2 | 3 => 1,
        _ => 0,
    }
}

impl Default for KafkaVersion {
    fn default() -> Self {
        KafkaVersion::V1_0_0_0
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        if a == 0 {
            write!(f, "{}.{}.{}.{}", a, b, c, d)
        } else {
            write!(f, "{}.{}.{}", a, b, c)
        }
    }
}

impl FromStr for KafkaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .trim()
            .split('.')
            .map(|p| p.parse::<u16>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| Error::Config(format!("invalid kafka version '{}'", s)))?;

        let version = match parts.as_slice() {
            [0, b, c, d] => KafkaVersion::new(0, *b, *c, *d),
            [a, b, c] if *a > 0 => KafkaVersion::new(*a, *b, *c, 0),
            _ => return Err(Error::Config(format!("invalid kafka version '{}'", s))),
        };
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let v: KafkaVersion = "0.10.2.1".parse().unwrap();
        assert_eq!(v, KafkaVersion::V0_10_2_1);
        assert_eq!(v.to_string(), "0.10.2.1");

        let v: KafkaVersion = "2.1.0".parse().unwrap();
        assert_eq!(v, KafkaVersion::V2_1_0_0);
        assert_eq!(v.to_string(), "2.1.0");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<KafkaVersion>().is_err());
        assert!("0.10".parse::<KafkaVersion>().is_err());
        assert!("2.1.0.0".parse::<KafkaVersion>().is_err());
        assert!("x.y.z".parse::<KafkaVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(KafkaVersion::V0_10_2_0 < KafkaVersion::V0_11_0_0);
        assert!(KafkaVersion::V1_0_0_0.is_at_least(KafkaVersion::V0_11_0_2));
        assert!(!KafkaVersion::V0_9_0_1.is_at_least(KafkaVersion::V0_10_0_0));
    }

    #[test]
    fn test_supported_versions_sorted() {
        let versions = KafkaVersion::SUPPORTED_VERSIONS;
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.first(), Some(&KafkaVersion::MIN_VERSION));
        assert_eq!(versions.last(), Some(&KafkaVersion::MAX_VERSION));
    }

    #[test]
    fn test_api_version_table() {
        let cases = [
            (KafkaVersion::V0_8_2_0, 0, 0, 0, 0),
            (KafkaVersion::V0_9_0_0, 1, 1, 0, 0),
            (KafkaVersion::V0_10_0_0, 2, 2, 1, 0),
            (KafkaVersion::V0_10_1_0, 2, 3, 2, 1),
            (KafkaVersion::V0_11_0_0, 3, 4, 4, 2),
            (KafkaVersion::V1_0_0_0, 5, 5, 5, 2),
            (KafkaVersion::V2_1_0_0, 7, 10, 5, 2),
        ];
        for (version, produce, fetch, metadata, offsets) in cases {
            assert_eq!(version.produce_version(), produce, "{}", version);
            assert_eq!(version.fetch_version(), fetch, "{}", version);
            assert_eq!(version.metadata_version(), metadata, "{}", version);
            assert_eq!(version.list_offsets_version(), offsets, "{}", version);
        }
    }

    #[test]
    fn test_coordinator_and_txn_versions() {
        assert_eq!(KafkaVersion::V0_10_2_0.find_coordinator_version(), 0);
        assert_eq!(KafkaVersion::V0_11_0_0.find_coordinator_version(), 1);
        assert_eq!(KafkaVersion::V2_0_0_0.find_coordinator_version(), 2);
        assert_eq!(KafkaVersion::V0_11_0_0.transaction_api_version(), 0);
        assert_eq!(KafkaVersion::V2_1_0_0.transaction_api_version(), 1);
    }

    #[test]
    fn test_record_magic() {
        assert_eq!(KafkaVersion::V0_9_0_1.record_magic(), 0);
        assert_eq!(KafkaVersion::V0_10_2_1.record_magic(), 1);
        assert_eq!(KafkaVersion::V0_11_0_0.record_magic(), 2);
        assert_eq!(magic_for_fetch_version(3), 1);
        assert_eq!(magic_for_fetch_version(10), 2);
    }

    #[test]
    fn test_feature_gates() {
        assert!(!KafkaVersion::V0_9_0_0.supports_codec(CompressionCodec::Lz4));
        assert!(KafkaVersion::V0_10_0_0.supports_codec(CompressionCodec::Lz4));
        assert!(!KafkaVersion::V2_0_0_0.supports_codec(CompressionCodec::Zstd));
        assert!(KafkaVersion::V2_1_0_0.supports_codec(CompressionCodec::Zstd));
        assert!(!KafkaVersion::V0_10_2_1.supports_idempotence());
        assert!(KafkaVersion::V0_11_0_0.supports_idempotence());
    }
}
