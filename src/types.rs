//! Type-safe wrappers for Kafka protocol primitives.
//!
//! These newtypes keep broker ids, producer ids and epochs from being mixed
//! up with the other integers flowing through the client.

use bytes::{BufMut, Bytes};
use std::fmt;
use std::str::FromStr;

use crate::encode::ToByte;
use crate::error::Result;

/// A Kafka broker identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BrokerId(pub i32);

impl BrokerId {
    /// Invalid broker ID, used for seed brokers whose id is not yet known
    /// and for partitions without a leader.
    pub const INVALID: Self = BrokerId(-1);

    #[inline]
    pub const fn new(value: i32) -> Self {
        BrokerId(value)
    }

    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for BrokerId {
    fn from(value: i32) -> Self {
        BrokerId(value)
    }
}

impl From<BrokerId> for i32 {
    fn from(id: BrokerId) -> Self {
        id.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for BrokerId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// A Kafka producer ID for idempotent/transactional producers.
///
/// Producer IDs are assigned by the broker through `InitProducerId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProducerId(pub i64);

impl ProducerId {
    /// Producer id carried by non-idempotent batches.
    pub const INVALID: Self = ProducerId(-1);

    #[inline]
    pub const fn new(value: i64) -> Self {
        ProducerId(value)
    }

    #[inline]
    pub const fn value(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i64> for ProducerId {
    fn from(value: i64) -> Self {
        ProducerId(value)
    }
}

impl From<ProducerId> for i64 {
    fn from(id: ProducerId) -> Self {
        id.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for ProducerId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// A Kafka producer epoch.
///
/// The coordinator bumps the epoch whenever a transactional id is
/// re-initialised, fencing off older sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProducerEpoch(pub i16);

impl ProducerEpoch {
    pub const INVALID: Self = ProducerEpoch(-1);

    #[inline]
    pub const fn new(value: i16) -> Self {
        ProducerEpoch(value)
    }

    #[inline]
    pub const fn value(self) -> i16 {
        self.0
    }
}

impl From<i16> for ProducerEpoch {
    fn from(value: i16) -> Self {
        ProducerEpoch(value)
    }
}

impl From<ProducerEpoch> for i16 {
    fn from(epoch: ProducerEpoch) -> Self {
        epoch.0
    }
}

impl fmt::Display for ProducerEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for ProducerEpoch {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

// ============================================================================
// TopicPartition
// ============================================================================

/// A topic-partition identifier.
///
/// ```
/// use kafkaesque_client::types::TopicPartition;
///
/// let tp = TopicPartition::new("my-topic", 0);
/// assert_eq!(tp.to_string(), "my-topic-0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    #[inline]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl From<(&str, i32)> for TopicPartition {
    fn from((topic, partition): (&str, i32)) -> Self {
        Self::new(topic, partition)
    }
}

impl From<(String, i32)> for TopicPartition {
    fn from((topic, partition): (String, i32)) -> Self {
        Self { topic, partition }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

// ============================================================================
// Record headers
// ============================================================================

/// A key/value header attached to a v2 record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl RecordHeader {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

// ============================================================================
// Wire enums
// ============================================================================

/// Visibility of transactional records for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Everything up to the high-water mark, aborted records included.
    #[default]
    ReadUncommitted,
    /// Only records from committed transactions, up to the last stable offset.
    ReadCommitted,
}

impl IsolationLevel {
    pub fn as_i8(self) -> i8 {
        match self {
            IsolationLevel::ReadUncommitted => 0,
            IsolationLevel::ReadCommitted => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        if value == 1 {
            IsolationLevel::ReadCommitted
        } else {
            IsolationLevel::ReadUncommitted
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            other => Err(format!("unknown isolation level '{}'", other)),
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "read_uncommitted"),
            IsolationLevel::ReadCommitted => write!(f, "read_committed"),
        }
    }
}

/// Coordinator kind looked up through `FindCoordinator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorType {
    Group,
    Transaction,
}

impl CoordinatorType {
    pub fn as_i8(self) -> i8 {
        match self {
            CoordinatorType::Group => 0,
            CoordinatorType::Transaction => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        if value == 1 {
            CoordinatorType::Transaction
        } else {
            CoordinatorType::Group
        }
    }
}

/// Acknowledgement level requested from the partition leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredAcks {
    /// Fire and forget; the broker sends no response.
    NoResponse,
    /// Wait for the leader's local write.
    #[default]
    WaitForLocal,
    /// Wait for every in-sync replica.
    WaitForAll,
}

impl RequiredAcks {
    pub fn as_i16(self) -> i16 {
        match self {
            RequiredAcks::NoResponse => 0,
            RequiredAcks::WaitForLocal => 1,
            RequiredAcks::WaitForAll => -1,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => RequiredAcks::NoResponse,
            -1 => RequiredAcks::WaitForAll,
            _ => RequiredAcks::WaitForLocal,
        }
    }
}

impl FromStr for RequiredAcks {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "none" | "no_response" => Ok(RequiredAcks::NoResponse),
            "1" | "local" | "wait_for_local" => Ok(RequiredAcks::WaitForLocal),
            "-1" | "all" | "wait_for_all" => Ok(RequiredAcks::WaitForAll),
            other => Err(format!("unknown acks value '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_id_invalid() {
        assert_eq!(BrokerId::INVALID.value(), -1);
        assert!(!BrokerId::INVALID.is_valid());
        assert!(BrokerId::new(0).is_valid());
    }

    #[test]
    fn test_broker_id_encode() {
        let mut buf = Vec::new();
        BrokerId::new(0x01020304).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_producer_id_encode() {
        let mut buf = Vec::new();
        ProducerId::new(12345).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x30, 0x39]);
    }

    #[test]
    fn test_producer_epoch_ordering() {
        assert!(ProducerEpoch::new(1) > ProducerEpoch::new(0));
        assert_eq!(ProducerEpoch::INVALID.value(), -1);
    }

    #[test]
    fn test_topic_partition_display_and_order() {
        let a = TopicPartition::new("a", 1);
        let b: TopicPartition = ("a", 2).into();
        assert_eq!(a.to_string(), "a-1");
        assert!(a < b);
    }

    #[test]
    fn test_isolation_level_round_trip() {
        for level in [IsolationLevel::ReadUncommitted, IsolationLevel::ReadCommitted] {
            assert_eq!(IsolationLevel::from_i8(level.as_i8()), level);
            assert_eq!(level.to_string().parse::<IsolationLevel>().unwrap(), level);
        }
        assert!("serializable".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_required_acks_values() {
        assert_eq!(RequiredAcks::NoResponse.as_i16(), 0);
        assert_eq!(RequiredAcks::WaitForLocal.as_i16(), 1);
        assert_eq!(RequiredAcks::WaitForAll.as_i16(), -1);
        assert_eq!("all".parse::<RequiredAcks>().unwrap(), RequiredAcks::WaitForAll);
    }

    #[test]
    fn test_coordinator_type_values() {
        assert_eq!(CoordinatorType::Group.as_i8(), 0);
        assert_eq!(CoordinatorType::from_i8(1), CoordinatorType::Transaction);
    }
}
