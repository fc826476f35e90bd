//! Crate & protocol level errors.
//!
//! # Error Hierarchy
//!
//! - [`Error`]: everything the client surfaces to callers. Variants carry the
//!   partition or key they concern so that errors pulled off a consumer or
//!   producer error channel are self-describing.
//! - [`KafkaCode`]: wire protocol error codes returned by brokers.
//!
//! [`Error::from_code`] maps broker codes onto the most specific variant and
//! [`Error::is_retriable`] tells the retry machinery whether an operation may
//! be attempted again. Errors are never downgraded: a fatal condition stays
//! fatal on every path that forwards it.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

use crate::types::TopicPartition;

pub type Result<T> = result::Result<T, Error>;

/// Client level errors.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// The requested offset lies outside the partition's retained range.
    /// Never retried and never clamped.
    #[error("offset {offset} out of range for {topic}/{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
    },

    /// The cached leader no longer leads the partition.
    #[error("broker is not the leader for {topic}/{partition}")]
    NotLeaderForPartition { topic: String, partition: i32 },

    /// No coordinator is currently available for the key.
    #[error("coordinator not available for '{0}'")]
    CoordinatorNotAvailable(String),

    /// An I/O failure on a broker connection.
    #[error("network error: {0:?}")]
    Network(io::ErrorKind),

    /// A single message is larger than `producer.max_message_bytes`.
    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// The broker rejected a batch because of a sequence gap, a duplicate or
    /// a stale producer epoch. Fatal for the producer session.
    #[error("sequence/fencing error {code:?} on {topic}/{partition}")]
    SequenceFencing {
        topic: String,
        partition: i32,
        code: KafkaCode,
    },

    /// Malformed wire data or a payload that cannot be encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A response arrived out of order; the connection is torn down.
    #[error("correlation id mismatch: expected {expected}, received {received}")]
    CorrelationMismatch { expected: i32, received: i32 },

    /// The request version is above what the client or broker supports.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    /// The compression codec is unavailable for the negotiated version.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),

    /// Any other broker error code.
    #[error("broker error: {0:?}")]
    Kafka(KafkaCode),

    /// Transaction state machine violation or coordinator failure.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The client, producer or consumer has been closed.
    #[error("closed")]
    Closed,

    /// The partition is already consumed by this consumer.
    #[error("partition {topic}/{partition} is already being consumed")]
    ConsumerAlreadyExists { topic: String, partition: i32 },

    /// Every known broker failed to answer.
    #[error("no brokers available")]
    NoBrokersAvailable,
}

impl Error {
    /// Builds the most specific error for a non-zero broker code.
    ///
    /// `OffsetOutOfRange` is reported with offset -1; callers that know the
    /// requested offset build the variant themselves.
    pub fn from_code(code: KafkaCode, tp: &TopicPartition) -> Error {
        match code {
            KafkaCode::OffsetOutOfRange => Error::OffsetOutOfRange {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: -1,
            },
            KafkaCode::NotLeaderForPartition => Error::NotLeaderForPartition {
                topic: tp.topic.clone(),
                partition: tp.partition,
            },
            KafkaCode::CoordinatorNotAvailable | KafkaCode::NotCoordinator => {
                Error::CoordinatorNotAvailable(tp.topic.clone())
            }
            code if code.is_sequence_fencing() => Error::SequenceFencing {
                topic: tp.topic.clone(),
                partition: tp.partition,
                code,
            },
            other => Error::Kafka(other),
        }
    }

    /// Whether the failed operation may be attempted again after a backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::NotLeaderForPartition { .. }
            | Error::CoordinatorNotAvailable(_)
            | Error::Network(_)
            | Error::NoBrokersAvailable => true,
            Error::Kafka(code) => code.is_retriable(),
            _ => false,
        }
    }

    /// Whether the error means cached leadership or coordinator data is stale.
    pub fn is_stale_metadata(&self) -> bool {
        matches!(
            self,
            Error::NotLeaderForPartition { .. }
                | Error::CoordinatorNotAvailable(_)
                | Error::Kafka(
                    KafkaCode::LeaderNotAvailable
                        | KafkaCode::UnknownTopicOrPartition
                        | KafkaCode::NotCoordinator
                        | KafkaCode::CoordinatorNotAvailable
                )
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(e.kind())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Network(io::ErrorKind::TimedOut)
    }
}

/// Various errors reported by a remote Kafka server.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default)]
pub enum KafkaCode {
    /// An unexpected server error, or a code this client does not know.
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition.
    OffsetOutOfRange = 1,
    /// A message's contents do not match its CRC.
    CorruptMessage = 2,
    /// The topic or partition does not exist on this broker.
    UnknownTopicOrPartition = 3,
    /// The requested fetch size is invalid.
    InvalidFetchSize = 4,
    /// Leadership election in progress; the partition is unavailable.
    LeaderNotAvailable = 5,
    /// The client's metadata is out of date.
    NotLeaderForPartition = 6,
    /// The request exceeded its time limit on the broker.
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    ReplicaNotAvailable = 9,
    /// The broker's `message.max.bytes` is smaller than the batch.
    MessageSizeTooLarge = 10,
    /// The server disconnected before a response was received.
    NetworkException = 13,
    /// The coordinator is still loading its state.
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    /// The broker is not the coordinator for the key.
    NotCoordinator = 16,
    InvalidTopic = 17,
    RecordListTooLarge = 18,
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    InvalidRequiredAcks = 21,
    TopicAuthorizationFailed = 29,
    ClusterAuthorizationFailed = 31,
    InvalidTimestamp = 32,
    /// The version of API is not supported.
    UnsupportedVersion = 35,
    /// The message format version on the broker does not support the request.
    UnsupportedForMessageFormat = 43,
    /// The producer skipped a sequence number.
    OutOfOrderSequenceNumber = 45,
    /// The producer reused a sequence number.
    DuplicateSequenceNumber = 46,
    /// The producer's epoch is older than the broker's.
    InvalidProducerEpoch = 47,
    /// The transaction is not in a state that allows the operation.
    InvalidTxnState = 48,
    /// The producer id is not known to the coordinator.
    InvalidProducerIdMapping = 49,
    InvalidTransactionTimeout = 50,
    /// Another transaction operation for the same id is still completing.
    ConcurrentTransactions = 51,
    TransactionCoordinatorFenced = 52,
    TransactionalIdAuthorizationFailed = 53,
    KafkaStorageError = 56,
    /// The broker does not understand the compression codec.
    UnsupportedCompressionType = 76,
    /// A newer producer with the same transactional id exists.
    ProducerFenced = 90,
}

impl KafkaCode {
    /// Decodes a wire error code; codes this client does not know become
    /// [`KafkaCode::Unknown`].
    pub fn from_wire(code: i16) -> KafkaCode {
        KafkaCode::from_i16(code).unwrap_or(KafkaCode::Unknown)
    }

    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            KafkaCode::CorruptMessage
                | KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::RequestTimedOut
                | KafkaCode::NetworkException
                | KafkaCode::CoordinatorLoadInProgress
                | KafkaCode::CoordinatorNotAvailable
                | KafkaCode::NotCoordinator
                | KafkaCode::NotEnoughReplicas
                | KafkaCode::NotEnoughReplicasAfterAppend
                | KafkaCode::ConcurrentTransactions
                | KafkaCode::KafkaStorageError
        )
    }

    /// Codes that break the idempotent sequence or fence the producer.
    pub fn is_sequence_fencing(self) -> bool {
        matches!(
            self,
            KafkaCode::OutOfOrderSequenceNumber
                | KafkaCode::DuplicateSequenceNumber
                | KafkaCode::InvalidProducerEpoch
                | KafkaCode::ProducerFenced
        )
    }
}
