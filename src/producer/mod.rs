//! Producers.
//!
//! # Architecture
//!
//! ```text
//! send() ──► input ──► dispatcher ──► broker task (ProduceSet) ──► Broker
//!                       │ partitioner        │ flush triggers
//!                       │ size check         │ sequences, retries
//!                       │ txn registration   ▼
//!                       └──────────────► successes / errors
//! ```
//!
//! - [`AsyncProducer`] accepts messages without waiting for them and reports
//!   results on two bounded channels.
//! - [`SyncProducer`] wraps it and waits for each message's result.
//! - [`TransactionManager`] owns the producer id, per-partition sequence
//!   numbers and the transaction state machine.
//!
//! # Delivery guarantees
//!
//! | Config | Guarantee |
//! |--------|-----------|
//! | default | at least once per partition, retried `producer.retry.max` times |
//! | `producer.idempotent` | no duplicates; sequences contiguous per partition |
//! | `producer.transaction.id` | all-or-nothing across partitions for `ReadCommitted` readers |

mod async_producer;
pub mod partitioner;
pub mod produce_set;
mod sync_producer;
pub mod txn;

pub use async_producer::AsyncProducer;
pub use partitioner::{
    HashPartitioner, ManualPartitioner, Partitioner, RoundRobinPartitioner,
};
pub use produce_set::ProduceSet;
pub use sync_producer::SyncProducer;
pub use txn::{ProducerSession, TransactionManager, TransactionStatus};

use bytes::Bytes;
use thiserror::Error as ThisError;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::types::{RecordHeader, TopicPartition};

/// A message to produce. After delivery `partition` and `offset` hold
/// where it was written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProducerMessage {
    pub topic: String,
    /// Required by the manual partitioner; chosen by the others.
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
    /// Milliseconds since the epoch; stamped on submission when unset.
    pub timestamp: Option<i64>,
    /// Unknown until acknowledged, and never known with `RequiredAcks::NoResponse`.
    pub offset: Option<i64>,
    /// Opaque tag handed back with the result.
    pub metadata: Option<u64>,
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> ProducerMessage {
        ProducerMessage {
            topic: topic.into(),
            value: Some(value.into()),
            ..ProducerMessage::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader::new(key, value));
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata(mut self, metadata: u64) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The destination, once a partition is set.
    pub fn topic_partition(&self) -> Option<TopicPartition> {
        self.partition.map(|p| TopicPartition::new(&self.topic, p))
    }
}

/// A message that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("failed to produce to {}: {}", .message.topic, .error)]
pub struct ProducerError {
    pub message: ProducerMessage,
    pub error: Error,
}

pub(crate) type Reply = oneshot::Sender<std::result::Result<ProducerMessage, ProducerError>>;

/// A message in flight, with the caller waiting on it (sync producer) if any.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) message: ProducerMessage,
    pub(crate) reply: Option<Reply>,
}

impl Envelope {
    pub(crate) fn detached(message: ProducerMessage) -> Envelope {
        Envelope {
            message,
            reply: None,
        }
    }
}
