//! Partition consumers.
//!
//! A [`Consumer`] hands out one [`PartitionConsumer`] per topic-partition.
//! Each partition consumer runs its own fetch task that moves through
//! [`ConsumerState`]:
//!
//! ```text
//! Initializing ──► Fetching ◄──► ErrorBackoff
//!                     │               │
//!                     └──► Closed ◄───┘
//! ```
//!
//! Records are delivered in strictly increasing offset order on a bounded
//! channel of `channel_buffer_size` entries; errors go to a second channel
//! when `consumer.return_errors` is set.
//!
//! ```rust,no_run
//! # async fn example() -> kafkaesque_client::error::Result<()> {
//! use kafkaesque_client::config::ClientConfig;
//! use kafkaesque_client::constants::OFFSET_OLDEST;
//! use kafkaesque_client::consumer::Consumer;
//!
//! let consumer = Consumer::new(&["localhost:9092"], ClientConfig::default()).await?;
//! let mut pc = consumer.consume_partition("events", 0, OFFSET_OLDEST).await?;
//! while let Some(message) = pc.recv().await {
//!     println!("{} {:?}", message.offset, message.value);
//! }
//! # Ok(())
//! # }
//! ```

mod partition;

pub use partition::PartitionConsumer;

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashSet;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::constants::{OFFSET_NEWEST, OFFSET_OLDEST};
use crate::error::{Error, Result};
use crate::types::{RecordHeader, TopicPartition};

/// A record delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Record headers; empty below record format v2.
    pub headers: Vec<RecordHeader>,
    /// Milliseconds since the epoch; -1 below record format v1.
    pub timestamp: i64,
    pub offset: i64,
}

/// Lifecycle of a partition consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Initializing = 0,
    Fetching = 1,
    ErrorBackoff = 2,
    Closed = 3,
}

impl ConsumerState {
    pub(crate) fn from_u8(value: u8) -> ConsumerState {
        match value {
            0 => ConsumerState::Initializing,
            1 => ConsumerState::Fetching,
            2 => ConsumerState::ErrorBackoff,
            _ => ConsumerState::Closed,
        }
    }
}

/// Creates partition consumers over a shared [`Client`].
#[derive(Debug)]
pub struct Consumer {
    client: Arc<Client>,
    owns_client: bool,
    active: Arc<DashSet<TopicPartition>>,
}

impl Consumer {
    /// Connects a new client dedicated to this consumer.
    pub async fn new<S: AsRef<str>>(addrs: &[S], config: ClientConfig) -> Result<Consumer> {
        let client = Client::new(addrs, config).await?;
        Ok(Consumer {
            client,
            owns_client: true,
            active: Arc::new(DashSet::new()),
        })
    }

    /// Shares an existing client. Closing the consumer leaves it open.
    pub fn from_client(client: Arc<Client>) -> Consumer {
        Consumer {
            client,
            owns_client: false,
            active: Arc::new(DashSet::new()),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn topics(&self) -> Vec<String> {
        self.client.topics()
    }

    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.client.partitions(topic).await
    }

    /// Starts consuming `topic`/`partition` at `offset`, which may be
    /// [`OFFSET_NEWEST`], [`OFFSET_OLDEST`] or a concrete offset between
    /// the oldest retained offset and the high-water mark (inclusive).
    ///
    /// Any other offset fails with [`Error::OffsetOutOfRange`] before the
    /// first fetch.
    pub async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<PartitionConsumer> {
        let tp = TopicPartition::new(topic, partition);
        if !self.active.insert(tp.clone()) {
            return Err(Error::ConsumerAlreadyExists {
                topic: topic.to_string(),
                partition,
            });
        }

        match self.resolve_offset(&tp, offset).await {
            Ok(start) => {
                tracing::debug!(topic, partition, requested = offset, start, "Starting partition consumer");
                Ok(PartitionConsumer::spawn(
                    self.client.clone(),
                    tp,
                    start,
                    self.active.clone(),
                ))
            }
            Err(e) => {
                self.active.remove(&tp);
                Err(e)
            }
        }
    }

    async fn resolve_offset(&self, tp: &TopicPartition, offset: i64) -> Result<i64> {
        // fail fast on unknown partitions before asking for offsets
        self.client.leader_for(tp).await?;
        let newest = self.client.get_offset(&tp.topic, tp.partition, OFFSET_NEWEST).await?;
        let oldest = self.client.get_offset(&tp.topic, tp.partition, OFFSET_OLDEST).await?;

        match offset {
            OFFSET_NEWEST => Ok(newest),
            OFFSET_OLDEST => Ok(oldest),
            offset if offset >= oldest && offset <= newest => Ok(offset),
            offset => Err(Error::OffsetOutOfRange {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset,
            }),
        }
    }

    /// Closes the underlying client if this consumer created it.
    pub async fn close(&self) {
        if self.owns_client {
            self.client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;
    use crate::records::RecordData;
    use std::time::Duration;

    fn record(value: &'static [u8]) -> RecordData {
        RecordData {
            value: Some(Bytes::from_static(value)),
            timestamp: 1_700_000_000_000,
            ..RecordData::default()
        }
    }

    async fn setup() -> (MockCluster, Consumer) {
        let cluster = MockCluster::start(1).await.unwrap();
        cluster.create_topic("events", 1);
        cluster
            .append("events", 0, vec![record(b"a"), record(b"b"), record(b"c")])
            .unwrap();
        let mut config = ClientConfig::default();
        config.consumer.max_wait_time = Duration::from_millis(20);
        config.metadata.retry_backoff = Duration::from_millis(5);
        let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
        (cluster, consumer)
    }

    #[tokio::test]
    async fn test_offset_out_of_range_rejected_before_fetch() {
        let (cluster, consumer) = setup().await;
        for offset in [-10, 4, i64::MAX] {
            let err = consumer
                .consume_partition("events", 0, offset)
                .await
                .unwrap_err();
            assert_eq!(
                err,
                Error::OffsetOutOfRange {
                    topic: "events".to_string(),
                    partition: 0,
                    offset
                }
            );
        }
        assert_eq!(cluster.request_count(crate::codec::ApiKey::Fetch), 0);
    }

    #[tokio::test]
    async fn test_partition_consumed_once() {
        let (_cluster, consumer) = setup().await;
        let mut pc = consumer.consume_partition("events", 0, 0).await.unwrap();
        let err = consumer.consume_partition("events", 0, 0).await.unwrap_err();
        assert!(matches!(err, Error::ConsumerAlreadyExists { partition: 0, .. }));

        pc.close().await.unwrap();
        let mut again = consumer.consume_partition("events", 0, 1).await.unwrap();
        assert_eq!(again.recv().await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_sentinels_resolve() {
        let (cluster, consumer) = setup().await;
        let mut oldest = consumer
            .consume_partition("events", 0, OFFSET_OLDEST)
            .await
            .unwrap();
        assert_eq!(oldest.recv().await.unwrap().value.unwrap().as_ref(), b"a");
        oldest.close().await.unwrap();

        let mut newest = consumer
            .consume_partition("events", 0, OFFSET_NEWEST)
            .await
            .unwrap();
        cluster.append("events", 0, vec![record(b"d")]).unwrap();
        let message = newest.recv().await.unwrap();
        assert_eq!(message.offset, 3);
        assert_eq!(message.value.unwrap().as_ref(), b"d");
    }

    #[tokio::test]
    async fn test_unknown_partition() {
        let (_cluster, consumer) = setup().await;
        let err = consumer.consume_partition("events", 7, 0).await.unwrap_err();
        assert!(matches!(err, Error::Kafka(_)));
        // a failed start does not block a later one
        assert!(consumer.consume_partition("events", 0, 0).await.is_ok());
    }
}
