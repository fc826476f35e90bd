//! # Kafkaesque Client
//! Rust-native client engine for Kafka/Redpanda protocol brokers.
//!
//! The crate speaks the Kafka wire protocol directly: pipelined broker
//! connections, a cluster metadata cache, partition consumers with
//! `ReadCommitted` filtering, and a batching producer with idempotent and
//! transactional delivery. Everything runs on [Tokio](https://tokio.rs/);
//! the wire format is parsed with [Nom](https://docs.rs/nom/latest/nom/).
//!
//! ## Getting started
//! ```toml
//! kafkaesque-client = "0.1"
//! ```
//!
//! ### Producing
//! ```rust,no_run
//! use kafkaesque_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let producer = SyncProducer::new(&["localhost:9092"], ClientConfig::default()).await?;
//!     let delivered = producer
//!         .send_message(ProducerMessage::new("events", "hello").with_key("user-1"))
//!         .await?;
//!     println!("written at {}/{:?}", delivered.partition.unwrap_or(-1), delivered.offset);
//!     producer.close().await
//! }
//! ```
//!
//! ### Consuming
//! ```rust,no_run
//! use kafkaesque_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let consumer = Consumer::new(&["localhost:9092"], ClientConfig::default()).await?;
//!     let mut partition = consumer.consume_partition("events", 0, OFFSET_OLDEST).await?;
//!     while let Some(message) = partition.recv().await {
//!         println!("{}: {:?}", message.offset, message.value);
//!     }
//!     partition.close().await?;
//!     consumer.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//! - [`network`]: framed, pipelined broker connections
//! - [`client`]: metadata cache, leader and coordinator lookup
//! - [`consumer`]: one fetch loop per partition
//! - [`producer`]: batching, partitioning, retries, idempotence and transactions
//! - [`codec`] and [`records`]: request/response bodies and record formats
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Confluence Docs](https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol)

#![forbid(unsafe_code)]

mod encode;
mod parser;

pub mod client;
pub mod codec;
pub mod compression;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod network;
pub mod producer;
pub mod protocol;
pub mod records;
pub mod retry;
pub mod telemetry;
pub mod types;
pub mod version;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

pub mod prelude {
    //! The types most applications need.
    //!
    //! ```rust,no_run
    //! use kafkaesque_client::prelude::*;
    //!
    //! let mut config = ClientConfig::default();
    //! config.version = KafkaVersion::V0_11_0_0;
    //! config.consumer.isolation_level = IsolationLevel::ReadCommitted;
    //! ```
    pub use crate::client::Client;
    pub use crate::compression::CompressionCodec;
    pub use crate::config::{ClientConfig, PartitionerKind};
    pub use crate::constants::{OFFSET_NEWEST, OFFSET_OLDEST};
    pub use crate::consumer::{Consumer, ConsumerMessage, ConsumerState, PartitionConsumer};
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::producer::{
        AsyncProducer, ProducerError, ProducerMessage, SyncProducer, TransactionStatus,
    };
    pub use crate::types::{
        BrokerId, IsolationLevel, ProducerEpoch, ProducerId, RecordHeader, RequiredAcks,
        TopicPartition,
    };
    pub use crate::version::KafkaVersion;

    pub use bytes;
}
