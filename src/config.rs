//! Client configuration.
//!
//! One [`ClientConfig`] drives the transport, the metadata cache, consumers and
//! producers. Settings are grouped the way they are used:
//!
//! | Group | Used by |
//! |-------|---------|
//! | `net` | `network::Connection`, `network::Broker` |
//! | `metadata` | `client::Client` |
//! | `consumer` | `consumer::Consumer` |
//! | `producer` | `producer::AsyncProducer`, `producer::SyncProducer` |
//!
//! ```rust,no_run
//! use kafkaesque_client::config::ClientConfig;
//! use kafkaesque_client::version::KafkaVersion;
//!
//! let mut config = ClientConfig::default();
//! config.version = KafkaVersion::V2_1_0_0;
//! config.producer.idempotent = true;
//! config.net.max_open_requests = 1;
//! config.validate().expect("valid config");
//! ```

use std::time::Duration;

use crate::compression::{CompressionCodec, DEFAULT_COMPRESSION_LEVEL};
use crate::constants::{
    DEFAULT_CHANNEL_BUFFER_SIZE, DEFAULT_CLIENT_ID, DEFAULT_CONSUMER_RETRY_BACKOFF_MS,
    DEFAULT_CONSUMER_RETRY_MAX, DEFAULT_FETCH_BYTES, DEFAULT_FETCH_MAX_WAIT_MS,
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_OPEN_REQUESTS,
    DEFAULT_METADATA_REFRESH_SECS, DEFAULT_METADATA_RETRY_BACKOFF_MS, DEFAULT_METADATA_RETRY_MAX,
    DEFAULT_NET_TIMEOUT_SECS, DEFAULT_PRODUCE_TIMEOUT_MS, DEFAULT_PRODUCER_RETRY_BACKOFF_MS,
    DEFAULT_PRODUCER_RETRY_MAX, DEFAULT_TRANSACTION_TIMEOUT_MS,
};
use crate::error::{Error, Result};
use crate::types::{IsolationLevel, RequiredAcks};
use crate::version::KafkaVersion;

/// Transport settings.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// In-flight requests allowed per connection.
    pub max_open_requests: usize,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// A connection unused for this long is replaced before the next request.
    pub idle_timeout: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        NetConfig {
            max_open_requests: DEFAULT_MAX_OPEN_REQUESTS,
            dial_timeout: Duration::from_secs(DEFAULT_NET_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_NET_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_NET_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub retry_max: usize,
    pub retry_backoff: Duration,
    /// Background refresh period; zero disables the refresh task.
    pub refresh_frequency: Duration,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        MetadataConfig {
            retry_max: DEFAULT_METADATA_RETRY_MAX,
            retry_backoff: Duration::from_millis(DEFAULT_METADATA_RETRY_BACKOFF_MS),
            refresh_frequency: Duration::from_secs(DEFAULT_METADATA_REFRESH_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub fetch_min: i32,
    /// Initial per-partition fetch size; doubled when a single batch does not fit.
    pub fetch_default: i32,
    /// Upper bound for the doubled fetch size; 0 means unlimited.
    pub fetch_max: i32,
    pub max_wait_time: Duration,
    pub isolation_level: IsolationLevel,
    pub retry_max: usize,
    pub retry_backoff: Duration,
    /// Deliver errors on the error channel instead of only logging them.
    pub return_errors: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            fetch_min: 1,
            fetch_default: DEFAULT_FETCH_BYTES,
            fetch_max: 0,
            max_wait_time: Duration::from_millis(DEFAULT_FETCH_MAX_WAIT_MS),
            isolation_level: IsolationLevel::ReadUncommitted,
            retry_max: DEFAULT_CONSUMER_RETRY_MAX,
            retry_backoff: Duration::from_millis(DEFAULT_CONSUMER_RETRY_BACKOFF_MS),
            return_errors: true,
        }
    }
}

/// Which partitioner a producer builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionerKind {
    /// murmur2 of the key; round-robin for keyless messages.
    #[default]
    Hash,
    RoundRobin,
    /// Use the partition set on each message.
    Manual,
}

impl std::str::FromStr for PartitionerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hash" => Ok(PartitionerKind::Hash),
            "roundrobin" | "round_robin" | "round-robin" => Ok(PartitionerKind::RoundRobin),
            "manual" => Ok(PartitionerKind::Manual),
            other => Err(Error::Config(format!("unknown partitioner '{}'", other))),
        }
    }
}

/// Batching thresholds. A zero value disables that trigger.
#[derive(Debug, Clone, Default)]
pub struct FlushConfig {
    pub bytes: usize,
    pub messages: usize,
    pub frequency: Duration,
    /// Hard cap on messages per request; 0 means unlimited.
    pub max_messages: usize,
}

#[derive(Debug, Clone)]
pub struct ProducerRetryConfig {
    pub max: usize,
    pub backoff: Duration,
}

impl Default for ProducerRetryConfig {
    fn default() -> Self {
        ProducerRetryConfig {
            max: DEFAULT_PRODUCER_RETRY_MAX,
            backoff: Duration::from_millis(DEFAULT_PRODUCER_RETRY_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Setting an id makes the producer transactional.
    pub id: Option<String>,
    pub timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            id: None,
            timeout: Duration::from_millis(DEFAULT_TRANSACTION_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub max_message_bytes: usize,
    pub required_acks: RequiredAcks,
    pub timeout: Duration,
    pub compression: CompressionCodec,
    pub compression_level: i32,
    pub partitioner: PartitionerKind,
    pub idempotent: bool,
    pub flush: FlushConfig,
    pub retry: ProducerRetryConfig,
    pub return_successes: bool,
    pub return_errors: bool,
    pub transaction: TransactionConfig,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            required_acks: RequiredAcks::WaitForLocal,
            timeout: Duration::from_millis(DEFAULT_PRODUCE_TIMEOUT_MS),
            compression: CompressionCodec::None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            partitioner: PartitionerKind::Hash,
            idempotent: false,
            flush: FlushConfig::default(),
            retry: ProducerRetryConfig::default(),
            return_successes: false,
            return_errors: true,
            transaction: TransactionConfig::default(),
        }
    }
}

impl ProducerConfig {
    pub fn is_transactional(&self) -> bool {
        self.transaction.id.is_some()
    }
}

/// Configuration shared by every component of the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    /// Minimum cluster version assumed; selects request versions and formats.
    pub version: KafkaVersion,
    pub channel_buffer_size: usize,
    pub net: NetConfig,
    pub metadata: MetadataConfig,
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            version: KafkaVersion::default(),
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            net: NetConfig::default(),
            metadata: MetadataConfig::default(),
            consumer: ConsumerConfig::default(),
            producer: ProducerConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let version = self.version;

        if self.client_id.is_empty() {
            errors.push("client_id must not be empty".to_string());
        }
        if self.channel_buffer_size == 0 {
            errors.push("channel_buffer_size must be at least 1".to_string());
        }

        // Transport
        if self.net.max_open_requests == 0 {
            errors.push("net.max_open_requests must be at least 1".to_string());
        }
        for (name, value) in [
            ("net.dial_timeout", self.net.dial_timeout),
            ("net.read_timeout", self.net.read_timeout),
            ("net.write_timeout", self.net.write_timeout),
        ] {
            if value.is_zero() {
                errors.push(format!("{} must be greater than 0", name));
            }
        }

        // Consumer
        if self.consumer.fetch_min <= 0 {
            errors.push(format!(
                "consumer.fetch_min ({}) must be positive",
                self.consumer.fetch_min
            ));
        }
        if self.consumer.fetch_default <= 0 {
            errors.push(format!(
                "consumer.fetch_default ({}) must be positive",
                self.consumer.fetch_default
            ));
        }
        if self.consumer.fetch_max < 0 {
            errors.push(format!(
                "consumer.fetch_max ({}) must not be negative",
                self.consumer.fetch_max
            ));
        }
        if self.consumer.fetch_max > 0 && self.consumer.fetch_max < self.consumer.fetch_default {
            errors.push(format!(
                "consumer.fetch_max ({}) must not be below consumer.fetch_default ({})",
                self.consumer.fetch_max, self.consumer.fetch_default
            ));
        }
        if self.consumer.isolation_level == IsolationLevel::ReadCommitted
            && !version.is_at_least(KafkaVersion::V0_11_0_0)
        {
            errors.push(format!(
                "ReadCommitted isolation requires version >= 0.11.0.0, configured {}",
                version
            ));
        }

        // Producer
        let producer = &self.producer;
        if producer.max_message_bytes == 0 {
            errors.push("producer.max_message_bytes must be at least 1".to_string());
        }
        if producer.timeout.is_zero() {
            errors.push("producer.timeout must be greater than 0".to_string());
        }
        if !version.is_at_least(producer.compression.min_version()) {
            errors.push(format!(
                "{} compression requires version >= {}, configured {}",
                producer.compression,
                producer.compression.min_version(),
                version
            ));
        }
        if producer.flush.max_messages > 0 && producer.flush.messages > producer.flush.max_messages
        {
            errors.push(format!(
                "producer.flush.messages ({}) must not exceed producer.flush.max_messages ({})",
                producer.flush.messages, producer.flush.max_messages
            ));
        }
        if producer.idempotent {
            if !version.supports_idempotence() {
                errors.push(format!(
                    "idempotent producer requires version >= 0.11.0.0, configured {}",
                    version
                ));
            }
            if producer.required_acks != RequiredAcks::WaitForAll {
                errors.push("idempotent producer requires required_acks = WaitForAll".to_string());
            }
            if self.net.max_open_requests > 1 {
                errors.push(format!(
                    "idempotent producer requires net.max_open_requests = 1, configured {}",
                    self.net.max_open_requests
                ));
            }
            if producer.retry.max == 0 {
                errors.push("idempotent producer requires producer.retry.max >= 1".to_string());
            }
        }
        if let Some(id) = &producer.transaction.id {
            if id.is_empty() {
                errors.push("producer.transaction.id must not be empty".to_string());
            }
            if !producer.idempotent {
                errors.push("transactional producer requires producer.idempotent".to_string());
            }
            if producer.transaction.timeout.is_zero() {
                errors.push("producer.transaction.timeout must be greater than 0".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validates and converts the collected problems into one `Error::Config`.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| Error::Config(errors.join("; ")))
    }

    /// Create configuration from environment variables, starting from defaults.
    ///
    /// - `KAFKA_VERSION`: e.g. `2.1.0` or `0.10.2.0`
    /// - `KAFKA_CLIENT_ID`
    /// - `KAFKA_COMPRESSION`: `none`, `gzip`, `snappy`, `lz4` or `zstd`
    /// - `KAFKA_ISOLATION_LEVEL`: `read_uncommitted` or `read_committed`
    /// - `KAFKA_MAX_OPEN_REQUESTS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(version) = std::env::var("KAFKA_VERSION") {
            config.version = version.parse()?;
        }
        if let Ok(client_id) = std::env::var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(codec) = std::env::var("KAFKA_COMPRESSION") {
            config.producer.compression = codec.parse()?;
        }
        if let Ok(level) = std::env::var("KAFKA_ISOLATION_LEVEL") {
            config.consumer.isolation_level = level.parse().map_err(Error::Config)?;
        }
        if let Ok(max) = std::env::var("KAFKA_MAX_OPEN_REQUESTS") {
            config.net.max_open_requests = max
                .parse()
                .map_err(|e| Error::Config(format!("Invalid KAFKA_MAX_OPEN_REQUESTS: {}", e)))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idempotent_config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.version = KafkaVersion::V0_11_0_0;
        config.producer.idempotent = true;
        config.producer.required_acks = RequiredAcks::WaitForAll;
        config.net.max_open_requests = 1;
        config
    }

    #[test]
    fn test_validate_default_config_succeeds() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_codec_version_gates() {
        let mut config = ClientConfig::default();
        config.version = KafkaVersion::V0_9_0_0;
        config.producer.compression = CompressionCodec::Lz4;
        assert!(config.validate().is_err());

        config.version = KafkaVersion::V0_10_0_0;
        assert!(config.validate().is_ok());

        config.producer.compression = CompressionCodec::Zstd;
        assert!(config.validate().is_err());
        config.version = KafkaVersion::V2_1_0_0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_idempotence_prerequisites() {
        assert!(idempotent_config().validate().is_ok());

        let mut config = idempotent_config();
        config.net.max_open_requests = 5;
        config.producer.required_acks = RequiredAcks::WaitForLocal;
        config.version = KafkaVersion::V0_10_2_0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn test_validate_transaction_requires_idempotence() {
        let mut config = ClientConfig::default();
        config.producer.transaction.id = Some("txn".to_string());
        assert!(config.validate().is_err());

        let mut config = idempotent_config();
        config.producer.transaction.id = Some("txn".to_string());
        assert!(config.validate().is_ok());
        assert!(config.producer.is_transactional());
    }

    #[test]
    fn test_validate_read_committed_gate() {
        let mut config = ClientConfig::default();
        config.consumer.isolation_level = IsolationLevel::ReadCommitted;
        config.version = KafkaVersion::V0_10_2_0;
        assert!(config.validate().is_err());
        config.version = KafkaVersion::V0_11_0_0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = ClientConfig::default();
        config.client_id.clear();
        config.channel_buffer_size = 0;
        config.net.max_open_requests = 0;
        config.consumer.fetch_default = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(matches!(config.check(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partitioner_kind_parse() {
        assert_eq!(
            "round-robin".parse::<PartitionerKind>().unwrap(),
            PartitionerKind::RoundRobin
        );
        assert!("random".parse::<PartitionerKind>().is_err());
    }
}
