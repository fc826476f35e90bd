//! Centralized protocol and configuration constants.
//!
//! # Categories
//!
//! - **Protocol Constants**: Kafka wire protocol sizes, offsets and flags
//! - **Network Constants**: connection and frame limits
//! - **Client Defaults**: default values used by [`crate::config::ClientConfig`]

// =============================================================================
// Protocol Constants (Kafka Wire Protocol)
// =============================================================================

/// Sentinel offset: the next offset that will be written (high-water mark).
pub const OFFSET_NEWEST: i64 = -1;

/// Sentinel offset: the oldest offset still retained by the broker.
pub const OFFSET_OLDEST: i64 = -2;

/// Producer ID used by non-idempotent producers.
pub const NO_PRODUCER_ID: i64 = -1;

/// Producer epoch used by non-idempotent producers.
pub const NO_PRODUCER_EPOCH: i16 = -1;

/// Base sequence used by non-idempotent producers.
pub const NO_SEQUENCE: i32 = -1;

/// Size of a Kafka record batch (magic 2) header.
///
/// baseOffset (8) + batchLength (4) + partitionLeaderEpoch (4) + magic (1)
/// + crc (4) + attributes (2) + lastOffsetDelta (4) + baseTimestamp (8)
/// + maxTimestamp (8) + producerId (8) + producerEpoch (2) + baseSequence (4)
/// + recordCount (4) = 61 bytes
pub const MIN_BATCH_HEADER_SIZE: usize = 61;

// -----------------------------------------------------------------------------
// RecordBatch Header Field Offsets
// -----------------------------------------------------------------------------

/// Offset of the batch_length field (4 bytes, i32). Counts bytes after it.
pub const BATCH_LENGTH_OFFSET: usize = 8;

/// Bytes preceding the region counted by batch_length (base offset + length).
pub const BATCH_LOG_OVERHEAD: usize = 12;

/// Offset of the magic byte. Same position for legacy message sets.
pub const BATCH_MAGIC_OFFSET: usize = 16;

/// Offset of the CRC field (4 bytes, u32 big-endian).
pub const BATCH_CRC_OFFSET: usize = 17;

/// Start of the CRC-covered region (attributes field).
pub const BATCH_CRC_DATA_START: usize = 21;

// -----------------------------------------------------------------------------
// Record attributes
// -----------------------------------------------------------------------------

/// Bits 0-2 of the attributes carry the compression codec (all magics).
pub const COMPRESSION_CODEC_MASK: i16 = 0x07;

/// Magic 1 / v2: timestamp type (0 = create time, 1 = log append time).
pub const TIMESTAMP_TYPE_MASK: i16 = 0x08;

/// v2 batch attribute: batch belongs to a transaction.
pub const TRANSACTIONAL_FLAG_MASK: i16 = 0x10;

/// v2 batch attribute: batch holds control records (commit/abort markers).
pub const CONTROL_FLAG_MASK: i16 = 0x20;

/// Maximum allowed array size in Kafka protocol parsing.
///
/// This prevents memory exhaustion from malformed messages that claim
/// to have billions of elements.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

// =============================================================================
// Network Constants
// =============================================================================

/// Maximum size of a single response frame (100 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Replica id sent by ordinary consumers in Fetch/ListOffsets.
pub const CONSUMER_REPLICA_ID: i32 = -1;

// =============================================================================
// Client Defaults
// =============================================================================

/// Default client id sent in every request header.
pub const DEFAULT_CLIENT_ID: &str = "kafkaesque";

/// Default bounded channel capacity for consumer and producer queues.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 256;

/// Default in-flight request limit per broker connection.
pub const DEFAULT_MAX_OPEN_REQUESTS: usize = 5;

/// Default connect/read/write timeout.
pub const DEFAULT_NET_TIMEOUT_SECS: u64 = 30;

/// Idle time after which a broker connection is re-established on next use.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_METADATA_RETRY_MAX: usize = 3;
pub const DEFAULT_METADATA_RETRY_BACKOFF_MS: u64 = 250;
pub const DEFAULT_METADATA_REFRESH_SECS: u64 = 600;

/// Default per-partition fetch size (1 MiB).
pub const DEFAULT_FETCH_BYTES: i32 = 1024 * 1024;
pub const DEFAULT_FETCH_MAX_WAIT_MS: u64 = 250;
pub const DEFAULT_CONSUMER_RETRY_MAX: usize = 10;
pub const DEFAULT_CONSUMER_RETRY_BACKOFF_MS: u64 = 2_000;

/// Default maximum encoded size of one produced message (1 MB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;
pub const DEFAULT_PRODUCE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_PRODUCER_RETRY_MAX: usize = 3;
pub const DEFAULT_PRODUCER_RETRY_BACKOFF_MS: u64 = 100;
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 60_000;

/// Upper bound on the exponential backoff used by every retry policy.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 30;
