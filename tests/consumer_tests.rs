//! Partition consumer behavior against the in-process mock cluster.
//!
//! These tests bind loopback TCP listeners.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use kafkaesque_client::constants::{OFFSET_NEWEST, OFFSET_OLDEST};
use kafkaesque_client::consumer::{Consumer, ConsumerMessage, ConsumerState, PartitionConsumer};
use kafkaesque_client::codec::ApiKey;
use kafkaesque_client::error::Error;
use kafkaesque_client::mock::MockCluster;
use kafkaesque_client::prelude::*;
use kafkaesque_client::records::RecordData;

// ============================================================================
// Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.metadata.retry_backoff = Duration::from_millis(5);
    config.consumer.retry_backoff = Duration::from_millis(5);
    config.consumer.max_wait_time = Duration::from_millis(50);
    config.producer.retry.backoff = Duration::from_millis(5);
    config
}

fn transactional_config(id: &str) -> ClientConfig {
    let mut config = config();
    config.version = KafkaVersion::V0_11_0_0;
    config.producer.idempotent = true;
    config.producer.required_acks = RequiredAcks::WaitForAll;
    config.net.max_open_requests = 1;
    config.producer.transaction.id = Some(id.to_string());
    config
}

fn record(value: &str) -> RecordData {
    RecordData {
        value: Some(Bytes::from(value.to_string())),
        timestamp: 1_700_000_000_000,
        ..RecordData::default()
    }
}

async fn next(consumer: &mut PartitionConsumer) -> ConsumerMessage {
    timeout(WAIT, consumer.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("consumer stopped")
}

async fn assert_quiet(consumer: &mut PartitionConsumer) {
    let extra = timeout(Duration::from_millis(200), consumer.recv()).await;
    assert!(extra.is_err(), "unexpected message: {:?}", extra);
}

fn value(message: &ConsumerMessage) -> &[u8] {
    message.value.as_deref().unwrap_or_default()
}

// ============================================================================
// Offsets
// ============================================================================

#[tokio::test]
async fn test_reads_from_oldest_in_order() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    cluster
        .append("events", 0, vec![record("a"), record("b"), record("c")])
        .unwrap();

    let consumer = Consumer::new(&cluster.addrs(), config()).await.unwrap();
    let mut partition = consumer
        .consume_partition("events", 0, OFFSET_OLDEST)
        .await
        .unwrap();

    for (offset, expected) in ["a", "b", "c"].iter().enumerate() {
        let message = next(&mut partition).await;
        assert_eq!(message.offset, offset as i64);
        assert_eq!(value(&message), expected.as_bytes());
        assert_eq!(message.topic, "events");
        assert_eq!(message.partition, 0);
    }
    assert_eq!(partition.high_water_mark_offset(), 3);
    assert_eq!(partition.state(), ConsumerState::Fetching);

    partition.close().await.unwrap();
    assert_eq!(partition.state(), ConsumerState::Closed);
    consumer.close().await;
}

#[tokio::test]
async fn test_high_water_mark_after_k_messages() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    let k = 7;
    cluster
        .append(
            "events",
            0,
            (0..k).map(|i| record(&format!("m{}", i))).collect(),
        )
        .unwrap();

    let consumer = Consumer::new(&cluster.addrs(), config()).await.unwrap();
    let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();
    let mut last = -1;
    for _ in 0..k {
        last = next(&mut partition).await.offset;
    }
    assert_eq!(last, k - 1);
    assert_eq!(partition.high_water_mark_offset(), last + 1);
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_offsets_fail_before_fetching() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    cluster.append("events", 0, vec![record("a")]).unwrap();

    let consumer = Consumer::new(&cluster.addrs(), config()).await.unwrap();
    for offset in [-10, 2, i64::MAX] {
        let result = consumer.consume_partition("events", 0, offset).await;
        assert!(
            matches!(result, Err(Error::OffsetOutOfRange { offset: o, .. }) if o == offset),
            "offset {}: {:?}",
            offset,
            result.map(|_| ())
        );
    }
    assert_eq!(cluster.request_count(ApiKey::Fetch), 0);

    // the failed attempts do not hold the partition
    let mut partition = consumer.consume_partition("events", 0, 1).await.unwrap();
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_newest_waits_for_new_records() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    cluster.append("events", 0, vec![record("old")]).unwrap();

    let consumer = Consumer::new(&cluster.addrs(), config()).await.unwrap();
    let mut partition = consumer
        .consume_partition("events", 0, OFFSET_NEWEST)
        .await
        .unwrap();
    assert_quiet(&mut partition).await;

    cluster.append("events", 0, vec![record("new")]).unwrap();
    let message = next(&mut partition).await;
    assert_eq!(message.offset, 1);
    assert_eq!(value(&message), b"new");
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_partition_consumer_rejected() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 2);
    let consumer = Consumer::new(&cluster.addrs(), config()).await.unwrap();

    let mut first = consumer.consume_partition("events", 0, 0).await.unwrap();
    assert!(matches!(
        consumer.consume_partition("events", 0, 0).await,
        Err(Error::ConsumerAlreadyExists { partition: 0, .. })
    ));
    let mut other = consumer.consume_partition("events", 1, 0).await.unwrap();
    first.close().await.unwrap();
    other.close().await.unwrap();
}

// ============================================================================
// Fetch sizing
// ============================================================================

#[tokio::test]
async fn test_fetch_size_grows_for_large_records() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    let large = "x".repeat(4_096);
    cluster
        .append("events", 0, vec![record(&large), record("small")])
        .unwrap();

    let mut config = config();
    config.consumer.fetch_default = 64;
    let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
    let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();

    let first = next(&mut partition).await;
    assert_eq!(first.value.map(|v| v.len()), Some(4_096));
    assert_eq!(next(&mut partition).await.offset, 1);
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_record_above_fetch_max_is_reported() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    cluster
        .append("events", 0, vec![record(&"x".repeat(8_192))])
        .unwrap();

    let mut config = config();
    config.consumer.fetch_default = 256;
    config.consumer.fetch_max = 1_024;
    let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
    let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();

    let error = timeout(WAIT, partition.errors().recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, Error::MessageTooLarge { max: 1_024, .. }));
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_offset_out_of_range_mid_stream_stops_consumer() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    cluster.append("events", 0, vec![record("a")]).unwrap();

    let mut config = config();
    config.consumer.return_errors = true;
    let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
    let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();
    assert_eq!(value(&next(&mut partition).await), b"a");

    cluster.inject_error(ApiKey::Fetch, KafkaCode::OffsetOutOfRange);
    let error = timeout(WAIT, partition.errors().recv())
        .await
        .unwrap()
        .unwrap();
    assert!(
        matches!(error, Error::OffsetOutOfRange { partition: 0, offset: 1, .. }),
        "{:?}",
        error
    );

    // the loop is done, so the message channel closes
    assert!(timeout(WAIT, partition.recv()).await.unwrap().is_none());
    assert_eq!(partition.state(), ConsumerState::Closed);
    partition.close().await.unwrap();
    assert_eq!(partition.state(), ConsumerState::Closed);
}

#[tokio::test]
async fn test_close_lets_in_flight_fetch_finish() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 2);

    let mut config = config();
    config.consumer.max_wait_time = Duration::from_millis(300);
    let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
    let mut idle = consumer.consume_partition("events", 0, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.request_count(ApiKey::Fetch), 1);
    let connections = cluster.connection_count();

    idle.close().await.unwrap();
    assert_eq!(idle.state(), ConsumerState::Closed);

    // the shared broker connection survives the close
    cluster.append("events", 1, vec![record("after")]).unwrap();
    let mut partition = consumer.consume_partition("events", 1, 0).await.unwrap();
    assert_eq!(value(&next(&mut partition).await), b"after");
    assert_eq!(cluster.connection_count(), connections);
    partition.close().await.unwrap();
    consumer.close().await;
}

// ============================================================================
// Record formats
// ============================================================================

const MATRIX_VERSIONS: [KafkaVersion; 4] = [
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_10_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_1_0_0,
];

/// Produces "a", "b", "c" with `producer_config`, then reads them back with a
/// consumer at every version in the matrix.
async fn produce_and_read_everywhere(producer_config: ClientConfig) {
    let label = format!(
        "{} {}",
        producer_config.version, producer_config.producer.compression
    );
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);

    let producer = SyncProducer::new(&cluster.addrs(), producer_config)
        .await
        .unwrap();
    let delivered = producer
        .send_messages(
            ["a", "b", "c"]
                .iter()
                .map(|v| ProducerMessage::new("events", *v).with_key("k"))
                .collect(),
        )
        .await
        .unwrap();
    assert_eq!(delivered[2].offset, Some(2), "{}", label);
    producer.close().await.unwrap();

    for consumer_version in MATRIX_VERSIONS {
        let mut config = config();
        config.version = consumer_version;
        let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
        let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();
        for (offset, expected) in ["a", "b", "c"].iter().enumerate() {
            let message = next(&mut partition).await;
            assert_eq!(message.offset, offset as i64, "{} -> {}", label, consumer_version);
            assert_eq!(
                value(&message),
                expected.as_bytes(),
                "{} -> {}",
                label,
                consumer_version
            );
            assert_eq!(message.key, Some(Bytes::from_static(b"k")));
        }
        partition.close().await.unwrap();
        consumer.close().await;
    }
}

#[tokio::test]
async fn test_version_matrix() {
    for version in MATRIX_VERSIONS {
        for codec in CompressionCodec::ALL {
            if !version.supports_codec(codec) {
                continue;
            }
            let mut config = config();
            config.version = version;
            config.producer.compression = codec;
            produce_and_read_everywhere(config).await;
        }
    }
}

#[tokio::test]
async fn test_version_matrix_idempotent() {
    for version in MATRIX_VERSIONS {
        if !version.is_at_least(KafkaVersion::V0_11_0_0) {
            continue;
        }
        for codec in CompressionCodec::ALL {
            if !version.supports_codec(codec) {
                continue;
            }
            let mut config = config();
            config.version = version;
            config.producer.compression = codec;
            config.producer.idempotent = true;
            config.producer.required_acks = RequiredAcks::WaitForAll;
            config.net.max_open_requests = 1;
            produce_and_read_everywhere(config).await;
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Writes an aborted transaction ("a", "b") then a committed one ("c").
async fn write_aborted_then_committed(cluster: &MockCluster, id: &str) {
    let producer = SyncProducer::new(&cluster.addrs(), transactional_config(id))
        .await
        .unwrap();
    producer.begin_txn().await.unwrap();
    for v in ["a", "b"] {
        producer
            .send_message(ProducerMessage::new("events", v).with_partition(0))
            .await
            .unwrap();
    }
    producer.abort_txn().await.unwrap();

    producer.begin_txn().await.unwrap();
    producer
        .send_message(ProducerMessage::new("events", "c").with_partition(0))
        .await
        .unwrap();
    producer.commit_txn().await.unwrap();
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_read_committed_hides_aborted_records() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    write_aborted_then_committed(&cluster, "txn-visibility").await;

    let mut config = transactional_config("unused");
    config.producer.transaction.id = None;
    config.consumer.isolation_level = IsolationLevel::ReadCommitted;
    let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
    let mut partition = consumer
        .consume_partition("events", 0, OFFSET_OLDEST)
        .await
        .unwrap();

    let message = next(&mut partition).await;
    assert_eq!(value(&message), b"c");
    assert_eq!(message.offset, 3);
    assert_quiet(&mut partition).await;
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_read_uncommitted_sees_aborted_records() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    write_aborted_then_committed(&cluster, "txn-uncommitted").await;

    let consumer = Consumer::new(&cluster.addrs(), config()).await.unwrap();
    let mut partition = consumer
        .consume_partition("events", 0, OFFSET_OLDEST)
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let message = next(&mut partition).await;
        seen.push((message.offset, value(&message).to_vec()));
    }
    assert_eq!(
        seen,
        vec![(0, b"a".to_vec()), (1, b"b".to_vec()), (3, b"c".to_vec())]
    );
    assert_quiet(&mut partition).await;
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_read_committed_resumes_after_restart() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    write_aborted_then_committed(&cluster, "txn-restart").await;

    let mut config = transactional_config("unused");
    config.producer.transaction.id = None;
    config.consumer.isolation_level = IsolationLevel::ReadCommitted;

    let consumer = Consumer::new(&cluster.addrs(), config.clone()).await.unwrap();
    let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();
    assert_eq!(next(&mut partition).await.offset, 3);
    partition.close().await.unwrap();
    consumer.close().await;

    // another aborted transaction ("x", "y") followed by a committed "d"
    let first_aborted = cluster.high_watermark("events", 0).unwrap();
    let producer = SyncProducer::new(&cluster.addrs(), transactional_config("txn-restart"))
        .await
        .unwrap();
    producer.begin_txn().await.unwrap();
    for v in ["x", "y"] {
        producer
            .send_message(ProducerMessage::new("events", v).with_partition(0))
            .await
            .unwrap();
    }
    producer.abort_txn().await.unwrap();
    producer.begin_txn().await.unwrap();
    producer
        .send_message(ProducerMessage::new("events", "d").with_partition(0))
        .await
        .unwrap();
    producer.commit_txn().await.unwrap();
    producer.close().await.unwrap();

    // restarting inside an aborted range skips it
    let consumer = Consumer::new(&cluster.addrs(), config.clone()).await.unwrap();
    let mut partition = consumer
        .consume_partition("events", 0, first_aborted)
        .await
        .unwrap();
    let message = next(&mut partition).await;
    assert_eq!(value(&message), b"d");
    assert_eq!(message.offset, first_aborted + 3);
    assert_quiet(&mut partition).await;
    partition.close().await.unwrap();
    consumer.close().await;

    // and so does restarting at the very first aborted record
    let consumer = Consumer::new(&cluster.addrs(), config).await.unwrap();
    let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..2 {
        let message = next(&mut partition).await;
        seen.push((message.offset, value(&message).to_vec()));
    }
    assert_eq!(
        seen,
        vec![(3, b"c".to_vec()), (first_aborted + 3, b"d".to_vec())]
    );
    assert_quiet(&mut partition).await;
    partition.close().await.unwrap();
}

#[tokio::test]
async fn test_leader_change_is_retried() {
    let cluster = MockCluster::start(1).await.unwrap();
    cluster.create_topic("events", 1);
    cluster.append("events", 0, vec![record("a")]).unwrap();
    cluster.inject_error(ApiKey::Fetch, KafkaCode::NotLeaderForPartition);

    let consumer = Consumer::new(&cluster.addrs(), config()).await.unwrap();
    let mut partition = consumer.consume_partition("events", 0, 0).await.unwrap();
    assert_eq!(value(&next(&mut partition).await), b"a");
    assert!(cluster.request_count(ApiKey::Fetch) >= 2);
    partition.close().await.unwrap();
}
