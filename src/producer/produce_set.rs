//! Accumulates messages bound for one broker until a flush trigger fires,
//! then turns them into a single `ProduceRequest`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

use super::txn::ProducerSession;
use super::{Envelope, ProducerMessage};
use crate::codec::{ProducePartitionData, ProduceRequest, ProduceTopicData};
use crate::config::ClientConfig;
use crate::constants::{NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE};
use crate::error::{Error, Result};
use crate::records::{BatchMeta, RecordData, encode_records, estimated_record_size};
use crate::types::TopicPartition;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Encoded size of `message` in the record format of `config.version`,
/// rejecting messages above `producer.max_message_bytes`.
pub fn check_message_size(config: &ClientConfig, message: &ProducerMessage) -> Result<usize> {
    let size = estimated_record_size(
        config.version.record_magic(),
        message.key.as_ref(),
        message.value.as_ref(),
        &message.headers,
    );
    if size > config.producer.max_message_bytes {
        return Err(Error::MessageTooLarge {
            size,
            max: config.producer.max_message_bytes,
        });
    }
    Ok(size)
}

/// Messages for one partition.
#[derive(Debug, Default)]
pub(crate) struct PartitionSet {
    pub(crate) messages: Vec<Envelope>,
    pub(crate) bytes: usize,
    /// Assigned once, on the first send, and kept across retries.
    pub(crate) base_sequence: Option<i32>,
}

impl PartitionSet {
    fn records(&self) -> Vec<RecordData> {
        self.messages
            .iter()
            .map(|e| RecordData {
                key: e.message.key.clone(),
                value: e.message.value.clone(),
                headers: e.message.headers.clone(),
                timestamp: e.message.timestamp.unwrap_or_else(now_ms),
            })
            .collect()
    }
}

/// Pending messages grouped by topic and partition.
#[derive(Debug)]
pub struct ProduceSet {
    config: Arc<ClientConfig>,
    magic: i8,
    topics: BTreeMap<String, BTreeMap<i32, PartitionSet>>,
    /// Identity the assigned sequences belong to.
    session: Option<ProducerSession>,
    bytes: usize,
    messages: usize,
    oldest: Option<Instant>,
}

impl ProduceSet {
    pub fn new(config: Arc<ClientConfig>) -> ProduceSet {
        let magic = config.version.record_magic();
        ProduceSet {
            config,
            magic,
            topics: BTreeMap::new(),
            session: None,
            bytes: 0,
            messages: 0,
            oldest: None,
        }
    }

    /// Adds a message whose partition has already been chosen.
    pub fn add(&mut self, message: ProducerMessage) -> Result<()> {
        let size = check_message_size(&self.config, &message)?;
        self.push(Envelope::detached(message), size)
    }

    pub(crate) fn push(&mut self, envelope: Envelope, size: usize) -> Result<()> {
        let partition = envelope.message.partition.ok_or_else(|| {
            Error::Config(format!(
                "message for {} reached the produce set without a partition",
                envelope.message.topic
            ))
        })?;
        let set = self
            .topics
            .entry(envelope.message.topic.clone())
            .or_default()
            .entry(partition)
            .or_default();
        set.messages.push(envelope);
        set.bytes += size;

        self.bytes += size;
        self.messages += 1;
        self.oldest.get_or_insert_with(Instant::now);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    pub fn len(&self) -> usize {
        self.messages
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    /// Whether adding a message of `size` bytes for `tp` would push the set
    /// past `flush.max_messages` or the partition past
    /// `producer.max_message_bytes`. The set must be flushed first.
    pub fn would_overflow(&self, tp: &TopicPartition, size: usize) -> bool {
        let flush = &self.config.producer.flush;
        if flush.max_messages > 0 && self.messages >= flush.max_messages {
            return true;
        }
        let partition_bytes = self
            .topics
            .get(&tp.topic)
            .and_then(|t| t.get(&tp.partition))
            .map_or(0, |p| p.bytes);
        partition_bytes > 0 && partition_bytes + size > self.config.producer.max_message_bytes
    }

    /// Whether a flush trigger has fired. With every trigger disabled the
    /// set flushes as soon as it holds a message.
    pub fn ready_to_flush(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        let flush = &self.config.producer.flush;
        if flush.bytes == 0 && flush.messages == 0 && flush.frequency.is_zero() {
            return true;
        }
        (flush.messages > 0 && self.messages >= flush.messages)
            || (flush.bytes > 0 && self.bytes >= flush.bytes)
            || self.flush_deadline().is_some_and(|d| d <= Instant::now())
    }

    /// When `flush.frequency` expires for the oldest pending message.
    pub fn flush_deadline(&self) -> Option<Instant> {
        let frequency = self.config.producer.flush.frequency;
        if frequency.is_zero() {
            return None;
        }
        self.oldest.map(|oldest| oldest + frequency)
    }

    pub fn partitions(&self) -> Vec<TopicPartition> {
        self.topics
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions.keys().map(move |&p| TopicPartition::new(topic, p))
            })
            .collect()
    }

    pub(crate) fn session(&self) -> Option<&ProducerSession> {
        self.session.as_ref()
    }

    pub(crate) fn set_session(&mut self, session: ProducerSession) {
        self.session = Some(session);
    }

    /// Partitions still waiting for a base sequence, with their message count.
    pub(crate) fn unsequenced(&self) -> Vec<(TopicPartition, i32)> {
        self.topics
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .iter()
                    .filter(|(_, set)| set.base_sequence.is_none())
                    .map(move |(&p, set)| (TopicPartition::new(topic, p), set.messages.len() as i32))
            })
            .collect()
    }

    pub(crate) fn set_base_sequence(&mut self, tp: &TopicPartition, sequence: i32) {
        if let Some(set) = self
            .topics
            .get_mut(&tp.topic)
            .and_then(|t| t.get_mut(&tp.partition))
        {
            set.base_sequence = Some(sequence);
        }
    }

    /// Removes every partition, leaving the set empty.
    pub(crate) fn drain(&mut self) -> Vec<(TopicPartition, PartitionSet)> {
        self.bytes = 0;
        self.messages = 0;
        self.oldest = None;
        std::mem::take(&mut self.topics)
            .into_iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .into_iter()
                    .map(move |(p, set)| (TopicPartition::new(&topic, p), set))
            })
            .collect()
    }

    /// Puts a partition back, e.g. for a retry. Its sequence is kept.
    ///
    /// Restoring onto a partition that already holds messages appends to it.
    /// The merged batch keeps the existing base sequence only when the
    /// restored one continues it; otherwise it is sequenced again on send.
    pub(crate) fn restore(&mut self, tp: TopicPartition, set: PartitionSet) {
        self.bytes += set.bytes;
        self.messages += set.messages.len();
        self.oldest.get_or_insert_with(Instant::now);

        let existing = self
            .topics
            .entry(tp.topic)
            .or_default()
            .entry(tp.partition)
            .or_default();
        if existing.messages.is_empty() {
            *existing = set;
            return;
        }
        existing.base_sequence = match (existing.base_sequence, set.base_sequence) {
            (Some(base), Some(next)) if base.wrapping_add(existing.messages.len() as i32) == next => {
                Some(base)
            }
            _ => None,
        };
        existing.messages.extend(set.messages);
        existing.bytes += set.bytes;
    }

    /// Encodes every partition into one request. Each partition's batch is
    /// compressed on its own.
    pub fn build_request(&self) -> Result<ProduceRequest> {
        let producer = &self.config.producer;
        let codec = producer.compression;
        if !self.config.version.supports_codec(codec) {
            return Err(Error::UnsupportedCompression(format!(
                "{} requires version >= {}, configured {}",
                codec,
                codec.min_version(),
                self.config.version
            )));
        }

        let (producer_id, producer_epoch, transactional_id) = match &self.session {
            Some(s) => (
                s.producer_id.value(),
                s.producer_epoch.value(),
                s.transactional_id.clone(),
            ),
            None => (NO_PRODUCER_ID, NO_PRODUCER_EPOCH, None),
        };

        let mut topics = Vec::with_capacity(self.topics.len());
        for (topic, partitions) in &self.topics {
            let mut data = Vec::with_capacity(partitions.len());
            for (&partition, set) in partitions {
                let meta = BatchMeta {
                    codec,
                    producer_id,
                    producer_epoch,
                    base_sequence: set.base_sequence.unwrap_or(NO_SEQUENCE),
                    transactional: transactional_id.is_some(),
                    ..BatchMeta::default()
                };
                let records = encode_records(self.magic, &meta, producer.compression_level, &set.records())?;
                data.push(ProducePartitionData {
                    partition_index: partition,
                    records,
                });
            }
            topics.push(ProduceTopicData {
                name: topic.clone(),
                partitions: data,
            });
        }

        Ok(ProduceRequest {
            transactional_id,
            acks: producer.required_acks.as_i16(),
            timeout_ms: i32::try_from(producer.timeout.as_millis()).unwrap_or(i32::MAX),
            topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionCodec;
    use crate::records::decode_records;
    use crate::types::{ProducerEpoch, ProducerId};
    use crate::version::KafkaVersion;
    use bytes::Bytes;
    use std::time::Duration;

    fn message(partition: i32, value: &'static str) -> ProducerMessage {
        ProducerMessage::new("events", Bytes::from_static(value.as_bytes()))
            .with_partition(partition)
            .with_timestamp(1_700_000_000_000)
    }

    fn set_with(configure: impl FnOnce(&mut ClientConfig)) -> ProduceSet {
        let mut config = ClientConfig::default();
        configure(&mut config);
        ProduceSet::new(Arc::new(config))
    }

    #[test]
    fn test_add_rejects_oversized_message() {
        let mut set = set_with(|c| c.producer.max_message_bytes = 100);
        let big = ProducerMessage::new("events", Bytes::from(vec![0u8; 200])).with_partition(0);
        assert!(matches!(
            set.add(big),
            Err(Error::MessageTooLarge { max: 100, .. })
        ));
        assert!(set.is_empty());
    }

    #[test]
    fn test_flushes_immediately_without_triggers() {
        let mut set = set_with(|_| {});
        assert!(!set.ready_to_flush());
        set.add(message(0, "a")).unwrap();
        assert!(set.ready_to_flush());
    }

    #[test]
    fn test_message_trigger() {
        let mut set = set_with(|c| {
            c.producer.flush.messages = 3;
            c.producer.flush.frequency = Duration::from_secs(60);
        });
        set.add(message(0, "a")).unwrap();
        set.add(message(1, "b")).unwrap();
        assert!(!set.ready_to_flush());
        set.add(message(0, "c")).unwrap();
        assert!(set.ready_to_flush());
        assert_eq!(set.len(), 3);
        assert_eq!(set.partitions().len(), 2);
    }

    #[test]
    fn test_byte_trigger() {
        let mut set = set_with(|c| {
            c.producer.flush.bytes = 64;
            c.producer.flush.frequency = Duration::from_secs(60);
        });
        set.add(message(0, "small")).unwrap();
        assert!(!set.ready_to_flush());
        set.add(
            ProducerMessage::new("events", Bytes::from(vec![1u8; 64])).with_partition(0),
        )
        .unwrap();
        assert!(set.ready_to_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frequency_trigger() {
        let mut set = set_with(|c| {
            c.producer.flush.messages = 100;
            c.producer.flush.frequency = Duration::from_millis(50);
        });
        assert!(set.flush_deadline().is_none());
        set.add(message(0, "a")).unwrap();
        assert!(!set.ready_to_flush());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(set.ready_to_flush());
    }

    #[test]
    fn test_would_overflow() {
        let mut set = set_with(|c| c.producer.flush.max_messages = 2);
        let tp = TopicPartition::new("events", 0);
        set.add(message(0, "a")).unwrap();
        assert!(!set.would_overflow(&tp, 10));
        set.add(message(0, "b")).unwrap();
        assert!(set.would_overflow(&tp, 10));

        let mut set = set_with(|c| c.producer.max_message_bytes = 200);
        set.add(ProducerMessage::new("events", Bytes::from(vec![0u8; 100])).with_partition(0))
            .unwrap();
        assert!(set.would_overflow(&tp, 150));
        assert!(!set.would_overflow(&TopicPartition::new("events", 1), 150));
    }

    #[test]
    fn test_build_request_per_version() {
        for (version, magic) in [
            (KafkaVersion::V0_8_2_0, 0),
            (KafkaVersion::V0_10_0_0, 1),
            (KafkaVersion::V0_11_0_0, 2),
        ] {
            let mut set = set_with(|c| {
                c.version = version;
                c.producer.compression = CompressionCodec::Gzip;
            });
            set.add(message(0, "a")).unwrap();
            set.add(message(0, "b")).unwrap();
            set.add(message(2, "c")).unwrap();

            let request = set.build_request().unwrap();
            assert_eq!(request.topics.len(), 1);
            let partitions = &request.topics[0].partitions;
            assert_eq!(partitions.len(), 2);

            let decoded = decode_records(partitions[0].records.clone()).unwrap();
            assert_eq!(decoded.batches.len(), 1, "{}", version);
            assert_eq!(decoded.batches[0].magic, magic);
            assert_eq!(decoded.batches[0].codec, CompressionCodec::Gzip);
            let values: Vec<_> = decoded.batches[0]
                .records
                .iter()
                .map(|r| r.value.clone().unwrap())
                .collect();
            assert_eq!(values, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        }
    }

    #[test]
    fn test_build_request_rejects_codec_above_version() {
        let mut set = set_with(|c| {
            c.version = KafkaVersion::V0_10_0_0;
            c.producer.compression = CompressionCodec::Zstd;
        });
        set.add(message(0, "a")).unwrap();
        assert!(matches!(
            set.build_request(),
            Err(Error::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn test_sequences_and_session_are_encoded() {
        let mut set = set_with(|c| c.version = KafkaVersion::V0_11_0_0);
        set.add(message(0, "a")).unwrap();
        set.add(message(0, "b")).unwrap();
        set.set_session(ProducerSession {
            producer_id: ProducerId::new(9),
            producer_epoch: ProducerEpoch::new(2),
            transactional_id: Some("txn".to_string()),
        });
        let tp = TopicPartition::new("events", 0);
        assert_eq!(set.unsequenced(), vec![(tp.clone(), 2)]);
        set.set_base_sequence(&tp, 4);
        assert!(set.unsequenced().is_empty());

        let request = set.build_request().unwrap();
        assert_eq!(request.transactional_id.as_deref(), Some("txn"));
        let batch = &decode_records(request.topics[0].partitions[0].records.clone())
            .unwrap()
            .batches[0];
        assert_eq!(batch.producer_id, 9);
        assert_eq!(batch.producer_epoch, 2);
        assert_eq!(batch.base_sequence, 4);
        assert!(batch.transactional);
    }

    #[test]
    fn test_restore_merges_into_existing_partition() {
        let mut set = set_with(|_| {});
        set.add(message(0, "a")).unwrap();
        set.add(message(0, "b")).unwrap();
        let tp = TopicPartition::new("events", 0);
        set.set_base_sequence(&tp, 3);
        let (_, first) = set.drain().remove(0);

        set.add(message(0, "c")).unwrap();
        set.set_base_sequence(&tp, 5);
        let (_, second) = set.drain().remove(0);

        set.restore(tp.clone(), first);
        set.restore(tp.clone(), second);
        assert_eq!(set.len(), 3);
        assert!(set.unsequenced().is_empty());

        let request = set.build_request().unwrap();
        let batch = &decode_records(request.topics[0].partitions[0].records.clone())
            .unwrap()
            .batches[0];
        let values: Vec<_> = batch.records.iter().map(|r| r.value.clone().unwrap()).collect();
        assert_eq!(
            values,
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")]
        );
    }

    #[test]
    fn test_restore_resequences_non_contiguous_merge() {
        let mut set = set_with(|_| {});
        let tp = TopicPartition::new("events", 0);
        set.add(message(0, "a")).unwrap();
        set.set_base_sequence(&tp, 0);
        let (_, first) = set.drain().remove(0);
        set.add(message(0, "b")).unwrap();
        set.set_base_sequence(&tp, 9);
        let (_, second) = set.drain().remove(0);

        set.restore(tp.clone(), first);
        set.restore(tp.clone(), second);
        assert_eq!(set.unsequenced(), vec![(tp, 2)]);
    }

    #[test]
    fn test_drain_and_restore_keep_sequence() {
        let mut set = set_with(|_| {});
        set.add(message(1, "a")).unwrap();
        let tp = TopicPartition::new("events", 1);
        set.set_base_sequence(&tp, 7);

        let mut drained = set.drain();
        assert!(set.is_empty());
        let (tp, partition) = drained.remove(0);
        set.restore(tp, partition);
        assert_eq!(set.len(), 1);
        assert!(set.unsequenced().is_empty());
    }
}
