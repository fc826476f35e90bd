//! Partition selection for produced messages.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use murmur2::{KAFKA_SEED, murmur2};

use super::ProducerMessage;
use crate::config::PartitionerKind;
use crate::error::{Error, KafkaCode, Result};

/// Chooses the partition of a message among `partitions` partitions
/// (numbered `0..partitions`).
pub trait Partitioner: Send + Sync + Debug {
    fn partition(&self, message: &ProducerMessage, partitions: i32) -> Result<i32>;
}

/// Builds the partitioner configured by `kind`.
pub fn from_kind(kind: PartitionerKind) -> Arc<dyn Partitioner> {
    match kind {
        PartitionerKind::Hash => Arc::new(HashPartitioner::default()),
        PartitionerKind::RoundRobin => Arc::new(RoundRobinPartitioner::default()),
        PartitionerKind::Manual => Arc::new(ManualPartitioner),
    }
}

fn check_partitions(partitions: i32) -> Result<()> {
    if partitions <= 0 {
        return Err(Error::Kafka(KafkaCode::LeaderNotAvailable));
    }
    Ok(())
}

/// Kafka's default partitioner: `toPositive(murmur2(key)) % partitions`.
/// Keyless messages are spread round-robin.
#[derive(Debug, Default)]
pub struct HashPartitioner {
    fallback: RoundRobinPartitioner,
}

impl HashPartitioner {
    pub fn hash(key: &[u8], partitions: i32) -> i32 {
        ((murmur2(key, KAFKA_SEED) & 0x7fff_ffff) as i32) % partitions
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, message: &ProducerMessage, partitions: i32) -> Result<i32> {
        check_partitions(partitions)?;
        match &message.key {
            Some(key) => Ok(Self::hash(key, partitions)),
            None => self.fallback.partition(message, partitions),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    next: AtomicUsize,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&self, _message: &ProducerMessage, partitions: i32) -> Result<i32> {
        check_partitions(partitions)?;
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok((n % partitions as usize) as i32)
    }
}

/// Uses the partition set on the message.
#[derive(Debug, Default)]
pub struct ManualPartitioner;

impl Partitioner for ManualPartitioner {
    fn partition(&self, message: &ProducerMessage, partitions: i32) -> Result<i32> {
        check_partitions(partitions)?;
        match message.partition {
            Some(p) if (0..partitions).contains(&p) => Ok(p),
            Some(_) => Err(Error::Kafka(KafkaCode::UnknownTopicOrPartition)),
            None => Err(Error::Config(
                "manual partitioner requires a partition on every message".to_string(),
            )),
        }
    }
}
