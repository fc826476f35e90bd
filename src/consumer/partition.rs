use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use dashmap::DashSet;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{ConsumerMessage, ConsumerState};
use crate::client::Client;
use crate::codec::{AbortedTransaction, FetchPartition, FetchRequest, FetchTopic};
use crate::error::{Error, KafkaCode, Result};
use crate::records::{ControlRecordType, DecodedBatch, decode_records};
use crate::retry;
use crate::types::{IsolationLevel, TopicPartition};

/// Consumes a single partition.
///
/// Messages arrive in offset order through [`recv`](Self::recv). The
/// partition stays claimed until [`close`](Self::close) is called or the
/// value is dropped.
#[derive(Debug)]
pub struct PartitionConsumer {
    tp: TopicPartition,
    messages: mpsc::Receiver<ConsumerMessage>,
    errors: mpsc::Receiver<Error>,
    high_water_mark: Arc<AtomicI64>,
    state: Arc<AtomicU8>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    active: Arc<DashSet<TopicPartition>>,
}

impl PartitionConsumer {
    pub(super) fn spawn(
        client: Arc<Client>,
        tp: TopicPartition,
        offset: i64,
        active: Arc<DashSet<TopicPartition>>,
    ) -> PartitionConsumer {
        let buffer = client.config().channel_buffer_size.max(1);
        let (message_tx, messages) = mpsc::channel(buffer);
        let (error_tx, errors) = mpsc::channel(buffer);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let high_water_mark = Arc::new(AtomicI64::new(offset));
        let state = Arc::new(AtomicU8::new(ConsumerState::Initializing as u8));

        let fetch_size = client.config().consumer.fetch_default;
        let worker = FetchLoop {
            client,
            tp: tp.clone(),
            next_offset: offset,
            fetch_size,
            messages: message_tx,
            errors: error_tx,
            high_water_mark: high_water_mark.clone(),
            state: state.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());

        PartitionConsumer {
            tp,
            messages,
            errors,
            high_water_mark,
            state,
            shutdown,
            task: Some(task),
            active,
        }
    }

    pub fn topic(&self) -> &str {
        &self.tp.topic
    }

    pub fn partition(&self) -> i32 {
        self.tp.partition
    }

    /// The next message, or `None` once the consumer has stopped and every
    /// buffered message was taken.
    pub async fn recv(&mut self) -> Option<ConsumerMessage> {
        self.messages.recv().await
    }

    /// Direct access to the message channel, e.g. for `tokio::select!`.
    pub fn messages(&mut self) -> &mut mpsc::Receiver<ConsumerMessage> {
        &mut self.messages
    }

    /// Errors are only delivered here when `consumer.return_errors` is set;
    /// otherwise they are logged.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<Error> {
        &mut self.errors
    }

    /// The high-water mark from the last fetch response: the offset the next
    /// produced record will receive.
    pub fn high_water_mark_offset(&self) -> i64 {
        self.high_water_mark.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stops the fetch loop and waits for it. Buffered messages can still
    /// be drained with [`recv`](Self::recv). Returns the first undelivered
    /// error, if any.
    pub async fn close(&mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(topic = %self.tp.topic, partition = self.tp.partition, error = %e, "Fetch task panicked");
            }
        }
        self.active.remove(&self.tp);
        self.state.store(ConsumerState::Closed as u8, Ordering::Release);

        match self.errors.try_recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }
}

impl Drop for PartitionConsumer {
    fn drop(&mut self) {
        // The detached loop exits once its current fetch completes.
        let _ = self.shutdown.send(true);
        self.task.take();
        self.active.remove(&self.tp);
    }
}

// ============================================================================
// Fetch loop
// ============================================================================

struct FetchLoop {
    client: Arc<Client>,
    tp: TopicPartition,
    next_offset: i64,
    fetch_size: i32,
    messages: mpsc::Sender<ConsumerMessage>,
    errors: mpsc::Sender<Error>,
    high_water_mark: Arc<AtomicI64>,
    state: Arc<AtomicU8>,
    shutdown: watch::Receiver<bool>,
}

impl FetchLoop {
    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        let mut backoff = retry::delays(retry::consumer_policy(self.client.config()));
        self.set_state(ConsumerState::Fetching);

        'fetch: while !self.stopping() {
            let mut shutdown = self.shutdown.clone();
            // An in-flight fetch runs to completion; it is bounded by the
            // broker's max wait and the read timeout.
            let result = self.fetch_once().await;

            match result {
                Ok(batch) => {
                    backoff = retry::delays(retry::consumer_policy(self.client.config()));
                    for message in batch {
                        tokio::select! {
                            _ = shutdown.changed() => break 'fetch,
                            sent = self.messages.send(message) => {
                                if sent.is_err() {
                                    break 'fetch;
                                }
                            }
                        }
                    }
                }
                Err(e) if e.is_retriable() => {
                    let Some(delay) = backoff.next() else {
                        tracing::error!(topic = %self.tp.topic, partition = self.tp.partition, error = %e, "Fetch retries exhausted");
                        self.report(e).await;
                        break;
                    };
                    tracing::warn!(topic = %self.tp.topic, partition = self.tp.partition, error = %e, delay = ?delay, "Fetch failed, backing off");
                    self.set_state(ConsumerState::ErrorBackoff);
                    self.client.invalidate_leader(&self.tp);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.set_state(ConsumerState::Fetching);
                }
                Err(e) => {
                    tracing::error!(topic = %self.tp.topic, partition = self.tp.partition, error = %e, "Partition consumer stopped");
                    self.report(e).await;
                    break;
                }
            }
        }

        self.set_state(ConsumerState::Closed);
        tracing::debug!(topic = %self.tp.topic, partition = self.tp.partition, next_offset = self.next_offset, "Fetch loop exited");
    }

    async fn report(&self, error: Error) {
        if !self.client.config().consumer.return_errors {
            return;
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = self.errors.send(error) => {}
        }
    }

    async fn fetch_once(&mut self) -> Result<Vec<ConsumerMessage>> {
        let config = self.client.config().clone();
        let broker = self.client.leader_for(&self.tp).await?;

        let request = FetchRequest {
            max_wait_ms: i32::try_from(config.consumer.max_wait_time.as_millis()).unwrap_or(i32::MAX),
            min_bytes: config.consumer.fetch_min,
            max_bytes: if config.consumer.fetch_max > 0 {
                config.consumer.fetch_max
            } else {
                i32::MAX
            },
            isolation_level: config.consumer.isolation_level,
            topics: vec![FetchTopic {
                name: self.tp.topic.clone(),
                partitions: vec![FetchPartition {
                    partition: self.tp.partition,
                    current_leader_epoch: -1,
                    fetch_offset: self.next_offset,
                    log_start_offset: -1,
                    partition_max_bytes: self.fetch_size,
                }],
            }],
            ..FetchRequest::default()
        };

        let response = broker.fetch(&request).await?;
        let partition = response
            .partition(&self.tp.topic, self.tp.partition)
            .ok_or_else(|| Error::Encoding(format!("fetch response is missing {}", self.tp)))?;

        match partition.error_code {
            KafkaCode::None => {}
            KafkaCode::OffsetOutOfRange => {
                return Err(Error::OffsetOutOfRange {
                    topic: self.tp.topic.clone(),
                    partition: self.tp.partition,
                    offset: self.next_offset,
                });
            }
            code => return Err(Error::from_code(code, &self.tp)),
        }

        self.high_water_mark
            .store(partition.high_watermark, Ordering::Release);

        let set = decode_records(partition.records.clone())?;
        if set.batches.is_empty() {
            if set.partial_trailing {
                self.grow_fetch_size(partition.records.len())?;
            }
            return Ok(Vec::new());
        }
        self.fetch_size = config.consumer.fetch_default;

        let aborted = match config.consumer.isolation_level {
            IsolationLevel::ReadCommitted => partition.aborted_transactions.clone().unwrap_or_default(),
            IsolationLevel::ReadUncommitted => Vec::new(),
        };
        Ok(self.collect(set.batches, aborted))
    }

    /// Only a truncated entry came back: the next record is larger than the
    /// current fetch size.
    fn grow_fetch_size(&mut self, received: usize) -> Result<()> {
        let max = self.client.config().consumer.fetch_max;
        if max > 0 && self.fetch_size >= max {
            return Err(Error::MessageTooLarge {
                size: received,
                max: max as usize,
            });
        }
        let grown = self.fetch_size.saturating_mul(2);
        self.fetch_size = if max > 0 { grown.min(max) } else { grown };
        tracing::debug!(topic = %self.tp.topic, partition = self.tp.partition, fetch_size = self.fetch_size, "Partial record, growing fetch size");
        Ok(())
    }

    /// Turns decoded batches into messages, dropping records below the
    /// requested offset, control records, and aborted transactional data.
    fn collect(&mut self, batches: Vec<DecodedBatch>, aborted: Vec<AbortedTransaction>) -> Vec<ConsumerMessage> {
        let mut filter = AbortFilter::new(aborted);
        let mut messages = Vec::new();

        for batch in batches {
            if batch.last_offset < self.next_offset {
                continue;
            }
            let skip = filter.should_skip(&batch);
            let last_offset = batch.last_offset;

            if !skip {
                for record in batch.records {
                    if record.offset < self.next_offset {
                        continue;
                    }
                    messages.push(ConsumerMessage {
                        topic: self.tp.topic.clone(),
                        partition: self.tp.partition,
                        key: record.key,
                        value: record.value,
                        headers: record.headers,
                        timestamp: record.timestamp,
                        offset: record.offset,
                    });
                }
            }
            self.next_offset = self.next_offset.max(last_offset + 1);
        }
        messages
    }
}

/// Tracks which producers are inside an aborted transaction while walking a
/// fetched record set in offset order.
struct AbortFilter {
    pending: VecDeque<AbortedTransaction>,
    active: HashSet<i64>,
}

impl AbortFilter {
    fn new(mut aborted: Vec<AbortedTransaction>) -> AbortFilter {
        aborted.sort_by_key(|a| a.first_offset);
        AbortFilter {
            pending: aborted.into(),
            active: HashSet::new(),
        }
    }

    fn should_skip(&mut self, batch: &DecodedBatch) -> bool {
        while let Some(next) = self.pending.front() {
            if next.first_offset > batch.last_offset {
                break;
            }
            self.active.insert(next.producer_id);
            self.pending.pop_front();
        }

        if batch.control {
            if batch.control_type == Some(ControlRecordType::Abort) {
                self.active.remove(&batch.producer_id);
            }
            return true;
        }
        batch.transactional && self.active.contains(&batch.producer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionCodec;
    use crate::constants::{NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE};
    use crate::records::DecodedRecord;
    use bytes::Bytes;

    fn batch(base: i64, count: i64, producer_id: i64, transactional: bool) -> DecodedBatch {
        DecodedBatch {
            magic: 2,
            base_offset: base,
            last_offset: base + count - 1,
            codec: CompressionCodec::None,
            producer_id,
            producer_epoch: if producer_id >= 0 { 0 } else { NO_PRODUCER_EPOCH },
            base_sequence: NO_SEQUENCE,
            transactional,
            control: false,
            control_type: None,
            records: (0..count)
                .map(|i| DecodedRecord {
                    offset: base + i,
                    timestamp: 0,
                    key: None,
                    value: Some(Bytes::from(format!("v{}", base + i))),
                    headers: vec![],
                })
                .collect(),
        }
    }

    fn marker(offset: i64, producer_id: i64, kind: ControlRecordType) -> DecodedBatch {
        DecodedBatch {
            control: true,
            control_type: Some(kind),
            records: vec![],
            ..batch(offset, 1, producer_id, true)
        }
    }

    #[test]
    fn test_abort_filter_skips_aborted_producer_only() {
        let aborted = vec![AbortedTransaction {
            producer_id: 7,
            first_offset: 1,
        }];
        let mut filter = AbortFilter::new(aborted);

        assert!(!filter.should_skip(&batch(0, 1, NO_PRODUCER_ID, false)));
        assert!(filter.should_skip(&batch(1, 2, 7, true)));
        assert!(!filter.should_skip(&batch(3, 1, 8, true)));
        assert!(filter.should_skip(&marker(4, 7, ControlRecordType::Abort)));
        // after its abort marker the producer's next transaction is visible
        assert!(!filter.should_skip(&batch(5, 1, 7, true)));
    }

    #[test]
    fn test_commit_markers_are_hidden() {
        let mut filter = AbortFilter::new(vec![]);
        assert!(filter.should_skip(&marker(3, 7, ControlRecordType::Commit)));
        assert!(!filter.should_skip(&batch(4, 1, 7, true)));
    }
}
