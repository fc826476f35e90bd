use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::partitioner::{self, Partitioner};
use super::produce_set::{PartitionSet, ProduceSet, check_message_size, now_ms};
use super::txn::{ProducerSession, TransactionManager, TransactionStatus};
use super::{Envelope, ProducerError, ProducerMessage};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, KafkaCode, Result};
use crate::network::Broker;
use crate::retry;
use crate::types::{BrokerId, TopicPartition};

enum Command {
    Message(Envelope),
    Flush,
}

/// Counts accepted messages whose result has not been reported yet.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// State shared by the dispatcher and the broker tasks.
#[derive(Debug)]
struct Shared {
    client: Arc<Client>,
    config: Arc<ClientConfig>,
    partitioner: Arc<dyn Partitioner>,
    txn: TransactionManager,
    inflight: InFlight,
}

/// Where results go. Owned by the tasks so the channels close once every
/// task has exited.
#[derive(Debug, Clone)]
struct Delivery {
    shared: Arc<Shared>,
    successes: mpsc::Sender<ProducerMessage>,
    errors: mpsc::Sender<ProducerError>,
}

impl Delivery {
    async fn succeed(&self, envelope: Envelope, offset: Option<i64>) {
        let Envelope { mut message, reply } = envelope;
        message.offset = offset;
        match reply {
            Some(reply) => {
                let _ = reply.send(Ok(message));
            }
            None if self.shared.config.producer.return_successes => {
                let _ = self.successes.send(message).await;
            }
            None => {}
        }
        self.shared.inflight.done();
    }

    async fn fail(&self, envelope: Envelope, error: Error) {
        self.shared.txn.record_failure(&error).await;
        let Envelope { message, reply } = envelope;
        let failure = ProducerError { message, error };
        match reply {
            Some(reply) => {
                let _ = reply.send(Err(failure));
            }
            None if self.shared.config.producer.return_errors => {
                let _ = self.errors.send(failure).await;
            }
            None => {
                tracing::error!(topic = %failure.message.topic, partition = ?failure.message.partition, error = %failure.error, "Message dropped");
            }
        }
        self.shared.inflight.done();
    }

    async fn fail_set(&self, set: PartitionSet, error: &Error) {
        for envelope in set.messages {
            self.fail(envelope, error.clone()).await;
        }
    }
}

/// Produces without waiting for each message.
///
/// Results arrive on [`recv_success`](Self::recv_success) when
/// `producer.return_successes` is set and on [`recv_error`](Self::recv_error)
/// when `producer.return_errors` is set. Both channels hold
/// `channel_buffer_size` results; leaving one full stalls the producer.
///
/// ```rust,no_run
/// # async fn example() -> kafkaesque_client::error::Result<()> {
/// use kafkaesque_client::config::ClientConfig;
/// use kafkaesque_client::producer::{AsyncProducer, ProducerMessage};
///
/// let mut config = ClientConfig::default();
/// config.producer.return_successes = true;
/// let producer = AsyncProducer::new(&["localhost:9092"], config).await?;
/// producer.send(ProducerMessage::new("events", "hello")).await?;
/// let delivered = producer.recv_success().await;
/// producer.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AsyncProducer {
    shared: Arc<Shared>,
    input: Mutex<Option<mpsc::Sender<Command>>>,
    successes: tokio::sync::Mutex<mpsc::Receiver<ProducerMessage>>,
    errors: tokio::sync::Mutex<mpsc::Receiver<ProducerError>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    owns_client: bool,
}

impl AsyncProducer {
    /// Connects a dedicated client.
    pub async fn new<S: AsRef<str>>(addrs: &[S], config: ClientConfig) -> Result<AsyncProducer> {
        let client = Client::new(addrs, config).await?;
        match Self::start(client.clone(), true).await {
            Ok(producer) => Ok(producer),
            Err(e) => {
                client.close().await;
                Err(e)
            }
        }
    }

    /// Shares `client`; its config drives the producer.
    pub async fn from_client(client: Arc<Client>) -> Result<AsyncProducer> {
        Self::start(client, false).await
    }

    async fn start(client: Arc<Client>, owns_client: bool) -> Result<AsyncProducer> {
        let config = client.config().clone();
        config.check()?;
        let txn = TransactionManager::new(client.clone()).await?;

        let shared = Arc::new(Shared {
            partitioner: partitioner::from_kind(config.producer.partitioner),
            client,
            config: config.clone(),
            txn,
            inflight: InFlight::default(),
        });

        let buffer = config.channel_buffer_size.max(1);
        let (input, input_rx) = mpsc::channel(buffer);
        let (success_tx, successes) = mpsc::channel(buffer);
        let (error_tx, errors) = mpsc::channel(buffer);
        let delivery = Delivery {
            shared: shared.clone(),
            successes: success_tx,
            errors: error_tx,
        };
        let dispatcher = tokio::spawn(dispatch(delivery, input_rx));

        tracing::debug!(
            idempotent = config.producer.idempotent,
            transactional_id = ?config.producer.transaction.id,
            "Producer started"
        );
        Ok(AsyncProducer {
            shared,
            input: Mutex::new(Some(input)),
            successes: tokio::sync::Mutex::new(successes),
            errors: tokio::sync::Mutex::new(errors),
            dispatcher: Mutex::new(Some(dispatcher)),
            owns_client,
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.shared.client
    }

    fn input(&self) -> Result<mpsc::Sender<Command>> {
        self.input
            .lock()
            .ok()
            .and_then(|input| input.clone())
            .ok_or(Error::Closed)
    }

    async fn submit(&self, mut envelope: Envelope) -> Result<()> {
        let input = self.input()?;
        envelope.message.timestamp.get_or_insert_with(now_ms);
        self.shared.inflight.add();
        if input.send(Command::Message(envelope)).await.is_err() {
            self.shared.inflight.done();
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Queues `message`. Returns once it is accepted, not delivered.
    pub async fn send(&self, message: ProducerMessage) -> Result<()> {
        self.submit(Envelope::detached(message)).await
    }

    /// Queues `message` and hands back a receiver for its result, bypassing
    /// the success and error channels.
    pub(crate) async fn send_with_reply(
        &self,
        message: ProducerMessage,
    ) -> Result<oneshot::Receiver<std::result::Result<ProducerMessage, ProducerError>>> {
        let (tx, rx) = oneshot::channel();
        self.submit(Envelope {
            message,
            reply: Some(tx),
        })
        .await?;
        Ok(rx)
    }

    /// The next delivered message; `None` after close once drained.
    pub async fn recv_success(&self) -> Option<ProducerMessage> {
        self.successes.lock().await.recv().await
    }

    /// The next failed message; `None` after close once drained.
    pub async fn recv_error(&self) -> Option<ProducerError> {
        self.errors.lock().await.recv().await
    }

    /// Sends everything buffered and waits until every accepted message has
    /// a result.
    pub async fn flush(&self) -> Result<()> {
        let input = self.input()?;
        input.send(Command::Flush).await.map_err(|_| Error::Closed)?;
        self.shared.inflight.wait_idle().await;
        Ok(())
    }

    pub fn is_transactional(&self) -> bool {
        self.shared.txn.is_transactional()
    }

    pub async fn txn_status(&self) -> TransactionStatus {
        self.shared.txn.status().await
    }

    pub async fn begin_txn(&self) -> Result<()> {
        self.shared.txn.begin().await
    }

    /// Flushes, then commits every partition written in the transaction.
    pub async fn commit_txn(&self) -> Result<()> {
        self.flush().await?;
        self.shared.txn.end_txn(true).await
    }

    /// Flushes, then aborts the transaction. `ReadCommitted` consumers never
    /// see its records.
    pub async fn abort_txn(&self) -> Result<()> {
        if !self.shared.txn.is_transactional() {
            return Err(Error::Transaction("producer is not transactional".to_string()));
        }
        self.flush().await?;
        self.shared.txn.end_txn(false).await
    }

    /// Stops accepting messages, delivers what is buffered and waits for the
    /// background tasks. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let input = self.input.lock().ok().and_then(|mut input| input.take());
        let Some(input) = input else {
            return Ok(());
        };
        drop(input);

        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::error!(error = %e, "Producer dispatcher panicked");
            }
        }
        if self.owns_client {
            self.shared.client.close().await;
        }
        tracing::debug!("Producer closed");
        Ok(())
    }
}

impl Drop for AsyncProducer {
    fn drop(&mut self) {
        if let Ok(mut input) = self.input.lock() {
            input.take();
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Chooses the partition, registers it with the transaction and hands the
/// message to the leader's task.
async fn route(shared: &Shared, message: &mut ProducerMessage) -> Result<Arc<Broker>> {
    shared.txn.check_can_produce().await?;
    check_message_size(&shared.config, message)?;

    let partitions = shared.client.partitions(&message.topic).await?;
    let partition = shared
        .partitioner
        .partition(message, partitions.len() as i32)?;
    message.partition = Some(partition);
    let tp = TopicPartition::new(&message.topic, partition);

    if shared.txn.is_transactional() {
        shared.txn.add_partitions_to_txn(&[tp.clone()]).await?;
    }
    shared.client.leader_for(&tp).await
}

async fn dispatch(delivery: Delivery, mut input: mpsc::Receiver<Command>) {
    let shared = delivery.shared.clone();
    let mut workers: HashMap<BrokerId, mpsc::Sender<Command>> = HashMap::new();
    let mut handles = Vec::new();

    while let Some(command) = input.recv().await {
        match command {
            Command::Message(mut envelope) => {
                let broker = match route(&shared, &mut envelope.message).await {
                    Ok(broker) => broker,
                    Err(e) => {
                        tracing::debug!(topic = %envelope.message.topic, error = %e, "Routing failed");
                        delivery.fail(envelope, e).await;
                        continue;
                    }
                };
                let worker = workers.entry(broker.id()).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(shared.config.channel_buffer_size.max(1));
                    let task = BrokerTask {
                        delivery: delivery.clone(),
                        broker: broker.clone(),
                    };
                    handles.push(tokio::spawn(task.run(rx)));
                    tx
                });
                if let Err(mpsc::error::SendError(command)) =
                    worker.send(Command::Message(envelope)).await
                {
                    if let Command::Message(envelope) = command {
                        delivery.fail(envelope, Error::Closed).await;
                    }
                }
            }
            Command::Flush => {
                for worker in workers.values() {
                    let _ = worker.send(Command::Flush).await;
                }
            }
        }
    }

    // closing the worker channels makes each task deliver what it holds
    drop(workers);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Producer broker task panicked");
        }
    }
}

// ============================================================================
// Broker tasks
// ============================================================================

/// Owns the produce set for messages routed to one broker.
struct BrokerTask {
    delivery: Delivery,
    broker: Arc<Broker>,
}

impl BrokerTask {
    fn config(&self) -> &Arc<ClientConfig> {
        &self.delivery.shared.config
    }

    async fn run(self, mut input: mpsc::Receiver<Command>) {
        let mut set = ProduceSet::new(self.config().clone());
        loop {
            let deadline = set.flush_deadline();
            let command = tokio::select! {
                command = input.recv() => command,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                    self.flush(&mut set).await;
                    continue;
                }
            };

            match command {
                Some(Command::Message(envelope)) => {
                    let size = match check_message_size(self.config(), &envelope.message) {
                        Ok(size) => size,
                        Err(e) => {
                            self.delivery.fail(envelope, e).await;
                            continue;
                        }
                    };
                    if let Some(tp) = envelope.message.topic_partition() {
                        if set.would_overflow(&tp, size) {
                            self.flush(&mut set).await;
                        }
                    }
                    if let Err(e) = set.push(envelope, size) {
                        tracing::error!(broker_id = %self.broker.id(), error = %e, "Message rejected by produce set");
                        continue;
                    }
                    if set.ready_to_flush() {
                        self.flush(&mut set).await;
                    }
                }
                Some(Command::Flush) => self.flush(&mut set).await,
                None => {
                    self.flush(&mut set).await;
                    tracing::debug!(broker_id = %self.broker.id(), "Producer broker task exiting");
                    return;
                }
            }
        }
    }

    async fn flush(&self, set: &mut ProduceSet) {
        if set.is_empty() {
            return;
        }
        let taken = std::mem::replace(set, ProduceSet::new(self.config().clone()));
        self.deliver(self.broker.clone(), taken).await;
    }

    /// Sends `set`, re-routing and retrying partitions that fail with a
    /// retriable error until `producer.retry.max` is exhausted.
    async fn deliver(&self, broker: Arc<Broker>, set: ProduceSet) {
        let shared = &self.delivery.shared;
        let mut backoff = retry::delays(retry::producer_policy(&shared.config));
        let mut pending = vec![(broker, set)];

        loop {
            let mut retry_set = ProduceSet::new(shared.config.clone());
            let mut last_error = None;
            for (broker, set) in pending.drain(..) {
                if let Some(e) = self.send_once(&broker, set, &mut retry_set).await {
                    last_error = Some(e);
                }
            }
            if retry_set.is_empty() {
                return;
            }
            let error = last_error.unwrap_or(Error::Network(std::io::ErrorKind::Other));

            let Some(delay) = backoff.next() else {
                tracing::error!(error = %error, messages = retry_set.len(), "Produce retries exhausted");
                let session = retry_set.session().cloned();
                for (_, partition) in retry_set.drain() {
                    self.abandon(partition, &error, session.as_ref()).await;
                }
                return;
            };
            tracing::warn!(error = %error, delay = ?delay, messages = retry_set.len(), "Produce failed, retrying");
            tokio::time::sleep(delay).await;
            pending = self.regroup(retry_set).await;
        }
    }

    /// Splits a retry set by current partition leader.
    async fn regroup(&self, mut set: ProduceSet) -> Vec<(Arc<Broker>, ProduceSet)> {
        let shared = &self.delivery.shared;
        let session = set.session().cloned();
        let mut groups: HashMap<BrokerId, (Arc<Broker>, ProduceSet)> = HashMap::new();

        for (tp, partition) in set.drain() {
            shared.client.invalidate_leader(&tp);
            match shared.client.leader_for(&tp).await {
                Ok(leader) => {
                    let (_, group) = groups.entry(leader.id()).or_insert_with(|| {
                        let mut group = ProduceSet::new(shared.config.clone());
                        if let Some(session) = &session {
                            group.set_session(session.clone());
                        }
                        (leader.clone(), group)
                    });
                    group.restore(tp, partition);
                }
                Err(e) => self.abandon(partition, &e, session.as_ref()).await,
            }
        }
        groups.into_values().collect()
    }

    /// Fails `partition` for good. A batch that already holds a sequence
    /// leaves a gap the broker will never see filled, so the session is
    /// reset before the next batch is sequenced.
    async fn abandon(&self, partition: PartitionSet, error: &Error, session: Option<&ProducerSession>) {
        if let (Some(_), Some(session)) = (partition.base_sequence, session) {
            self.delivery.shared.txn.reset_session(session, error).await;
        }
        self.delivery.fail_set(partition, error).await;
    }

    /// Assigns producer identity and sequences the first time a set is sent.
    async fn prepare(&self, set: &mut ProduceSet) {
        let txn = &self.delivery.shared.txn;
        if set.session().is_none() {
            match txn.session().await {
                Some(session) => set.set_session(session),
                None => return,
            }
        }
        for (tp, count) in set.unsequenced() {
            let sequence = txn.next_sequence(&tp, count).await;
            set.set_base_sequence(&tp, sequence);
        }
    }

    /// One produce round trip. Partitions that should be retried are moved to
    /// `retry`; the returned error is the one that caused it.
    async fn send_once(&self, broker: &Arc<Broker>, mut set: ProduceSet, retry: &mut ProduceSet) -> Option<Error> {
        let shared = &self.delivery.shared;

        // a transactional batch may only touch registered partitions
        if shared.txn.is_transactional() {
            let mut unregistered = Vec::new();
            for tp in set.partitions() {
                if !shared.txn.is_registered(&tp).await {
                    unregistered.push(tp);
                }
            }
            if !unregistered.is_empty() {
                for (tp, partition) in set.drain() {
                    if unregistered.contains(&tp) {
                        let error = Error::Transaction(format!(
                            "{} is not registered in the transaction",
                            tp
                        ));
                        self.delivery.fail_set(partition, &error).await;
                    } else {
                        set.restore(tp, partition);
                    }
                }
            }
            if set.is_empty() {
                return None;
            }
        }

        self.prepare(&mut set).await;
        let session = set.session().cloned();
        if retry.session().is_none() {
            if let Some(session) = &session {
                retry.set_session(session.clone());
            }
        }

        let request = match set.build_request() {
            Ok(request) => request,
            Err(e) => {
                for (_, partition) in set.drain() {
                    self.abandon(partition, &e, session.as_ref()).await;
                }
                return None;
            }
        };

        tracing::debug!(broker_id = %broker.id(), messages = set.len(), bytes = set.byte_size(), "Sending produce request");
        let response = match broker.produce(&request).await {
            Ok(response) => response,
            Err(e) if e.is_retriable() => {
                for (tp, partition) in set.drain() {
                    retry.restore(tp, partition);
                }
                return Some(e);
            }
            Err(e) => {
                for (_, partition) in set.drain() {
                    self.abandon(partition, &e, session.as_ref()).await;
                }
                return None;
            }
        };

        let Some(response) = response else {
            // acks = 0: nothing comes back
            for (_, partition) in set.drain() {
                for envelope in partition.messages {
                    self.delivery.succeed(envelope, None).await;
                }
            }
            return None;
        };

        let mut retry_error = None;
        for (tp, partition) in set.drain() {
            let Some(result) = response.partition(&tp.topic, tp.partition) else {
                let error = Error::Encoding(format!("produce response is missing {}", tp));
                self.abandon(partition, &error, session.as_ref()).await;
                continue;
            };

            match result.error_code {
                KafkaCode::None => {
                    let base = result.base_offset;
                    for (i, envelope) in partition.messages.into_iter().enumerate() {
                        self.delivery.succeed(envelope, Some(base + i as i64)).await;
                    }
                }
                code => {
                    let error = Error::from_code(code, &tp);
                    if error.is_retriable() {
                        tracing::debug!(partition = %tp, error = %error, "Partition will be retried");
                        retry.restore(tp, partition);
                        retry_error = Some(error);
                    } else {
                        tracing::warn!(partition = %tp, error = %error, "Produce failed");
                        self.abandon(partition, &error, session.as_ref()).await;
                    }
                }
            }
        }
        retry_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ApiKey;
    use crate::types::RequiredAcks;
    use bytes::Bytes;
    use std::time::Duration;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.metadata.retry_backoff = Duration::from_millis(5);
        config.producer.retry.backoff = Duration::from_millis(5);
        config.producer.return_successes = true;
        config
    }

    async fn cluster(nodes: usize, partitions: i32) -> crate::mock::MockCluster {
        let cluster = crate::mock::MockCluster::start(nodes).await.unwrap();
        cluster.create_topic("events", partitions);
        cluster
    }

    #[tokio::test]
    async fn test_offsets_follow_submission_order() {
        let cluster = cluster(1, 1).await;
        let producer = AsyncProducer::new(&cluster.addrs(), config()).await.unwrap();
        for value in ["a", "b", "c"] {
            producer
                .send(ProducerMessage::new("events", value))
                .await
                .unwrap();
        }
        let mut delivered = Vec::new();
        for _ in 0..3 {
            delivered.push(producer.recv_success().await.unwrap());
        }
        delivered.sort_by_key(|m| m.offset);
        let offsets: Vec<_> = delivered.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![Some(0), Some(1), Some(2)]);
        assert_eq!(delivered[0].value, Some(Bytes::from_static(b"a")));
        assert_eq!(cluster.high_watermark("events", 0), Some(3));
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_batches_by_message_count() {
        let cluster = cluster(1, 1).await;
        let mut config = config();
        config.producer.flush.messages = 4;
        config.producer.flush.frequency = Duration::from_secs(60);
        let producer = AsyncProducer::new(&cluster.addrs(), config).await.unwrap();

        for i in 0..8 {
            producer
                .send(ProducerMessage::new("events", format!("v{}", i)))
                .await
                .unwrap();
        }
        producer.flush().await.unwrap();
        assert_eq!(cluster.batches("events", 0).len(), 2);
        assert_eq!(cluster.request_count(ApiKey::Produce), 2);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_frequency() {
        let cluster = cluster(1, 1).await;
        let mut config = config();
        config.producer.flush.messages = 100;
        config.producer.flush.frequency = Duration::from_millis(20);
        let producer = AsyncProducer::new(&cluster.addrs(), config).await.unwrap();

        producer.send(ProducerMessage::new("events", "late")).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(5), producer.recv_success())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.offset, Some(0));
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_too_large_reported() {
        let cluster = cluster(1, 1).await;
        let mut config = config();
        config.producer.max_message_bytes = 64;
        let producer = AsyncProducer::new(&cluster.addrs(), config).await.unwrap();

        producer
            .send(ProducerMessage::new("events", vec![0u8; 128]))
            .await
            .unwrap();
        let failed = producer.recv_error().await.unwrap();
        assert!(matches!(failed.error, Error::MessageTooLarge { max: 64, .. }));
        assert_eq!(cluster.request_count(ApiKey::Produce), 0);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_after_not_leader() {
        let cluster = cluster(1, 1).await;
        cluster.inject_error(ApiKey::Produce, KafkaCode::NotLeaderForPartition);
        let producer = AsyncProducer::new(&cluster.addrs(), config()).await.unwrap();

        producer.send(ProducerMessage::new("events", "x")).await.unwrap();
        let delivered = producer.recv_success().await.unwrap();
        assert_eq!(delivered.offset, Some(0));
        assert_eq!(cluster.request_count(ApiKey::Produce), 2);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let cluster = cluster(1, 1).await;
        let mut config = config();
        config.producer.retry.max = 1;
        for _ in 0..2 {
            cluster.inject_error(ApiKey::Produce, KafkaCode::NotEnoughReplicas);
        }
        let producer = AsyncProducer::new(&cluster.addrs(), config).await.unwrap();

        producer.send(ProducerMessage::new("events", "x")).await.unwrap();
        let failed = producer.recv_error().await.unwrap();
        assert_eq!(failed.error, Error::Kafka(KafkaCode::NotEnoughReplicas));
        assert_eq!(cluster.high_watermark("events", 0), Some(0));
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_response_acks() {
        let cluster = cluster(1, 1).await;
        let mut config = config();
        config.producer.required_acks = RequiredAcks::NoResponse;
        let producer = AsyncProducer::new(&cluster.addrs(), config).await.unwrap();

        producer.send(ProducerMessage::new("events", "x")).await.unwrap();
        let delivered = producer.recv_success().await.unwrap();
        assert_eq!(delivered.offset, None);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_stay_on_one_partition() {
        let cluster = cluster(2, 4).await;
        let producer = AsyncProducer::new(&cluster.addrs(), config()).await.unwrap();
        for i in 0..6 {
            producer
                .send(ProducerMessage::new("events", format!("{}", i)).with_key("user-1"))
                .await
                .unwrap();
        }
        let mut partitions = Vec::new();
        for _ in 0..6 {
            partitions.push(producer.recv_success().await.unwrap().partition);
        }
        partitions.dedup();
        assert_eq!(partitions.len(), 1);
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close() {
        let cluster = cluster(1, 1).await;
        let producer = AsyncProducer::new(&cluster.addrs(), config()).await.unwrap();
        producer.close().await.unwrap();
        producer.close().await.unwrap();
        assert_eq!(
            producer.send(ProducerMessage::new("events", "x")).await,
            Err(Error::Closed)
        );
        assert!(producer.recv_success().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_topic_reported() {
        let cluster = cluster(1, 1).await;
        let producer = AsyncProducer::new(&cluster.addrs(), config()).await.unwrap();
        producer.send(ProducerMessage::new("missing", "x")).await.unwrap();
        let failed = producer.recv_error().await.unwrap();
        assert_eq!(failed.message.topic, "missing");
        producer.close().await.unwrap();
    }
}
