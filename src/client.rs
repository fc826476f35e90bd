//! Cluster metadata and broker registry.
//!
//! A [`Client`] knows every broker of the cluster, caches partition
//! leadership and coordinator locations, and refreshes them when a broker
//! reports that the cached view is stale. Consumers and producers share one
//! client through an `Arc`.
//!
//! Stale-metadata handling works the same everywhere:
//!
//! 1. the failing entry is invalidated,
//! 2. metadata is refreshed under [`retry::metadata_policy`],
//! 3. the operation is retried once.
//!
//! ```rust,no_run
//! # async fn example() -> kafkaesque_client::error::Result<()> {
//! use kafkaesque_client::client::Client;
//! use kafkaesque_client::config::ClientConfig;
//! use kafkaesque_client::constants::OFFSET_NEWEST;
//!
//! let client = Client::new(&["localhost:9092"], ClientConfig::default()).await?;
//! let partitions = client.partitions("events").await?;
//! let newest = client.get_offset("events", partitions[0], OFFSET_NEWEST).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use backon::Retryable;
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::codec::{FindCoordinatorRequest, ListOffsetsRequest, MetadataRequest, MetadataResponse};
use crate::config::ClientConfig;
use crate::error::{Error, KafkaCode, Result};
use crate::network::Broker;
use crate::retry;
use crate::types::{BrokerId, CoordinatorType, TopicPartition};

#[derive(Debug, Clone, Copy)]
struct PartitionEntry {
    leader: BrokerId,
    error: KafkaCode,
}

#[derive(Debug, Clone)]
struct TopicEntry {
    error: KafkaCode,
    partitions: BTreeMap<i32, PartitionEntry>,
}

type CoordinatorKey = (String, CoordinatorType);

/// Shared handle to a cluster.
pub struct Client {
    config: Arc<ClientConfig>,
    seeds: Vec<Arc<Broker>>,
    brokers: DashMap<BrokerId, Arc<Broker>>,
    topics: RwLock<HashMap<String, TopicEntry>>,
    coordinators: DashMap<CoordinatorKey, Arc<Broker>>,
    /// Serializes metadata requests so concurrent refreshes collapse.
    refresh_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("seeds", &self.seeds.len())
            .field("brokers", &self.brokers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Validates `config`, fetches metadata from the first reachable seed and
    /// starts the background refresh task.
    pub async fn new<S: AsRef<str>>(addrs: &[S], config: ClientConfig) -> Result<Arc<Client>> {
        config.check()?;
        if addrs.is_empty() {
            return Err(Error::Config("at least one seed broker is required".into()));
        }

        let config = Arc::new(config);
        let seeds = addrs
            .iter()
            .map(|addr| Arc::new(Broker::new(BrokerId::INVALID, addr.as_ref(), config.clone())))
            .collect();

        let client = Arc::new(Client {
            config,
            seeds,
            brokers: DashMap::new(),
            topics: RwLock::new(HashMap::new()),
            coordinators: DashMap::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            background: Mutex::new(None),
        });

        client.refresh_metadata(&[]).await?;
        tracing::info!(
            brokers = client.brokers.len(),
            topics = client.topics().len(),
            "Connected to cluster"
        );

        Client::spawn_background_refresh(&client);
        Ok(client)
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn spawn_background_refresh(client: &Arc<Client>) {
        let frequency = client.config.metadata.refresh_frequency;
        if frequency.is_zero() {
            return;
        }
        let weak: Weak<Client> = Arc::downgrade(client);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frequency);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = weak.upgrade() else {
                    return;
                };
                if client.is_closed() {
                    return;
                }
                if let Err(e) = client.refresh_metadata(&[]).await {
                    tracing::warn!(error = %e, "Background metadata refresh failed");
                }
            }
        });
        if let Ok(mut background) = client.background.lock() {
            *background = Some(handle);
        }
    }

    // ========================================================================
    // Brokers
    // ========================================================================

    /// Every broker learned from metadata, ordered by id.
    pub fn brokers(&self) -> Vec<Arc<Broker>> {
        let mut brokers: Vec<_> = self.brokers.iter().map(|e| e.value().clone()).collect();
        brokers.sort_by_key(|b| b.id());
        brokers
    }

    pub fn broker(&self, id: BrokerId) -> Option<Arc<Broker>> {
        self.brokers.get(&id).map(|b| b.value().clone())
    }

    /// Registers a broker, keeping the existing handle when its address is unchanged.
    fn register_broker(&self, id: BrokerId, addr: String) -> Arc<Broker> {
        if let Some(existing) = self.brokers.get(&id) {
            if existing.addr() == addr {
                return existing.value().clone();
            }
        }
        tracing::debug!(broker_id = %id, broker = %addr, "Registering broker");
        let broker = Arc::new(Broker::new(id, addr, self.config.clone()));
        if let Some(old) = self.brokers.insert(id, broker.clone()) {
            tokio::spawn(async move { old.close().await });
        }
        broker
    }

    /// Brokers to ask for metadata: known ones first, then the seeds.
    fn metadata_candidates(&self) -> Vec<Arc<Broker>> {
        let mut candidates = self.brokers();
        candidates.extend(self.seeds.iter().cloned());
        candidates
    }

    /// Some broker of the cluster, for requests any node can answer.
    pub fn any_broker(&self) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        self.metadata_candidates()
            .into_iter()
            .next()
            .ok_or(Error::NoBrokersAvailable)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Names of every cached topic.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Refreshes metadata for `topics` (every topic when empty), retrying
    /// under the metadata policy.
    pub async fn refresh_metadata(&self, topics: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        (|| self.try_refresh(&topics))
            .retry(retry::metadata_policy(&self.config))
            .when(Error::is_retriable)
            .notify(|err, delay| {
                tracing::warn!(error = %err, delay = ?delay, "Retrying metadata refresh");
            })
            .await
    }

    async fn try_refresh(&self, topics: &[String]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.refresh_lock.lock().await;
        let request = if topics.is_empty() {
            MetadataRequest::all_topics()
        } else {
            MetadataRequest::for_topics(topics.to_vec())
        };

        let mut last_error = Error::NoBrokersAvailable;
        for broker in self.metadata_candidates() {
            match broker.metadata(&request).await {
                Ok(response) => {
                    self.apply_metadata(response, topics.is_empty());
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(broker = %broker.addr(), error = %e, "Metadata request failed");
                    if !e.is_retriable() {
                        return Err(e);
                    }
                    last_error = e;
                }
            }
        }
        tracing::warn!(error = %last_error, "No broker answered the metadata request");
        Err(last_error)
    }

    fn apply_metadata(&self, response: MetadataResponse, full: bool) {
        for broker in &response.brokers {
            self.register_broker(broker.node_id, broker.address());
        }

        let Ok(mut cache) = self.topics.write() else {
            return;
        };
        if full {
            cache.clear();
        }
        for topic in response.topics {
            let partitions = topic
                .partitions
                .iter()
                .map(|p| {
                    (
                        p.partition_index,
                        PartitionEntry {
                            leader: p.leader_id,
                            error: p.error_code,
                        },
                    )
                })
                .collect();
            cache.insert(
                topic.name,
                TopicEntry {
                    error: topic.error_code,
                    partitions,
                },
            );
        }
    }

    fn cached_topic(&self, topic: &str) -> Result<TopicEntry> {
        let cache = self.topics.read().map_err(|_| Error::Closed)?;
        let entry = cache
            .get(topic)
            .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?;
        if entry.error != KafkaCode::None {
            return Err(Error::Kafka(entry.error));
        }
        Ok(entry.clone())
    }

    fn cached_leader(&self, tp: &TopicPartition) -> Result<Arc<Broker>> {
        let entry = self.cached_topic(&tp.topic)?;
        let partition = entry
            .partitions
            .get(&tp.partition)
            .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?;
        match partition.error {
            KafkaCode::None | KafkaCode::ReplicaNotAvailable => {}
            code => return Err(Error::Kafka(code)),
        }
        if !partition.leader.is_valid() {
            return Err(Error::Kafka(KafkaCode::LeaderNotAvailable));
        }
        self.broker(partition.leader)
            .ok_or(Error::Kafka(KafkaCode::LeaderNotAvailable))
    }

    /// Sorted partition ids of `topic`, refreshing metadata if it is unknown.
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.ensure_open()?;
        if let Ok(entry) = self.cached_topic(topic) {
            return Ok(entry.partitions.keys().copied().collect());
        }
        let topics = [topic.to_string()];
        (|| async {
            self.try_refresh(&topics).await?;
            self.cached_topic(topic)
        })
        .retry(retry::metadata_policy(&self.config))
        .when(Error::is_retriable)
        .await
        .map(|entry| entry.partitions.keys().copied().collect())
    }

    /// The broker currently leading `tp`.
    pub async fn leader_for(&self, tp: &TopicPartition) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        if let Ok(broker) = self.cached_leader(tp) {
            return Ok(broker);
        }
        let topics = [tp.topic.clone()];
        (|| async {
            self.try_refresh(&topics).await?;
            self.cached_leader(tp)
        })
        .retry(retry::metadata_policy(&self.config))
        .when(Error::is_retriable)
        .notify(|err, delay| {
            tracing::warn!(topic = %tp.topic, partition = tp.partition, error = %err, delay = ?delay, "Leader lookup failed, retrying");
        })
        .await
    }

    /// Forgets the cached leader of `tp`; the next lookup refreshes metadata.
    pub fn invalidate_leader(&self, tp: &TopicPartition) {
        if let Ok(mut cache) = self.topics.write() {
            if let Some(partition) = cache
                .get_mut(&tp.topic)
                .and_then(|t| t.partitions.get_mut(&tp.partition))
            {
                partition.leader = BrokerId::INVALID;
            }
        }
    }

    /// Runs `op` against the leader of `tp`. When it fails with a stale
    /// metadata error the leader is invalidated, re-resolved and `op` runs
    /// once more.
    pub async fn with_leader<T, F, Fut>(&self, tp: &TopicPartition, mut op: F) -> Result<T>
    where
        F: FnMut(Arc<Broker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let leader = self.leader_for(tp).await?;
        match op(leader).await {
            Err(e) if e.is_stale_metadata() || matches!(e, Error::Network(_)) => {
                tracing::debug!(topic = %tp.topic, partition = tp.partition, error = %e, "Stale leader, refreshing");
                self.invalidate_leader(tp);
                let leader = self.leader_for(tp).await?;
                op(leader).await
            }
            other => other,
        }
    }

    /// Offset at `time` (ms), or the newest / oldest offset for the
    /// `OFFSET_NEWEST` / `OFFSET_OLDEST` sentinels.
    pub async fn get_offset(&self, topic: &str, partition: i32, time: i64) -> Result<i64> {
        let tp = TopicPartition::new(topic, partition);
        let mut request = ListOffsetsRequest::single(topic, partition, time);
        if self.config.version.list_offsets_version() >= 2 {
            request.isolation_level = self.config.consumer.isolation_level;
        }

        self.with_leader(&tp, |broker| {
            let request = request.clone();
            let tp = tp.clone();
            async move {
                let response = broker.list_offsets(&request).await?;
                let partition = response
                    .partition(&tp.topic, tp.partition)
                    .ok_or_else(|| Error::Encoding(format!("no offsets returned for {}", tp)))?;
                match partition.error_code {
                    KafkaCode::None => Ok(partition.offset),
                    code => Err(Error::from_code(code, &tp)),
                }
            }
        })
        .await
    }

    // ========================================================================
    // Coordinators
    // ========================================================================

    /// The coordinator broker for `key`.
    pub async fn coordinator_for(&self, key: &str, key_type: CoordinatorType) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        let cache_key = (key.to_string(), key_type);
        if let Some(broker) = self.coordinators.get(&cache_key) {
            return Ok(broker.value().clone());
        }

        let broker = (|| self.find_coordinator(key, key_type))
            .retry(retry::metadata_policy(&self.config))
            .when(Error::is_retriable)
            .notify(|err, delay| {
                tracing::warn!(key, error = %err, delay = ?delay, "Coordinator lookup failed, retrying");
            })
            .await?;
        self.coordinators.insert(cache_key, broker.clone());
        Ok(broker)
    }

    async fn find_coordinator(&self, key: &str, key_type: CoordinatorType) -> Result<Arc<Broker>> {
        let request = FindCoordinatorRequest {
            key: key.to_string(),
            key_type,
        };
        let mut last_error = Error::NoBrokersAvailable;
        for broker in self.metadata_candidates() {
            let response = match broker.find_coordinator(&request).await {
                Ok(response) => response,
                Err(e) if e.is_retriable() => {
                    last_error = e;
                    continue;
                }
                Err(e) => return Err(e),
            };
            return match response.error_code {
                KafkaCode::None => {
                    tracing::debug!(key, coordinator = %response.address(), "Found coordinator");
                    Ok(self.register_broker(response.node_id, response.address()))
                }
                KafkaCode::CoordinatorNotAvailable
                | KafkaCode::NotCoordinator
                | KafkaCode::CoordinatorLoadInProgress => {
                    Err(Error::CoordinatorNotAvailable(key.to_string()))
                }
                code => Err(Error::Kafka(code)),
            };
        }
        Err(last_error)
    }

    /// Forgets the cached coordinator for `key`.
    pub fn invalidate_coordinator(&self, key: &str, key_type: CoordinatorType) {
        self.coordinators.remove(&(key.to_string(), key_type));
    }

    /// Stops the background refresh and closes every broker connection.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let background = self.background.lock().ok().and_then(|mut b| b.take());
        if let Some(handle) = background {
            handle.abort();
        }
        for broker in self.metadata_candidates() {
            broker.close().await;
        }
        tracing::debug!("Client closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{OFFSET_NEWEST, OFFSET_OLDEST};
    use crate::codec::ApiKey;
    use crate::mock::MockCluster;
    use crate::records::RecordData;
    use bytes::Bytes;
    use std::time::Duration;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.metadata.retry_backoff = Duration::from_millis(5);
        config
    }

    #[tokio::test]
    async fn test_leaders_follow_partition_layout() {
        let cluster = MockCluster::start(3).await.unwrap();
        cluster.create_topic("events", 6);
        let client = Client::new(&cluster.addrs(), config()).await.unwrap();

        assert_eq!(client.brokers().len(), 3);
        assert_eq!(client.partitions("events").await.unwrap(), vec![0, 1, 2, 3, 4, 5]);
        for p in 0..6 {
            let leader = client
                .leader_for(&TopicPartition::new("events", p))
                .await
                .unwrap();
            assert_eq!(leader.id(), BrokerId::new(p % 3));
        }
    }

    #[tokio::test]
    async fn test_unknown_topic_surfaces_error() {
        let cluster = MockCluster::start(1).await.unwrap();
        let mut config = config();
        config.metadata.retry_max = 1;
        let client = Client::new(&cluster.addrs(), config).await.unwrap();

        let err = client.partitions("missing").await.unwrap_err();
        assert_eq!(err, Error::Kafka(KafkaCode::UnknownTopicOrPartition));
    }

    #[tokio::test]
    async fn test_topic_created_later_is_discovered() {
        let cluster = MockCluster::start(1).await.unwrap();
        let client = Client::new(&cluster.addrs(), config()).await.unwrap();
        assert!(client.topics().is_empty());

        cluster.create_topic("late", 2);
        assert_eq!(client.partitions("late").await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_leader_not_available_is_retried() {
        let cluster = MockCluster::start(1).await.unwrap();
        cluster.create_topic("events", 1);
        let client = Client::new(&cluster.addrs(), config()).await.unwrap();
        client.invalidate_leader(&TopicPartition::new("events", 0));

        cluster.inject_error(ApiKey::Metadata, KafkaCode::LeaderNotAvailable);
        let leader = client
            .leader_for(&TopicPartition::new("events", 0))
            .await
            .unwrap();
        assert_eq!(leader.id(), BrokerId::new(0));
    }

    #[tokio::test]
    async fn test_get_offset_sentinels() {
        let cluster = MockCluster::start(1).await.unwrap();
        cluster.create_topic("events", 1);
        cluster
            .append(
                "events",
                0,
                vec![
                    RecordData {
                        value: Some(Bytes::from_static(b"a")),
                        ..RecordData::default()
                    };
                    3
                ],
            )
            .unwrap();
        let client = Client::new(&cluster.addrs(), config()).await.unwrap();

        assert_eq!(client.get_offset("events", 0, OFFSET_OLDEST).await.unwrap(), 0);
        assert_eq!(client.get_offset("events", 0, OFFSET_NEWEST).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_get_offset_retries_once_after_not_leader() {
        let cluster = MockCluster::start(1).await.unwrap();
        cluster.create_topic("events", 1);
        let client = Client::new(&cluster.addrs(), config()).await.unwrap();

        cluster.inject_error(ApiKey::ListOffsets, KafkaCode::NotLeaderForPartition);
        assert_eq!(client.get_offset("events", 0, OFFSET_NEWEST).await.unwrap(), 0);
        assert_eq!(cluster.request_count(ApiKey::ListOffsets), 2);
    }

    #[tokio::test]
    async fn test_coordinator_lookup_is_cached() {
        let cluster = MockCluster::start(2).await.unwrap();
        let client = Client::new(&cluster.addrs(), config()).await.unwrap();

        cluster.inject_error(ApiKey::FindCoordinator, KafkaCode::CoordinatorNotAvailable);
        let coordinator = client
            .coordinator_for("txn-1", CoordinatorType::Transaction)
            .await
            .unwrap();
        assert_eq!(coordinator.id(), BrokerId::new(0));
        assert_eq!(cluster.request_count(ApiKey::FindCoordinator), 2);

        client
            .coordinator_for("txn-1", CoordinatorType::Transaction)
            .await
            .unwrap();
        assert_eq!(cluster.request_count(ApiKey::FindCoordinator), 2);

        client.invalidate_coordinator("txn-1", CoordinatorType::Transaction);
        client
            .coordinator_for("txn-1", CoordinatorType::Transaction)
            .await
            .unwrap();
        assert_eq!(cluster.request_count(ApiKey::FindCoordinator), 3);
    }

    #[tokio::test]
    async fn test_no_reachable_seed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut config = config();
        config.metadata.retry_max = 1;
        let err = Client::new(&[addr], config).await.unwrap_err();
        assert_eq!(err, Error::Network(std::io::ErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_refresh_surfaces_last_broker_error() {
        let mut dead = Vec::new();
        for _ in 0..3 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            dead.push(listener.local_addr().unwrap().to_string());
        }
        let mut config = config();
        config.metadata.retry_max = 2;

        // listeners dropped: every seed refuses
        let err = Client::new(&dead, config).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(err, Error::Network(std::io::ErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let cluster = MockCluster::start(1).await.unwrap();
        let client = Client::new(&cluster.addrs(), config()).await.unwrap();
        client.close().await;
        client.close().await;
        assert_eq!(client.partitions("events").await.unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.client_id.clear();
        let err = Client::new(&["127.0.0.1:1"], config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
