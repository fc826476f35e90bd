//! Shared state of a mock cluster and the per-API request handlers.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use nombytes::NomBytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::log::PartitionLog;
use crate::codec::{
    AddPartitionsToTxnCodec, AddPartitionsToTxnRequest, AddPartitionsToTxnResponse,
    AddPartitionsToTxnTopicResult, ApiKey, ApiVersionRange, ApiVersionsCodec,
    ApiVersionsResponse, EndTxnCodec, EndTxnRequest, EndTxnResponse, FetchCodec,
    FetchPartitionResponse, FetchRequest, FetchResponse, FetchTopicResponse, FindCoordinatorCodec,
    FindCoordinatorRequest, FindCoordinatorResponse, InitProducerIdCodec, InitProducerIdRequest,
    InitProducerIdResponse, KafkaCodec, ListOffsetsCodec, ListOffsetsPartitionResponse,
    ListOffsetsRequest, ListOffsetsResponse, ListOffsetsTopicResponse, MetadataBroker,
    MetadataCodec, MetadataRequest, MetadataResponse, PartitionMetadata, ProduceCodec,
    ProducePartitionResponse, ProduceRequest, ProduceResponse, ProduceTopicResponse,
    RequestHeader, TopicMetadata,
};
use crate::constants::{OFFSET_NEWEST, OFFSET_OLDEST};
use crate::error::{Error, KafkaCode, Result};
use crate::records::{ControlRecordType, decode_records};
use crate::types::{BrokerId, IsolationLevel, ProducerEpoch, ProducerId, TopicPartition};
use crate::version::magic_for_fetch_version;

/// Node that coordinates every transactional id.
const COORDINATOR_NODE: i32 = 0;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[derive(Debug)]
struct TxnEntry {
    producer_id: i64,
    epoch: i16,
    partitions: BTreeSet<TopicPartition>,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub topics: BTreeMap<String, Vec<PartitionLog>>,
    next_producer_id: i64,
    transactions: HashMap<String, TxnEntry>,
}

impl Inner {
    pub fn partition_mut(&mut self, topic: &str, partition: i32) -> Option<&mut PartitionLog> {
        self.topics
            .get_mut(topic)
            .and_then(|p| p.get_mut(usize::try_from(partition).ok()?))
    }

    pub fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionLog> {
        self.topics
            .get(topic)
            .and_then(|p| p.get(usize::try_from(partition).ok()?))
    }

    /// Writes a marker to every partition of the transaction and forgets them.
    fn finish_txn(&mut self, txn_id: &str, kind: ControlRecordType) {
        let Some(entry) = self.transactions.get_mut(txn_id) else {
            return;
        };
        let partitions = std::mem::take(&mut entry.partitions);
        let (producer_id, epoch) = (entry.producer_id, entry.epoch);
        let timestamp = now_ms();
        for tp in partitions {
            if let Some(log) = self.partition_mut(&tp.topic, tp.partition) {
                log.append_marker(producer_id, epoch, kind, timestamp);
            }
        }
    }
}

pub(crate) struct ClusterState {
    pub nodes: RwLock<Vec<MetadataBroker>>,
    pub inner: Mutex<Inner>,
    pub appended: Notify,
    pub connections: AtomicUsize,
    requests: Mutex<HashMap<ApiKey, usize>>,
    injected: Mutex<HashMap<ApiKey, VecDeque<KafkaCode>>>,
    max_versions: Mutex<HashMap<ApiKey, i16>>,
}

impl ClusterState {
    pub fn new() -> ClusterState {
        ClusterState {
            nodes: RwLock::new(Vec::new()),
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
            connections: AtomicUsize::new(0),
            requests: Mutex::new(HashMap::new()),
            injected: Mutex::new(HashMap::new()),
            max_versions: Mutex::new(HashMap::new()),
        }
    }

    pub fn inject(&self, api_key: ApiKey, code: KafkaCode) {
        lock(&self.injected).entry(api_key).or_default().push_back(code);
    }

    pub fn set_max_version(&self, api_key: ApiKey, max: i16) {
        lock(&self.max_versions).insert(api_key, max);
    }

    pub fn request_count(&self, api_key: ApiKey) -> usize {
        lock(&self.requests).get(&api_key).copied().unwrap_or(0)
    }

    fn take_injected(&self, api_key: ApiKey) -> Option<KafkaCode> {
        lock(&self.injected)
            .get_mut(&api_key)
            .and_then(VecDeque::pop_front)
    }

    fn node_count(&self) -> i32 {
        self.nodes.read().map(|n| n.len() as i32).unwrap_or(1).max(1)
    }

    fn leader_of(&self, partition: i32) -> i32 {
        partition % self.node_count()
    }

    /// Handles one request. `None` means the request gets no response.
    pub async fn handle(
        &self,
        node: i32,
        header: &RequestHeader,
        body: Bytes,
    ) -> Result<Option<Bytes>> {
        let api_key = ApiKey::from_i16(header.api_key).ok_or_else(|| {
            Error::UnsupportedVersion(format!("api key {}", header.api_key))
        })?;
        let version = header.api_version;
        *lock(&self.requests).entry(api_key).or_insert(0) += 1;
        let injected = self.take_injected(api_key);
        let body = NomBytes::new(body);

        tracing::debug!(
            node,
            api_key = %api_key,
            api_version = version,
            correlation_id = header.correlation_id,
            "Mock broker request"
        );

        let response = match api_key {
            ApiKey::ApiVersions => {
                ApiVersionsCodec::encode_response(&self.api_versions(injected), version)?
            }
            ApiKey::Metadata => {
                let request = MetadataCodec::decode_request(body, version)?;
                MetadataCodec::encode_response(&self.metadata(&request, injected), version)?
            }
            ApiKey::Produce => {
                let request = ProduceCodec::decode_request(body, version)?;
                let response = self.produce(node, &request, injected);
                if request.acks == 0 {
                    return Ok(None);
                }
                ProduceCodec::encode_response(&response, version)?
            }
            ApiKey::Fetch => {
                let request = FetchCodec::decode_request(body, version)?;
                let response = self.fetch(node, &request, version, injected).await;
                FetchCodec::encode_response(&response, version)?
            }
            ApiKey::ListOffsets => {
                let request = ListOffsetsCodec::decode_request(body, version)?;
                ListOffsetsCodec::encode_response(&self.list_offsets(node, &request, injected), version)?
            }
            ApiKey::FindCoordinator => {
                let request = FindCoordinatorCodec::decode_request(body, version)?;
                FindCoordinatorCodec::encode_response(&self.find_coordinator(&request, injected), version)?
            }
            ApiKey::InitProducerId => {
                let request = InitProducerIdCodec::decode_request(body, version)?;
                InitProducerIdCodec::encode_response(&self.init_producer_id(node, &request, injected), version)?
            }
            ApiKey::AddPartitionsToTxn => {
                let request = AddPartitionsToTxnCodec::decode_request(body, version)?;
                AddPartitionsToTxnCodec::encode_response(
                    &self.add_partitions_to_txn(node, &request, injected),
                    version,
                )?
            }
            ApiKey::EndTxn => {
                let request = EndTxnCodec::decode_request(body, version)?;
                EndTxnCodec::encode_response(&self.end_txn(node, &request, injected), version)?
            }
        };
        Ok(Some(response))
    }

    // ========================================================================
    // Cluster APIs
    // ========================================================================

    fn api_versions(&self, injected: Option<KafkaCode>) -> ApiVersionsResponse {
        let overrides = lock(&self.max_versions);
        ApiVersionsResponse {
            error_code: injected.unwrap_or(KafkaCode::None),
            api_versions: ApiKey::ALL
                .iter()
                .map(|&key| {
                    let (min, max) = key.version_range();
                    ApiVersionRange {
                        api_key: key as i16,
                        min_version: min,
                        max_version: overrides.get(&key).copied().unwrap_or(max),
                    }
                })
                .collect(),
            throttle_time_ms: 0,
        }
    }

    fn metadata(&self, request: &MetadataRequest, injected: Option<KafkaCode>) -> MetadataResponse {
        let inner = lock(&self.inner);
        let names: Vec<String> = match &request.topics {
            None => inner.topics.keys().cloned().collect(),
            Some(names) => names.clone(),
        };
        let nodes = self.node_count();

        let topics = names
            .into_iter()
            .map(|name| match inner.topics.get(&name) {
                Some(partitions) => TopicMetadata {
                    error_code: KafkaCode::None,
                    name,
                    is_internal: false,
                    partitions: (0..partitions.len() as i32)
                        .map(|p| {
                            let leader = p % nodes;
                            match injected {
                                Some(code) => PartitionMetadata {
                                    error_code: code,
                                    partition_index: p,
                                    leader_id: BrokerId::INVALID,
                                    replica_nodes: vec![leader],
                                    isr_nodes: vec![],
                                    offline_replicas: vec![],
                                },
                                None => PartitionMetadata {
                                    error_code: KafkaCode::None,
                                    partition_index: p,
                                    leader_id: BrokerId::new(leader),
                                    replica_nodes: vec![leader],
                                    isr_nodes: vec![leader],
                                    offline_replicas: vec![],
                                },
                            }
                        })
                        .collect(),
                },
                None => TopicMetadata {
                    error_code: KafkaCode::UnknownTopicOrPartition,
                    name,
                    is_internal: false,
                    partitions: vec![],
                },
            })
            .collect();

        MetadataResponse {
            throttle_time_ms: 0,
            brokers: self.nodes.read().map(|n| n.clone()).unwrap_or_default(),
            cluster_id: Some("mock-cluster".to_string()),
            controller_id: BrokerId::new(0),
            topics,
        }
    }

    fn find_coordinator(
        &self,
        _request: &FindCoordinatorRequest,
        injected: Option<KafkaCode>,
    ) -> FindCoordinatorResponse {
        if let Some(code) = injected {
            return FindCoordinatorResponse::error(code);
        }
        let nodes = self.nodes.read().map(|n| n.clone()).unwrap_or_default();
        match nodes.iter().find(|n| n.node_id.value() == COORDINATOR_NODE) {
            Some(node) => FindCoordinatorResponse {
                throttle_time_ms: 0,
                error_code: KafkaCode::None,
                error_message: None,
                node_id: node.node_id,
                host: node.host.clone(),
                port: node.port,
            },
            None => FindCoordinatorResponse::error(KafkaCode::CoordinatorNotAvailable),
        }
    }

    // ========================================================================
    // Data APIs
    // ========================================================================

    fn produce(&self, node: i32, request: &ProduceRequest, injected: Option<KafkaCode>) -> ProduceResponse {
        let mut inner = lock(&self.inner);
        let mut responses = Vec::with_capacity(request.topics.len());

        for topic in &request.topics {
            let mut partitions = Vec::with_capacity(topic.partitions.len());
            for data in &topic.partitions {
                let p = data.partition_index;
                let result = if let Some(code) = injected {
                    Err(code)
                } else if self.leader_of(p) != node {
                    Err(KafkaCode::NotLeaderForPartition)
                } else {
                    self.append(&mut inner, request, &topic.name, p, data.records.clone())
                };
                partitions.push(match result {
                    Ok(base_offset) => ProducePartitionResponse::success(p, base_offset),
                    Err(code) => {
                        tracing::debug!(topic = %topic.name, partition = p, error = ?code, "Mock produce rejected");
                        ProducePartitionResponse::error(p, code)
                    }
                });
            }
            responses.push(ProduceTopicResponse {
                name: topic.name.clone(),
                partitions,
            });
        }
        drop(inner);
        self.appended.notify_waiters();

        ProduceResponse {
            responses,
            throttle_time_ms: 0,
        }
    }

    fn append(
        &self,
        inner: &mut Inner,
        request: &ProduceRequest,
        topic: &str,
        partition: i32,
        records: Bytes,
    ) -> std::result::Result<i64, KafkaCode> {
        let set = decode_records(records).map_err(|_| KafkaCode::CorruptMessage)?;
        if set.partial_trailing {
            return Err(KafkaCode::CorruptMessage);
        }

        if let Some(txn_id) = request.transactional_id.as_deref() {
            let tp = TopicPartition::new(topic, partition);
            let registered = inner.transactions.get(txn_id).is_some_and(|entry| {
                entry.partitions.contains(&tp)
                    && set.batches.iter().all(|b| {
                        b.producer_id == entry.producer_id && b.producer_epoch == entry.epoch
                    })
            });
            if !registered {
                return Err(KafkaCode::InvalidTxnState);
            }
        }

        let log = inner
            .partition_mut(topic, partition)
            .ok_or(KafkaCode::UnknownTopicOrPartition)?;
        log.append_batches(set.batches)
    }

    async fn fetch(
        &self,
        node: i32,
        request: &FetchRequest,
        version: i16,
        injected: Option<KafkaCode>,
    ) -> FetchResponse {
        let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms.max(0) as u64);
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let response = self.read_fetch(node, request, version, injected);
            let bytes: usize = response
                .responses
                .iter()
                .flat_map(|t| t.partitions.iter().map(|p| p.records.len()))
                .sum();
            let has_error = response
                .responses
                .iter()
                .flat_map(|t| t.partitions.iter())
                .any(|p| p.error_code != KafkaCode::None);

            if has_error || bytes >= request.min_bytes.max(0) as usize || Instant::now() >= deadline {
                return response;
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return self.read_fetch(node, request, version, None);
            }
        }
    }

    fn read_fetch(
        &self,
        node: i32,
        request: &FetchRequest,
        version: i16,
        injected: Option<KafkaCode>,
    ) -> FetchResponse {
        let inner = lock(&self.inner);
        let magic = magic_for_fetch_version(version);
        let isolation = if version >= 4 {
            request.isolation_level
        } else {
            IsolationLevel::ReadUncommitted
        };

        let responses = request
            .topics
            .iter()
            .map(|topic| FetchTopicResponse {
                topic: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|fp| {
                        let p = fp.partition;
                        if let Some(code) = injected {
                            return FetchPartitionResponse::error(p, code);
                        }
                        if self.leader_of(p) != node {
                            return FetchPartitionResponse::error(p, KafkaCode::NotLeaderForPartition);
                        }
                        let Some(log) = inner.partition(&topic.name, p) else {
                            return FetchPartitionResponse::error(p, KafkaCode::UnknownTopicOrPartition);
                        };
                        let max_bytes = fp.partition_max_bytes.max(0) as usize;
                        match log.read(fp.fetch_offset, max_bytes, magic, isolation) {
                            Ok(read) => FetchPartitionResponse {
                                partition_index: p,
                                error_code: KafkaCode::None,
                                high_watermark: log.high_watermark(),
                                last_stable_offset: log.last_stable_offset(),
                                log_start_offset: log.log_start_offset(),
                                aborted_transactions: Some(read.aborted),
                                records: read.records,
                            },
                            Err(code) => FetchPartitionResponse {
                                high_watermark: log.high_watermark(),
                                ..FetchPartitionResponse::error(p, code)
                            },
                        }
                    })
                    .collect(),
            })
            .collect();

        FetchResponse {
            throttle_time_ms: 0,
            error_code: KafkaCode::None,
            session_id: 0,
            responses,
        }
    }

    fn list_offsets(
        &self,
        node: i32,
        request: &ListOffsetsRequest,
        injected: Option<KafkaCode>,
    ) -> ListOffsetsResponse {
        let inner = lock(&self.inner);
        let topics = request
            .topics
            .iter()
            .map(|topic| ListOffsetsTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|lp| {
                        let p = lp.partition_index;
                        let error = |code| ListOffsetsPartitionResponse {
                            partition_index: p,
                            error_code: code,
                            timestamp: -1,
                            offset: -1,
                        };
                        if let Some(code) = injected {
                            return error(code);
                        }
                        if self.leader_of(p) != node {
                            return error(KafkaCode::NotLeaderForPartition);
                        }
                        let Some(log) = inner.partition(&topic.name, p) else {
                            return error(KafkaCode::UnknownTopicOrPartition);
                        };
                        let offset = match lp.timestamp {
                            OFFSET_NEWEST => match request.isolation_level {
                                IsolationLevel::ReadCommitted => log.last_stable_offset(),
                                IsolationLevel::ReadUncommitted => log.high_watermark(),
                            },
                            OFFSET_OLDEST => log.log_start_offset(),
                            ts => log.offset_for_time(ts),
                        };
                        ListOffsetsPartitionResponse {
                            partition_index: p,
                            error_code: KafkaCode::None,
                            timestamp: -1,
                            offset,
                        }
                    })
                    .collect(),
            })
            .collect();

        ListOffsetsResponse {
            throttle_time_ms: 0,
            topics,
        }
    }

    // ========================================================================
    // Transaction APIs
    // ========================================================================

    fn init_producer_id(
        &self,
        node: i32,
        request: &InitProducerIdRequest,
        injected: Option<KafkaCode>,
    ) -> InitProducerIdResponse {
        let error = |code| InitProducerIdResponse {
            throttle_time_ms: 0,
            error_code: code,
            producer_id: ProducerId::INVALID,
            producer_epoch: ProducerEpoch::INVALID,
        };
        if let Some(code) = injected {
            return error(code);
        }

        let mut inner = lock(&self.inner);
        let (producer_id, epoch) = match request.transactional_id.as_deref() {
            None => {
                let id = inner.next_producer_id;
                inner.next_producer_id += 1;
                (id, 0)
            }
            Some(_) if node != COORDINATOR_NODE => return error(KafkaCode::NotCoordinator),
            Some(txn_id) => {
                // a re-initialised id fences the previous session and aborts its transaction
                inner.finish_txn(txn_id, ControlRecordType::Abort);
                let fresh_id = inner.next_producer_id;
                let entry = inner
                    .transactions
                    .entry(txn_id.to_string())
                    .and_modify(|e| e.epoch += 1)
                    .or_insert(TxnEntry {
                        producer_id: fresh_id,
                        epoch: 0,
                        partitions: BTreeSet::new(),
                    });
                let assigned = (entry.producer_id, entry.epoch);
                if assigned.0 == fresh_id {
                    inner.next_producer_id += 1;
                }
                assigned
            }
        };
        drop(inner);
        self.appended.notify_waiters();

        InitProducerIdResponse {
            throttle_time_ms: 0,
            error_code: KafkaCode::None,
            producer_id: ProducerId::new(producer_id),
            producer_epoch: ProducerEpoch::new(epoch),
        }
    }

    /// Checks that `(producer_id, epoch)` is the live session of `txn_id`.
    fn check_session(
        inner: &Inner,
        txn_id: &str,
        producer_id: ProducerId,
        epoch: ProducerEpoch,
    ) -> std::result::Result<(), KafkaCode> {
        match inner.transactions.get(txn_id) {
            None => Err(KafkaCode::InvalidProducerIdMapping),
            Some(entry) if entry.producer_id != producer_id.value() => {
                Err(KafkaCode::InvalidProducerIdMapping)
            }
            Some(entry) if entry.epoch != epoch.value() => Err(KafkaCode::ProducerFenced),
            Some(_) => Ok(()),
        }
    }

    fn add_partitions_to_txn(
        &self,
        node: i32,
        request: &AddPartitionsToTxnRequest,
        injected: Option<KafkaCode>,
    ) -> AddPartitionsToTxnResponse {
        let mut inner = lock(&self.inner);
        let session = if node != COORDINATOR_NODE {
            Err(KafkaCode::NotCoordinator)
        } else {
            Self::check_session(
                &inner,
                &request.transactional_id,
                request.producer_id,
                request.producer_epoch,
            )
        };

        let results = request
            .topics
            .iter()
            .map(|topic| AddPartitionsToTxnTopicResult {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|&p| {
                        let code = match (injected, session) {
                            (Some(code), _) => code,
                            (None, Err(code)) => code,
                            (None, Ok(())) if inner.partition(&topic.name, p).is_none() => {
                                KafkaCode::UnknownTopicOrPartition
                            }
                            (None, Ok(())) => {
                                if let Some(entry) =
                                    inner.transactions.get_mut(&request.transactional_id)
                                {
                                    entry.partitions.insert(TopicPartition::new(&topic.name, p));
                                }
                                KafkaCode::None
                            }
                        };
                        (p, code)
                    })
                    .collect(),
            })
            .collect();

        AddPartitionsToTxnResponse {
            throttle_time_ms: 0,
            results,
        }
    }

    fn end_txn(&self, node: i32, request: &EndTxnRequest, injected: Option<KafkaCode>) -> EndTxnResponse {
        let respond = |code| EndTxnResponse {
            throttle_time_ms: 0,
            error_code: code,
        };
        if let Some(code) = injected {
            return respond(code);
        }
        if node != COORDINATOR_NODE {
            return respond(KafkaCode::NotCoordinator);
        }

        let mut inner = lock(&self.inner);
        if let Err(code) = Self::check_session(
            &inner,
            &request.transactional_id,
            request.producer_id,
            request.producer_epoch,
        ) {
            return respond(code);
        }
        let kind = if request.committed {
            ControlRecordType::Commit
        } else {
            ControlRecordType::Abort
        };
        inner.finish_txn(&request.transactional_id, kind);
        drop(inner);
        self.appended.notify_waiters();

        tracing::debug!(
            transactional_id = %request.transactional_id,
            committed = request.committed,
            "Mock transaction ended"
        );
        respond(KafkaCode::None)
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }
}
