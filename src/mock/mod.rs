//! In-process mock cluster for tests.
//!
//! Each node listens on its own loopback port and speaks the real wire
//! protocol, so clients under test exercise their full transport and codec
//! stack. Partition `p` is led by node `p % nodes`; node 0 coordinates every
//! transaction.
//!
//! ```rust,no_run
//! # async fn example() -> kafkaesque_client::error::Result<()> {
//! use kafkaesque_client::mock::MockCluster;
//!
//! let cluster = MockCluster::start(3).await?;
//! cluster.create_topic("events", 6);
//! let seeds = cluster.addrs();
//! # Ok(())
//! # }
//! ```
//!
//! Supported: ApiVersions, Metadata, Produce (idempotent sequence checks,
//! transactional registration), Fetch (long polling, down-conversion,
//! aborted transactions), ListOffsets, FindCoordinator, InitProducerId,
//! AddPartitionsToTxn and EndTxn. [`MockCluster::inject_error`] makes the next
//! request of an API fail with a given code.

mod log;
mod state;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use nombytes::NomBytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::codec::{ApiKey, MetadataBroker, encode_response_frame, parse_request_header};
use crate::compression::CompressionCodec;
use crate::error::{Error, KafkaCode, Result};
use crate::network::{read_frame, write_frame};
use crate::records::{ControlRecordType, RecordData};
use crate::types::BrokerId;
use state::{ClusterState, lock};

/// Summary of a batch stored by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBatch {
    pub base_offset: i64,
    pub last_offset: i64,
    pub codec: CompressionCodec,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub base_sequence: i32,
    pub transactional: bool,
    pub control: Option<ControlRecordType>,
    pub values: Vec<Option<Bytes>>,
}

/// A running mock cluster. Dropping it stops every node.
pub struct MockCluster {
    state: Arc<ClusterState>,
    addrs: Vec<String>,
    shutdown: broadcast::Sender<()>,
}

impl MockCluster {
    /// Starts `nodes` brokers on ephemeral loopback ports.
    pub async fn start(nodes: usize) -> Result<MockCluster> {
        let state = Arc::new(ClusterState::new());
        let (shutdown, _) = broadcast::channel(1);

        let mut listeners = Vec::with_capacity(nodes.max(1));
        for _ in 0..nodes.max(1) {
            listeners.push(TcpListener::bind("127.0.0.1:0").await?);
        }

        let mut addrs = Vec::with_capacity(listeners.len());
        let mut brokers = Vec::with_capacity(listeners.len());
        for (id, listener) in listeners.iter().enumerate() {
            let local = listener.local_addr()?;
            addrs.push(local.to_string());
            brokers.push(MetadataBroker {
                node_id: BrokerId::new(id as i32),
                host: local.ip().to_string(),
                port: i32::from(local.port()),
                rack: None,
            });
        }
        if let Ok(mut nodes) = state.nodes.write() {
            *nodes = brokers;
        }

        for (id, listener) in listeners.into_iter().enumerate() {
            tokio::spawn(accept_loop(
                id as i32,
                listener,
                state.clone(),
                shutdown.subscribe(),
            ));
        }

        tracing::debug!(nodes = addrs.len(), "Mock cluster started");
        Ok(MockCluster {
            state,
            addrs,
            shutdown,
        })
    }

    pub fn addr(&self, node: usize) -> String {
        self.addrs[node % self.addrs.len()].clone()
    }

    /// Every node's address, usable as a seed list.
    pub fn addrs(&self) -> Vec<String> {
        self.addrs.clone()
    }

    /// Creates (or resets) a topic with empty partitions.
    pub fn create_topic(&self, name: &str, partitions: i32) {
        let logs = (0..partitions.max(1)).map(|_| Default::default()).collect();
        lock(&self.state.inner).topics.insert(name.to_string(), logs);
    }

    /// The next request of `api_key` fails with `code`. Calls queue up.
    pub fn inject_error(&self, api_key: ApiKey, code: KafkaCode) {
        self.state.inject(api_key, code);
    }

    /// Caps the version advertised through ApiVersions.
    pub fn set_max_api_version(&self, api_key: ApiKey, max: i16) {
        self.state.set_max_version(api_key, max);
    }

    /// Connections accepted over the cluster's lifetime.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn request_count(&self, api_key: ApiKey) -> usize {
        self.state.request_count(api_key)
    }

    /// Appends records directly to a partition, bypassing the wire. Returns
    /// the base offset.
    pub fn append(&self, topic: &str, partition: i32, records: Vec<RecordData>) -> Result<i64> {
        let mut inner = lock(&self.state.inner);
        let log = inner
            .partition_mut(topic, partition)
            .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?;
        let base = log.append_records(records);
        drop(inner);
        self.state.appended.notify_waiters();
        Ok(base)
    }

    pub fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state.inner)
            .partition(topic, partition)
            .map(|log| log.high_watermark())
    }

    pub fn last_stable_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state.inner)
            .partition(topic, partition)
            .map(|log| log.last_stable_offset())
    }

    /// Every stored batch of a partition, markers included.
    pub fn batches(&self, topic: &str, partition: i32) -> Vec<MockBatch> {
        let inner = lock(&self.state.inner);
        let Some(log) = inner.partition(topic, partition) else {
            return Vec::new();
        };
        log.batches()
            .iter()
            .map(|b| MockBatch {
                base_offset: b.meta.base_offset,
                last_offset: b.last_offset,
                codec: b.meta.codec,
                producer_id: b.meta.producer_id,
                producer_epoch: b.meta.producer_epoch,
                base_sequence: b.meta.base_sequence,
                transactional: b.meta.transactional,
                control: b.control,
                values: b.records.iter().map(|r| r.value.clone()).collect(),
            })
            .collect()
    }

    /// Stops accepting connections and closes the open ones.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    node: i32,
    listener: TcpListener,
    state: Arc<ClusterState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(node, "Mock broker shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(node, error = %e, "Mock broker accept failed");
                        return;
                    }
                };
                tracing::debug!(node, client_addr = %addr, "Accepted connection");
                state.connection_opened();
                tokio::spawn(serve_connection(node, stream, state.clone(), shutdown.resubscribe()));
            }
        }
    }
}

/// Handles requests one at a time so responses leave in request order.
async fn serve_connection(
    node: i32,
    stream: TcpStream,
    state: Arc<ClusterState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => return,
            frame = read_frame(&mut reader) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(node, error = %e, "Mock connection read failed");
                return;
            }
        };

        let (body, header) = match parse_request_header(NomBytes::new(frame)) {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(node, "Malformed request header, closing connection");
                return;
            }
        };

        match state.handle(node, &header, body.into_bytes()).await {
            Ok(Some(response)) => {
                let frame = encode_response_frame(header.correlation_id, &response);
                if write_frame(&mut writer, &frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(node, error = %e, "Mock broker failed request, closing connection");
                return;
            }
        }
    }
}
