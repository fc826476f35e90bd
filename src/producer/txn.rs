//! Producer identity, sequence numbers and transaction state.
//!
//! ```text
//! None ──begin──► Begun ──add partitions──► PartitionsAdded
//!   ▲                │                            │
//!   │             commit/abort               commit/abort
//!   │                ▼                            ▼
//!   └──begin── Committed | Aborted ◄──────────────┘
//!
//! any ──fenced──► Fatal ──abort (re-init)──► None
//! ```
//!
//! State lives behind a `tokio::sync::Mutex` so the dispatcher and the
//! per-broker send tasks see a single sequence counter per partition.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use backon::Retryable;
use tokio::sync::Mutex;

use crate::client::Client;
use crate::codec::{
    AddPartitionsToTxnRequest, AddPartitionsToTxnTopic, EndTxnRequest, InitProducerIdRequest,
};
use crate::error::{Error, KafkaCode, Result};
use crate::network::Broker;
use crate::retry;
use crate::types::{CoordinatorType, ProducerEpoch, ProducerId, TopicPartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No transaction has been started (or the producer was re-initialised).
    None,
    Begun,
    PartitionsAdded,
    Committed,
    Aborted,
    /// Fenced or otherwise broken; only `abort_txn` recovers.
    Fatal,
}

impl TransactionStatus {
    pub fn in_transaction(self) -> bool {
        matches!(self, TransactionStatus::Begun | TransactionStatus::PartitionsAdded)
    }
}

/// The producer identity a batch is written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSession {
    pub producer_id: ProducerId,
    pub producer_epoch: ProducerEpoch,
    pub transactional_id: Option<String>,
}

#[derive(Debug)]
struct TxnState {
    producer_id: ProducerId,
    producer_epoch: ProducerEpoch,
    sequences: HashMap<TopicPartition, i32>,
    status: TransactionStatus,
    partitions: BTreeSet<TopicPartition>,
    /// First delivery failure inside the current transaction.
    failure: Option<Error>,
}

impl TxnState {
    fn session(&self, transactional_id: &Option<String>) -> ProducerSession {
        ProducerSession {
            producer_id: self.producer_id,
            producer_epoch: self.producer_epoch,
            transactional_id: transactional_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct TransactionManager {
    client: Arc<Client>,
    idempotent: bool,
    transactional_id: Option<String>,
    timeout_ms: i32,
    state: Mutex<TxnState>,
}

impl TransactionManager {
    /// Builds the manager from the client's producer config and, for an
    /// idempotent producer, obtains a producer id.
    pub async fn new(client: Arc<Client>) -> Result<TransactionManager> {
        let config = client.config().producer.clone();
        let manager = TransactionManager {
            idempotent: config.idempotent,
            transactional_id: config.transaction.id.clone(),
            timeout_ms: i32::try_from(config.transaction.timeout.as_millis()).unwrap_or(i32::MAX),
            client,
            state: Mutex::new(TxnState {
                producer_id: ProducerId::INVALID,
                producer_epoch: ProducerEpoch::INVALID,
                sequences: HashMap::new(),
                status: TransactionStatus::None,
                partitions: BTreeSet::new(),
                failure: None,
            }),
        };
        if manager.idempotent {
            manager.init_producer_id().await?;
        }
        Ok(manager)
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.is_some()
    }

    pub fn transactional_id(&self) -> Option<&str> {
        self.transactional_id.as_deref()
    }

    pub async fn status(&self) -> TransactionStatus {
        self.state.lock().await.status
    }

    /// The identity for new batches; `None` for a plain producer.
    pub async fn session(&self) -> Option<ProducerSession> {
        if !self.idempotent {
            return None;
        }
        Some(self.state.lock().await.session(&self.transactional_id))
    }

    // ========================================================================
    // Producer identity
    // ========================================================================

    async fn coordinator(&self) -> Result<Arc<Broker>> {
        match &self.transactional_id {
            Some(id) => {
                self.client
                    .coordinator_for(id, CoordinatorType::Transaction)
                    .await
            }
            None => self.client.any_broker(),
        }
    }

    /// Forgets the cached coordinator when `code` says it moved.
    fn coordinator_error(&self, code: KafkaCode) -> Error {
        match code {
            KafkaCode::CoordinatorNotAvailable | KafkaCode::NotCoordinator => {
                let key = self.transactional_id.clone().unwrap_or_default();
                self.client
                    .invalidate_coordinator(&key, CoordinatorType::Transaction);
                Error::CoordinatorNotAvailable(key)
            }
            code => Error::Kafka(code),
        }
    }

    /// Obtains a producer id and epoch. With a transactional id the
    /// coordinator bumps the epoch, fencing earlier sessions and aborting
    /// their open transaction. Sequences restart at zero.
    pub async fn init_producer_id(&self) -> Result<(ProducerId, ProducerEpoch)> {
        let mut state = self.state.lock().await;
        let request = InitProducerIdRequest {
            transactional_id: self.transactional_id.clone(),
            transaction_timeout_ms: self.timeout_ms,
        };

        let response = (|| async {
            let broker = self.coordinator().await?;
            let response = broker.init_producer_id(&request).await?;
            match response.error_code {
                KafkaCode::None => Ok(response),
                code => Err(self.coordinator_error(code)),
            }
        })
        .retry(retry::metadata_policy(self.client.config()))
        .when(Error::is_retriable)
        .notify(|err, delay| {
            tracing::warn!(error = %err, delay = ?delay, "InitProducerId failed, retrying");
        })
        .await?;

        state.producer_id = response.producer_id;
        state.producer_epoch = response.producer_epoch;
        state.sequences.clear();
        state.partitions.clear();
        state.failure = None;
        state.status = TransactionStatus::None;
        tracing::info!(
            producer_id = %response.producer_id,
            producer_epoch = %response.producer_epoch,
            transactional_id = ?self.transactional_id,
            "Producer id initialised"
        );
        Ok((response.producer_id, response.producer_epoch))
    }

    /// Returns the base sequence for `count` records on `tp` and advances the
    /// counter past them.
    pub async fn next_sequence(&self, tp: &TopicPartition, count: i32) -> i32 {
        let mut state = self.state.lock().await;
        let next = state.sequences.entry(tp.clone()).or_insert(0);
        let base = *next;
        *next = next.wrapping_add(count) & i32::MAX;
        base
    }

    /// Reacts to a batch written under `session` that failed for good: a
    /// fencing error, or any loss after its sequence was assigned. The
    /// broker never saw those sequences, so the partition can only continue
    /// under a new identity. An idempotent producer re-initialises; a
    /// transactional one becomes fatal until aborted.
    pub async fn reset_session(&self, session: &ProducerSession, error: &Error) {
        if self.is_transactional() {
            let mut state = self.state.lock().await;
            tracing::error!(error = %error, transactional_id = ?self.transactional_id, "Transactional batch lost, producer is fatal");
            state.status = TransactionStatus::Fatal;
            state.failure.get_or_insert_with(|| error.clone());
            return;
        }

        let current = {
            let state = self.state.lock().await;
            state.producer_id == session.producer_id && state.producer_epoch == session.producer_epoch
        };
        // several batches may fail under the same session; re-init once
        if current {
            tracing::warn!(error = %error, producer_id = %session.producer_id, "Sequenced batch lost, re-initialising producer id");
            if let Err(e) = self.init_producer_id().await {
                tracing::error!(error = %e, "Producer id re-initialisation failed");
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    fn require_transactional(&self) -> Result<&str> {
        self.transactional_id
            .as_deref()
            .ok_or_else(|| Error::Transaction("producer is not transactional".to_string()))
    }

    pub async fn begin(&self) -> Result<()> {
        self.require_transactional()?;
        let mut state = self.state.lock().await;
        match state.status {
            TransactionStatus::Fatal => Err(Error::Transaction(
                "producer is in a fatal state, abort to recover".to_string(),
            )),
            status if status.in_transaction() => Err(Error::Transaction(
                "a transaction is already in progress".to_string(),
            )),
            _ => {
                state.status = TransactionStatus::Begun;
                state.partitions.clear();
                state.failure = None;
                Ok(())
            }
        }
    }

    /// Rejects produces a transactional producer may not make right now.
    pub async fn check_can_produce(&self) -> Result<()> {
        if !self.is_transactional() {
            return Ok(());
        }
        let state = self.state.lock().await;
        match state.status {
            status if status.in_transaction() => Ok(()),
            TransactionStatus::Fatal => Err(Error::Transaction(
                "producer is in a fatal state, abort to recover".to_string(),
            )),
            _ => Err(Error::Transaction(
                "transactional producer can only produce inside a transaction".to_string(),
            )),
        }
    }

    pub async fn is_registered(&self, tp: &TopicPartition) -> bool {
        !self.is_transactional() || self.state.lock().await.partitions.contains(tp)
    }

    /// Remembers a delivery failure; a transaction with failures can only be
    /// aborted.
    pub async fn record_failure(&self, error: &Error) {
        if !self.is_transactional() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.status.in_transaction() {
            state.failure.get_or_insert_with(|| error.clone());
        }
    }

    /// Registers the partitions of `partitions` the coordinator does not know
    /// yet.
    pub async fn add_partitions_to_txn(&self, partitions: &[TopicPartition]) -> Result<()> {
        let transactional_id = self.require_transactional()?;
        let mut state = self.state.lock().await;
        if !state.status.in_transaction() {
            return Err(Error::Transaction(
                "partitions can only be added inside a transaction".to_string(),
            ));
        }

        let missing: BTreeSet<&TopicPartition> = partitions
            .iter()
            .filter(|tp| !state.partitions.contains(*tp))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let mut topics: Vec<AddPartitionsToTxnTopic> = Vec::new();
        for tp in &missing {
            match topics.last_mut() {
                Some(topic) if topic.name == tp.topic => topic.partitions.push(tp.partition),
                _ => topics.push(AddPartitionsToTxnTopic {
                    name: tp.topic.clone(),
                    partitions: vec![tp.partition],
                }),
            }
        }
        let request = AddPartitionsToTxnRequest {
            transactional_id: transactional_id.to_string(),
            producer_id: state.producer_id,
            producer_epoch: state.producer_epoch,
            topics,
        };

        let result = (|| async {
            let broker = self.coordinator().await?;
            let response = broker.add_partitions_to_txn(&request).await?;
            for (topic, partition, code) in response.errors() {
                match code {
                    KafkaCode::None => {}
                    KafkaCode::CoordinatorNotAvailable | KafkaCode::NotCoordinator => {
                        return Err(self.coordinator_error(code));
                    }
                    code if code.is_sequence_fencing()
                        || code == KafkaCode::InvalidProducerIdMapping =>
                    {
                        return Err(Error::SequenceFencing {
                            topic: topic.to_string(),
                            partition,
                            code,
                        });
                    }
                    code => return Err(Error::from_code(code, &TopicPartition::new(topic, partition))),
                }
            }
            Ok(())
        })
        .retry(retry::metadata_policy(self.client.config()))
        .when(Error::is_retriable)
        .notify(|err, delay| {
            tracing::warn!(error = %err, delay = ?delay, "AddPartitionsToTxn failed, retrying");
        })
        .await;

        match result {
            Ok(()) => {
                for tp in missing {
                    tracing::debug!(transactional_id, partition = %tp, "Partition added to transaction");
                    state.partitions.insert(tp.clone());
                }
                state.status = TransactionStatus::PartitionsAdded;
                Ok(())
            }
            Err(e @ Error::SequenceFencing { .. }) => {
                tracing::error!(error = %e, transactional_id, "Producer fenced while adding partitions");
                state.status = TransactionStatus::Fatal;
                state.failure.get_or_insert_with(|| e.clone());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Partitions registered in the current transaction.
    pub async fn partitions(&self) -> Vec<TopicPartition> {
        self.state.lock().await.partitions.iter().cloned().collect()
    }

    /// Commits or aborts the current transaction. The caller flushes first.
    ///
    /// Aborting a fatal producer re-initialises its id instead, which makes
    /// the coordinator abort whatever the fenced session left open.
    pub async fn end_txn(&self, commit: bool) -> Result<()> {
        let transactional_id = self.require_transactional()?;

        let status = self.state.lock().await.status;
        if status == TransactionStatus::Fatal {
            if commit {
                return Err(Error::Transaction(
                    "producer is in a fatal state, abort to recover".to_string(),
                ));
            }
            self.init_producer_id().await?;
            self.state.lock().await.status = TransactionStatus::Aborted;
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if !state.status.in_transaction() {
            return Err(Error::Transaction("no transaction in progress".to_string()));
        }
        if commit {
            if let Some(failure) = &state.failure {
                return Err(Error::Transaction(format!(
                    "transaction has failed records ({}), abort it",
                    failure
                )));
            }
        }

        let ended = if commit {
            TransactionStatus::Committed
        } else {
            TransactionStatus::Aborted
        };
        if state.partitions.is_empty() {
            state.status = ended;
            return Ok(());
        }

        let fenced_on = state
            .partitions
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| TopicPartition::new(transactional_id, -1));
        let request = EndTxnRequest {
            transactional_id: transactional_id.to_string(),
            producer_id: state.producer_id,
            producer_epoch: state.producer_epoch,
            committed: commit,
        };
        let result = (|| async {
            let broker = self.coordinator().await?;
            let response = broker.end_txn(&request).await?;
            match response.error_code {
                KafkaCode::None => Ok(()),
                code if code.is_sequence_fencing() || code == KafkaCode::InvalidProducerIdMapping => {
                    Err(Error::SequenceFencing {
                        topic: fenced_on.topic.clone(),
                        partition: fenced_on.partition,
                        code,
                    })
                }
                code => Err(self.coordinator_error(code)),
            }
        })
        .retry(retry::metadata_policy(self.client.config()))
        .when(Error::is_retriable)
        .notify(|err, delay| {
            tracing::warn!(error = %err, delay = ?delay, "EndTxn failed, retrying");
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(transactional_id, commit, partitions = state.partitions.len(), "Transaction ended");
                state.partitions.clear();
                state.status = ended;
                Ok(())
            }
            Err(e @ Error::SequenceFencing { .. }) => {
                tracing::error!(error = %e, transactional_id, "Producer fenced while ending transaction");
                state.status = TransactionStatus::Fatal;
                state.failure.get_or_insert_with(|| e.clone());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
