use std::sync::Arc;

use futures::future::join_all;

use super::txn::TransactionStatus;
use super::{AsyncProducer, ProducerMessage};
use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// Waits for each message to be acknowledged.
///
/// Runs an [`AsyncProducer`] underneath; results come back to the caller
/// directly, so `return_successes` and `return_errors` do not apply.
#[derive(Debug)]
pub struct SyncProducer {
    inner: AsyncProducer,
}

impl SyncProducer {
    pub async fn new<S: AsRef<str>>(addrs: &[S], config: ClientConfig) -> Result<SyncProducer> {
        Ok(SyncProducer {
            inner: AsyncProducer::new(addrs, config).await?,
        })
    }

    pub async fn from_client(client: Arc<Client>) -> Result<SyncProducer> {
        Ok(SyncProducer {
            inner: AsyncProducer::from_client(client).await?,
        })
    }

    pub fn client(&self) -> &Arc<Client> {
        self.inner.client()
    }

    /// Produces `message` and returns it with `partition` and `offset` set.
    pub async fn send_message(&self, message: ProducerMessage) -> Result<ProducerMessage> {
        let reply = self.inner.send_with_reply(message).await?;
        match reply.await {
            Ok(Ok(delivered)) => Ok(delivered),
            Ok(Err(failed)) => Err(failed.error),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Produces every message, batching them together where the flush
    /// settings allow. Fails with the first error; messages to other
    /// partitions may still have been written.
    pub async fn send_messages(&self, messages: Vec<ProducerMessage>) -> Result<Vec<ProducerMessage>> {
        let mut replies = Vec::with_capacity(messages.len());
        for message in messages {
            replies.push(self.inner.send_with_reply(message).await?);
        }
        self.inner.flush().await?;

        join_all(replies)
            .await
            .into_iter()
            .map(|reply| match reply {
                Ok(Ok(delivered)) => Ok(delivered),
                Ok(Err(failed)) => Err(failed.error),
                Err(_) => Err(Error::Closed),
            })
            .collect()
    }

    pub fn is_transactional(&self) -> bool {
        self.inner.is_transactional()
    }

    pub async fn txn_status(&self) -> TransactionStatus {
        self.inner.txn_status().await
    }

    pub async fn begin_txn(&self) -> Result<()> {
        self.inner.begin_txn().await
    }

    pub async fn commit_txn(&self) -> Result<()> {
        self.inner.commit_txn().await
    }

    pub async fn abort_txn(&self) -> Result<()> {
        self.inner.abort_txn().await
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
