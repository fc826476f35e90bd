//! A broker node and its (lazily opened) connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use nombytes::NomBytes;
use tokio::sync::Mutex;

use super::Connection;
use crate::codec::{
    AddPartitionsToTxnCodec, AddPartitionsToTxnRequest, AddPartitionsToTxnResponse, ApiKey,
    ApiVersionsCodec, ApiVersionsRequest, ApiVersionsResponse, EndTxnCodec, EndTxnRequest,
    EndTxnResponse, FetchCodec, FetchRequest, FetchResponse, FindCoordinatorCodec,
    FindCoordinatorRequest, FindCoordinatorResponse, InitProducerIdCodec, InitProducerIdRequest,
    InitProducerIdResponse, KafkaCodec, ListOffsetsCodec, ListOffsetsRequest, ListOffsetsResponse,
    MetadataCodec, MetadataRequest, MetadataResponse, ProduceCodec, ProduceRequest,
    ProduceResponse, check_version,
};
use crate::config::ClientConfig;
use crate::error::{Error, KafkaCode, Result};
use crate::types::{BrokerId, RequiredAcks};

/// A broker node. Shared via `Arc`; all requests to the node multiplex over
/// one [`Connection`], which is replaced when it dies or goes idle.
pub struct Broker {
    id: BrokerId,
    addr: String,
    config: Arc<ClientConfig>,
    conn: Mutex<Option<Arc<Connection>>>,
    /// `api_key -> (min, max)` advertised by the broker, when negotiated.
    versions: RwLock<Option<HashMap<i16, (i16, i16)>>>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish()
    }
}

impl Broker {
    pub fn new(id: BrokerId, addr: impl Into<String>, config: Arc<ClientConfig>) -> Broker {
        Broker {
            id,
            addr: addr.into(),
            config,
            conn: Mutex::new(None),
            versions: RwLock::new(None),
        }
    }

    /// Node id, or [`BrokerId::INVALID`] for a seed broker not yet seen in metadata.
    pub fn id(&self) -> BrokerId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.is_alive())
    }

    /// Returns the live connection, dialling a new one if there is none or
    /// the current one is dead or idle past `net.idle_timeout`.
    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_alive() && conn.idle_for() < self.config.net.idle_timeout {
                return Ok(conn.clone());
            }
            tracing::debug!(
                broker = %self.addr,
                alive = conn.is_alive(),
                "Replacing broker connection"
            );
            let stale = conn.clone();
            tokio::spawn(async move { stale.close().await });
        }
        *guard = None;

        let conn = Arc::new(Connection::open(&self.addr, &self.config).await?);
        if self.config.version.supports_api_versions() {
            self.negotiate(&conn).await?;
        }
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn negotiate(&self, conn: &Connection) -> Result<()> {
        let version = self.config.version.api_versions_version();
        let body = ApiVersionsCodec::encode_request(&ApiVersionsRequest, version)?;
        let payload = conn.send(ApiKey::ApiVersions, version, &body).await?;
        let response = ApiVersionsCodec::decode_response(NomBytes::new(payload), version)?;

        let code = response.error_code;
        if code != KafkaCode::None {
            // brokers that cannot answer our version are treated as unknown
            tracing::warn!(broker = %self.addr, error = ?code, "ApiVersions negotiation failed");
            return Ok(());
        }

        let ranges = response
            .api_versions
            .iter()
            .map(|r| (r.api_key, (r.min_version, r.max_version)))
            .collect::<HashMap<_, _>>();
        tracing::debug!(broker = %self.addr, apis = ranges.len(), "Negotiated API versions");
        if let Ok(mut versions) = self.versions.write() {
            *versions = Some(ranges);
        }
        Ok(())
    }

    /// Fails when the broker advertised a range that excludes `version`.
    fn check_advertised(&self, api_key: ApiKey, version: i16) -> Result<()> {
        let versions = self.versions.read().map_err(|_| Error::Closed)?;
        let Some(ranges) = versions.as_ref() else {
            return Ok(());
        };
        match ranges.get(&(api_key as i16)) {
            Some(&(min, max)) if version >= min && version <= max => Ok(()),
            Some(&(min, max)) => Err(Error::UnsupportedVersion(format!(
                "{} v{} (broker {} supports {}-{})",
                api_key, version, self.addr, min, max
            ))),
            None => Err(Error::UnsupportedVersion(format!(
                "{} not supported by broker {}",
                api_key, self.addr
            ))),
        }
    }

    /// Sends any codec's request at an explicit version.
    pub async fn send<C: KafkaCodec>(
        &self,
        request: &C::Request,
        version: i16,
    ) -> Result<C::Response> {
        check_version::<C>(version)?;
        let body = C::encode_request(request, version)?;
        let conn = self.connection().await?;
        self.check_advertised(C::api_key(), version)?;
        let payload = conn.send(C::api_key(), version, &body).await?;
        C::decode_response(NomBytes::new(payload), version)
    }

    pub async fn api_versions(&self) -> Result<ApiVersionsResponse> {
        self.send::<ApiVersionsCodec>(&ApiVersionsRequest, self.config.version.api_versions_version())
            .await
    }

    pub async fn metadata(&self, request: &MetadataRequest) -> Result<MetadataResponse> {
        self.send::<MetadataCodec>(request, self.config.version.metadata_version())
            .await
    }

    /// Sends a produce request. With `acks = 0` the broker sends nothing back
    /// and `Ok(None)` is returned once the request is written.
    pub async fn produce(&self, request: &ProduceRequest) -> Result<Option<ProduceResponse>> {
        let version = self.config.version.produce_version();
        if RequiredAcks::from_i16(request.acks) != RequiredAcks::NoResponse {
            return self.send::<ProduceCodec>(request, version).await.map(Some);
        }

        check_version::<ProduceCodec>(version)?;
        let body = ProduceCodec::encode_request(request, version)?;
        let conn = self.connection().await?;
        self.check_advertised(ApiKey::Produce, version)?;
        conn.send_oneway(ApiKey::Produce, version, &body).await?;
        Ok(None)
    }

    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.send::<FetchCodec>(request, self.config.version.fetch_version())
            .await
    }

    pub async fn list_offsets(&self, request: &ListOffsetsRequest) -> Result<ListOffsetsResponse> {
        self.send::<ListOffsetsCodec>(request, self.config.version.list_offsets_version())
            .await
    }

    pub async fn find_coordinator(
        &self,
        request: &FindCoordinatorRequest,
    ) -> Result<FindCoordinatorResponse> {
        self.send::<FindCoordinatorCodec>(request, self.config.version.find_coordinator_version())
            .await
    }

    pub async fn init_producer_id(
        &self,
        request: &InitProducerIdRequest,
    ) -> Result<InitProducerIdResponse> {
        self.send::<InitProducerIdCodec>(request, self.config.version.transaction_api_version())
            .await
    }

    pub async fn add_partitions_to_txn(
        &self,
        request: &AddPartitionsToTxnRequest,
    ) -> Result<AddPartitionsToTxnResponse> {
        self.send::<AddPartitionsToTxnCodec>(request, self.config.version.transaction_api_version())
            .await
    }

    pub async fn end_txn(&self, request: &EndTxnRequest) -> Result<EndTxnResponse> {
        self.send::<EndTxnCodec>(request, self.config.version.transaction_api_version())
            .await
    }

    /// Closes the current connection, if any. The next request reconnects.
    pub async fn close(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }
}
