//! Announcement engine for the content-routing network.
//!
//! Reconciliation only talks to [`AdvertisementClient`]. The routing network
//! calls back into the resolution hook ([`ContextResolver`]) when it wants the
//! multihashes behind a previously published context id.

use crate::context_id::{self, ContextId};
use crate::cursor::MultihashCursor;
use crate::error::{BeaconError, Result};
use crate::storage::{AddrInfo, AdvertisementStore, ContentCatalog};
use crate::{Multihash, sha2_256_multihash};
use async_trait::async_trait;
use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Capability announced with every advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Metadata {
    /// Bulk transfer over the generic block exchange protocol.
    Bitswap,
}

/// Sha2-256 multihash of an advertisement record; hex in text form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertisementId(Multihash);

impl AdvertisementId {
    pub fn of(record: &[u8]) -> Result<Self> {
        sha2_256_multihash(record).map(Self)
    }

    pub fn as_multihash(&self) -> &Multihash {
        &self.0
    }
}

impl fmt::Display for AdvertisementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_bytes()))
    }
}

impl FromStr for AdvertisementId {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s.trim()).map_err(|e| BeaconError::MalformedMultihash(e.to_string()))?;
        Multihash::from_bytes(&bytes)
            .map(Self)
            .map_err(|e| BeaconError::MalformedMultihash(e.to_string()))
    }
}

#[async_trait]
pub trait AdvertisementClient: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    async fn publish(
        &self,
        provider: &AddrInfo,
        context_id: &ContextId,
        metadata: Metadata,
    ) -> Result<AdvertisementId>;

    async fn retract(&self, provider: &PeerId, context_id: &ContextId) -> Result<AdvertisementId>;

    /// Serves a pull request for a published context id.
    async fn resolve(&self, context_id: &[u8]) -> Result<MultihashCursor>;
}

/// Resolution hook: turns a context id back into the multihashes of its window.
#[derive(Clone)]
pub struct ContextResolver {
    catalog: Arc<dyn ContentCatalog>,
}

impl ContextResolver {
    pub fn new(catalog: Arc<dyn ContentCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn resolve(&self, context_id: &[u8]) -> Result<MultihashCursor> {
        let params = context_id::decode(context_id).inspect_err(|error| {
            tracing::warn!("Rejected pull request for {}: {}", hex::encode(context_id), error);
        })?;

        tracing::info!(
            "Received pull request (peer id: {}, first content id: {}, count: {})",
            params.provider,
            params.first_content_id,
            params.count
        );

        MultihashCursor::resolve(
            self.catalog.as_ref(),
            u64::from(params.first_content_id),
            u64::from(params.count),
        )
        .await
        .inspect_err(|error| {
            tracing::warn!(
                "Failed to serve pull request for first content id {}: {}",
                params.first_content_id,
                error
            );
        })
    }
}

/// One entry of the advertisement chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub previous: Option<String>,
    pub provider: PeerId,
    pub addresses: Vec<Multiaddr>,
    pub context_id: String,
    pub metadata: Option<Metadata>,
    pub is_rm: bool,
}

impl Advertisement {
    pub fn id(&self) -> Result<AdvertisementId> {
        AdvertisementId::of(&serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Serialize)]
struct AnnounceRequest<'a> {
    advertisement: String,
    publisher: &'a PeerId,
    addrs: &'a [Multiaddr],
}

#[derive(Default)]
struct ChainState {
    started: bool,
    head: Option<AdvertisementId>,
}

/// Publishes an advertisement chain and direct-announces each new head to an
/// indexer over HTTP. Records and the head live in [`AdvertisementStore`].
pub struct IndexerClient {
    http: reqwest::Client,
    indexer_url: String,
    publisher: AddrInfo,
    resolver: ContextResolver,
    store: Arc<AdvertisementStore>,
    state: Mutex<ChainState>,
}

impl IndexerClient {
    pub fn new(
        indexer_url: &str,
        publisher: AddrInfo,
        resolver: ContextResolver,
        store: Arc<AdvertisementStore>,
    ) -> Result<Self> {
        let indexer_url = indexer_url.trim().trim_end_matches('/').to_string();
        reqwest::Url::parse(&indexer_url)
            .map_err(|e| BeaconError::Config(format!("invalid indexer url: {}", e)))?;

        Ok(Self {
            http: reqwest::Client::new(),
            indexer_url,
            publisher,
            resolver,
            store,
            state: Mutex::new(ChainState::default()),
        })
    }

    pub async fn head(&self) -> Option<AdvertisementId> {
        self.state.lock().await.head
    }

    pub fn advertisement(&self, id: &AdvertisementId) -> Result<Option<Advertisement>> {
        match self.store.get_record(&id.to_string())? {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    async fn append(
        &self,
        provider: &PeerId,
        addresses: Vec<Multiaddr>,
        context_id: &ContextId,
        metadata: Option<Metadata>,
    ) -> Result<AdvertisementId> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Err(BeaconError::Internal(
                "advertisement engine is not running".to_string(),
            ));
        }

        let advertisement = Advertisement {
            previous: state.head.as_ref().map(ToString::to_string),
            provider: *provider,
            addresses,
            context_id: context_id.to_string(),
            metadata,
            is_rm: metadata.is_none(),
        };
        let id = advertisement.id()?;

        // the record must be fetchable before the indexer hears about it
        self.store
            .put_record(&id.to_string(), &serde_json::to_string(&advertisement)?)?;
        self.announce(&id).await?;

        state.head = Some(id);
        if let Err(error) = self.store.set_head(&id.to_string()) {
            tracing::error!("Failed to persist advertisement head {}: {}", id, error);
        }
        Ok(id)
    }

    async fn announce(&self, id: &AdvertisementId) -> Result<()> {
        let request = AnnounceRequest {
            advertisement: id.to_string(),
            publisher: &self.publisher.id,
            addrs: &self.publisher.addrs,
        };

        self.http
            .put(format!("{}/ingest/announce", self.indexer_url))
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| BeaconError::Http(e.to_string()))?;

        tracing::debug!("Announced advertisement {} to {}", id, self.indexer_url);
        Ok(())
    }
}

#[async_trait]
impl AdvertisementClient for IndexerClient {
    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.head = self
            .store
            .head()?
            .map(|head| head.parse::<AdvertisementId>())
            .transpose()?;
        state.started = true;

        tracing::info!(
            "Advertisement engine started (publisher {}, indexer {}, head {})",
            self.publisher.id,
            self.indexer_url,
            state
                .head
                .map(|head| head.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.started = false;
        tracing::info!("Advertisement engine stopped");
        Ok(())
    }

    async fn publish(
        &self,
        provider: &AddrInfo,
        context_id: &ContextId,
        metadata: Metadata,
    ) -> Result<AdvertisementId> {
        self.append(
            &provider.id,
            provider.addrs.clone(),
            context_id,
            Some(metadata),
        )
        .await
    }

    async fn retract(&self, provider: &PeerId, context_id: &ContextId) -> Result<AdvertisementId> {
        self.append(provider, Vec::new(), context_id, None).await
    }

    async fn resolve(&self, context_id: &[u8]) -> Result<MultihashCursor> {
        self.resolver.resolve(context_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteCatalog;
    use libp2p_identity::Keypair;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP endpoint answering every request with `status`.
    async fn spawn_indexer_stub(status: u16) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);

                        let text = String::from_utf8_lossy(&buf).to_string();
                        if let Some(header_end) = text.find("\r\n\r\n") {
                            let body_len = text[..header_end]
                                .lines()
                                .find_map(|line| {
                                    let (name, value) = line.split_once(':')?;
                                    name.eq_ignore_ascii_case("content-length")
                                        .then(|| value.trim().parse::<usize>().ok())
                                        .flatten()
                                })
                                .unwrap_or(0);
                            if buf.len() >= header_end + 4 + body_len {
                                break;
                            }
                        }
                    }

                    counter.fetch_add(1, Ordering::SeqCst);
                    let response = format!(
                        "HTTP/1.1 {} Stub\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        (format!("http://{}", addr), hits)
    }

    fn publisher() -> AddrInfo {
        AddrInfo {
            id: Keypair::ed25519_from_bytes([42u8; 32])
                .unwrap()
                .public()
                .to_peer_id(),
            addrs: vec!["/ip4/127.0.0.1/tcp/6746".parse().unwrap()],
        }
    }

    fn indexer_client(url: &str, dir: &tempfile::TempDir) -> IndexerClient {
        let db_path = dir.path().join("beacon.db");
        let catalog = SqliteCatalog::new(&db_path).unwrap();
        let store = AdvertisementStore::new(&db_path).unwrap();
        let resolver = ContextResolver::new(Arc::new(catalog));
        IndexerClient::new(url, publisher(), resolver, Arc::new(store)).unwrap()
    }

    #[tokio::test]
    async fn test_publish_requires_start() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (url, hits) = spawn_indexer_stub(200).await;
        let client = indexer_client(&url, &temp_dir);

        let provider = publisher();
        let context_id = context_id::for_window(&provider.id, 0, 25_000).unwrap();
        assert!(client.publish(&provider, &context_id, Metadata::Bitswap).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_and_retract_extend_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (url, hits) = spawn_indexer_stub(200).await;
        let client = indexer_client(&url, &temp_dir);
        client.start().await.unwrap();

        let provider = publisher();
        let context_id = context_id::for_window(&provider.id, 0, 25_000).unwrap();

        let first = client
            .publish(&provider, &context_id, Metadata::Bitswap)
            .await
            .unwrap();
        let removal = client.retract(&provider.id, &context_id).await.unwrap();

        assert_ne!(first, removal);
        assert_eq!(client.head().await, Some(removal));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let ad = client.advertisement(&removal).unwrap().unwrap();
        assert!(ad.is_rm);
        assert_eq!(ad.previous, Some(first.to_string()));
        assert_eq!(ad.context_id, context_id.to_string());

        client.shutdown().await.unwrap();
        assert!(client.retract(&provider.id, &context_id).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_announce_leaves_head_untouched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (url, hits) = spawn_indexer_stub(503).await;
        let client = indexer_client(&url, &temp_dir);
        client.start().await.unwrap();

        let provider = publisher();
        let context_id = context_id::for_window(&provider.id, 0, 25_000).unwrap();
        let err = client
            .publish(&provider, &context_id, Metadata::Bitswap)
            .await
            .unwrap_err();

        assert!(matches!(err, BeaconError::Http(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(client.head().await.is_none());

        // a restart must not pick up the unannounced record as head
        let restarted = indexer_client(&url, &temp_dir);
        restarted.start().await.unwrap();
        assert!(restarted.head().await.is_none());
    }

    #[tokio::test]
    async fn test_chain_survives_restart() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (url, _) = spawn_indexer_stub(200).await;

        let provider = publisher();
        let context_id = context_id::for_window(&provider.id, 0, 25_000).unwrap();

        let first = {
            let client = indexer_client(&url, &temp_dir);
            client.start().await.unwrap();
            let id = client
                .publish(&provider, &context_id, Metadata::Bitswap)
                .await
                .unwrap();
            client.shutdown().await.unwrap();
            id
        };

        let client = indexer_client(&url, &temp_dir);
        assert!(client.head().await.is_none());
        client.start().await.unwrap();
        assert_eq!(client.head().await, Some(first));

        let second = client.retract(&provider.id, &context_id).await.unwrap();
        let ad = client.advertisement(&second).unwrap().unwrap();
        assert_eq!(ad.previous, Some(first.to_string()));

        let earlier = client.advertisement(&first).unwrap().unwrap();
        assert_eq!(earlier.metadata, Some(Metadata::Bitswap));
        assert_eq!(earlier.addresses, provider.addrs);
    }

    #[test]
    fn test_advertisement_id_text_form() {
        let id = AdvertisementId::of(b"record").unwrap();
        let parsed: AdvertisementId = id.to_string().parse().unwrap();

        assert_eq!(parsed, id);
        assert_eq!(id.as_multihash().code(), crate::SHA2_256);
        assert!("zz".parse::<AdvertisementId>().is_err());
        assert!("1220".parse::<AdvertisementId>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_decodes_context_and_builds_cursor() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (url, _) = spawn_indexer_stub(200).await;
        let client = indexer_client(&url, &temp_dir);

        let catalog = SqliteCatalog::new(temp_dir.path().join("beacon.db")).unwrap();
        for i in 0..3u8 {
            catalog
                .insert_content(&[sha2_256_multihash(&[i]).unwrap()])
                .unwrap();
        }

        let context_id = context_id::for_window(&publisher().id, 0, 25_000).unwrap();
        let cursor = client.resolve(context_id.as_bytes()).await.unwrap();
        assert_eq!(cursor.window_count(), 25_000);
        assert_eq!(cursor.collect::<Vec<_>>().len(), 3);

        let empty = context_id::for_window(&publisher().id, 25_000, 25_000).unwrap();
        assert!(matches!(
            client.resolve(empty.as_bytes()).await,
            Err(BeaconError::NoMultihashes { .. })
        ));
        assert!(matches!(
            client.resolve(&[1, 2, 3]).await,
            Err(BeaconError::MalformedContextId(_))
        ));
    }

    #[test]
    fn test_metadata_tag() {
        assert_eq!(
            serde_json::to_string(&Metadata::Bitswap).unwrap(),
            "\"bitswap\""
        );
    }
}
