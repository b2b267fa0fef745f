//! Beacon Core - content advertisement control plane for storage shuttles
//!
//! Keeps a content-routing network informed about which stored content can be
//! retrieved through which gateway nodes:
//! - deterministic batch windows over the content catalog
//! - a durable ledger of what each node already advertised
//! - context ids that resolve back to a window's multihashes on demand

pub mod advertiser;
pub mod context_id;
pub mod cursor;
pub mod error;
pub mod operations;
pub mod planner;
pub mod storage;

pub use advertiser::{
    Advertisement, AdvertisementClient, AdvertisementId, ContextResolver, IndexerClient, Metadata,
};
pub use context_id::{ContextId, ContextParams};
pub use cursor::MultihashCursor;
pub use error::{BeaconError, Result};
pub use libp2p_identity::PeerId;
pub use multiaddr::Multiaddr;
pub use operations::{DEFAULT_BATCH_WIDTH, ReconcileConfig, ReconcileOperation, TickReport};
pub use planner::{BatchPlan, BatchWindow};
pub use storage::{
    AddrInfo, AdvertisementStore, ContentCatalog, LedgerStore, NodeDirectory, PublishedBatch,
    RetrievalNode, SqliteCatalog, SqliteNodeStore,
};

/// Multihash sized for sha2-256 digests and inline peer ids.
pub type Multihash = multihash::Multihash<64>;

/// Multicodec code of sha2-256.
pub const SHA2_256: u64 = 0x12;

pub fn sha2_256_multihash(data: &[u8]) -> Result<Multihash> {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(data);
    Multihash::wrap(SHA2_256, &digest)
        .map_err(|e| BeaconError::MalformedMultihash(e.to_string()))
}
