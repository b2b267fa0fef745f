//! Storage modules for Beacon
//!
//! The content catalog and node registry are read through narrow traits; the
//! published-batch ledger and the advertisement chain are owned here.

pub mod advertisement_store;
pub mod catalog;
pub mod ledger_store;
pub mod node_store;

pub use advertisement_store::AdvertisementStore;
pub use catalog::{ContentCatalog, SqliteCatalog};
pub use ledger_store::{LedgerStore, PublishedBatch};
pub use node_store::{AddrInfo, NodeDirectory, RetrievalNode, SqliteNodeStore};
