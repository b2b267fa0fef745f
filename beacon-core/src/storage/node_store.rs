use crate::error::{BeaconError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use ulid::Ulid;

/// A registered retrieval gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalNode {
    pub handle: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub public_key: String,
    pub addresses: Vec<String>,
    pub last_connection: DateTime<Utc>,
    pub last_advertisement: Option<DateTime<Utc>>,
}

/// Where to reach a peer: its identity plus transport addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    #[serde(rename = "ID")]
    pub id: PeerId,
    #[serde(rename = "Addrs")]
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    /// Parses a p2p multiaddr such as `/ip4/1.2.3.4/tcp/4001/p2p/12D3KooW...`.
    /// The trailing `/p2p` component names the peer; whatever precedes it is
    /// the transport address.
    pub fn parse(address: &str) -> Result<Self> {
        let mut addr: Multiaddr = address
            .trim()
            .parse()
            .map_err(|e| BeaconError::MalformedAddress(format!("{}: {}", address, e)))?;

        match addr.pop() {
            Some(Protocol::P2p(id)) => Ok(Self {
                id,
                addrs: if addr.is_empty() { Vec::new() } else { vec![addr] },
            }),
            _ => Err(BeaconError::MalformedAddress(format!(
                "missing /p2p component: {}",
                address
            ))),
        }
    }
}

impl RetrievalNode {
    /// Address info derived from the first registered address.
    pub fn addr_info(&self) -> Result<AddrInfo> {
        let first = self.addresses.first().ok_or_else(|| {
            BeaconError::MalformedAddress(format!("node {} has no addresses", self.handle))
        })?;
        AddrInfo::parse(first)
    }

    pub fn is_online(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_connection) <= window
    }
}

/// Read access to registered retrieval nodes, as needed by reconciliation.
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<RetrievalNode>>;

    async fn mark_advertised(&self, handle: &str, at: DateTime<Utc>) -> Result<()>;
}

pub struct SqliteNodeStore {
    db_path: PathBuf,
}

impl SqliteNodeStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS retrieval_nodes (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                handle TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL UNIQUE,
                public_key TEXT NOT NULL UNIQUE,
                addresses TEXT NOT NULL,
                last_connection TEXT NOT NULL,
                last_advertisement TEXT
            )",
            [],
        )?;

        Ok(())
    }

    /// Registers a new node, minting its handle and auth token.
    pub fn register(&self, public_key: &str, addresses: &[String]) -> Result<RetrievalNode> {
        let public_key = public_key.trim().to_ascii_lowercase();
        hex::decode(&public_key).map_err(|e| {
            BeaconError::InvalidRequest(format!("public key must be hex encoded: {}", e))
        })?;

        let addresses = normalize_addresses(addresses)?;

        let conn = self.get_conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT handle FROM retrieval_nodes WHERE public_key = ?1",
                [&public_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(handle) = existing {
            return Err(BeaconError::InvalidRequest(format!(
                "public key already registered as {}",
                handle
            )));
        }

        let node = RetrievalNode {
            handle: format!("AUTORETRIEVE{}HANDLE", Ulid::new()),
            token: format!("SECRET{}SECRET", Ulid::new()),
            public_key,
            addresses,
            last_connection: Utc::now(),
            last_advertisement: None,
        };

        conn.execute(
            "INSERT INTO retrieval_nodes (
                handle, token, public_key, addresses, last_connection, last_advertisement
            ) VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                node.handle,
                node.token,
                node.public_key,
                node.addresses.join(","),
                node.last_connection.to_rfc3339(),
            ],
        )?;

        tracing::info!("Registered retrieval node {}", node.handle);
        Ok(node)
    }

    /// Records a heartbeat for the node owning `token`, optionally replacing
    /// its addresses.
    pub fn heartbeat(&self, token: &str, addresses: Option<&[String]>) -> Result<RetrievalNode> {
        let mut node = self.get_by_token(token)?.ok_or(BeaconError::Unauthorized)?;

        if let Some(addresses) = addresses {
            node.addresses = normalize_addresses(addresses)?;
        }
        node.last_connection = Utc::now();

        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE retrieval_nodes SET addresses = ?1, last_connection = ?2 WHERE handle = ?3",
            params![
                node.addresses.join(","),
                node.last_connection.to_rfc3339(),
                node.handle,
            ],
        )?;

        Ok(node)
    }

    pub fn get_by_token(&self, token: &str) -> Result<Option<RetrievalNode>> {
        let conn = self.get_conn()?;

        let node = conn
            .query_row(
                "SELECT handle, token, public_key, addresses, last_connection, last_advertisement
                 FROM retrieval_nodes WHERE token = ?1",
                [token],
                node_from_row,
            )
            .optional()?;

        Ok(node)
    }

    /// Overrides the last connection time; used when importing node state.
    pub fn set_last_connection(&self, handle: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE retrieval_nodes SET last_connection = ?1 WHERE handle = ?2",
            params![at.to_rfc3339(), handle],
        )?;

        if affected == 0 {
            return Err(BeaconError::NodeNotFound(handle.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeDirectory for SqliteNodeStore {
    async fn list_nodes(&self) -> Result<Vec<RetrievalNode>> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT handle, token, public_key, addresses, last_connection, last_advertisement
             FROM retrieval_nodes ORDER BY pk",
        )?;
        let rows = stmt.query_map([], node_from_row)?;

        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }

        Ok(nodes)
    }

    async fn mark_advertised(&self, handle: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE retrieval_nodes SET last_advertisement = ?1 WHERE handle = ?2",
            params![at.to_rfc3339(), handle],
        )?;

        if affected == 0 {
            return Err(BeaconError::NodeNotFound(handle.to_string()));
        }
        Ok(())
    }
}

fn normalize_addresses(addresses: &[String]) -> Result<Vec<String>> {
    let addresses: Vec<String> = addresses
        .iter()
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect();

    let first = addresses.first().ok_or_else(|| {
        BeaconError::InvalidRequest("at least one address is required".to_string())
    })?;
    if addresses.iter().any(|addr| addr.contains(',')) {
        return Err(BeaconError::InvalidRequest(
            "addresses cannot contain ','".to_string(),
        ));
    }
    AddrInfo::parse(first)?;

    Ok(addresses)
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<RetrievalNode> {
    let addresses: String = row.get(3)?;
    let last_connection: String = row.get(4)?;
    let last_advertisement: Option<String> = row.get(5)?;

    Ok(RetrievalNode {
        handle: row.get(0)?,
        token: row.get(1)?,
        public_key: row.get(2)?,
        addresses: addresses
            .split(',')
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect(),
        last_connection: parse_timestamp(&last_connection)?,
        last_advertisement: last_advertisement
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
    })
}
