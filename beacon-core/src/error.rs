use thiserror::Error;

#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("malformed context id: {0}")]
    MalformedContextId(String),

    #[error("malformed multihash: {0}")]
    MalformedMultihash(String),

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("no multihashes for {count} content ids starting at {first}")]
    NoMultihashes { first: u64, count: u64 },

    #[error("retrieval node not found: {0}")]
    NodeNotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BeaconError>;
