//! Context ids link a routing-network advertisement back to the batch window
//! it announces and the peer that announced it.
//!
//! Layout: `first_content_id` (u32 BE) || `count` (u32 BE) || peer id bytes.
//! The peer segment carries no length prefix; it is a multihash and therefore
//! self-delimiting, and decoding insists it spans the whole tail.

use crate::error::{BeaconError, Result};
use libp2p_identity::PeerId;
use std::fmt;
use std::str::FromStr;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub provider: PeerId,
    pub first_content_id: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(Vec<u8>);

impl ContextId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for ContextId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for ContextId {
    type Err = BeaconError;

    fn from_str(s: &str) -> Result<Self> {
        hex::decode(s.trim())
            .map(Self)
            .map_err(|e| BeaconError::MalformedContextId(e.to_string()))
    }
}

pub fn encode(params: &ContextParams) -> Result<ContextId> {
    let peer_bytes = params.provider.to_bytes();

    let mut out = Vec::with_capacity(HEADER_LEN + peer_bytes.len());
    out.extend_from_slice(&params.first_content_id.to_be_bytes());
    out.extend_from_slice(&params.count.to_be_bytes());
    out.extend_from_slice(&peer_bytes);
    Ok(ContextId(out))
}

/// Builds the context id for a batch window, checking that the window
/// coordinates fit the 32-bit wire fields.
pub fn for_window(provider: &PeerId, first_content_id: u64, width: u64) -> Result<ContextId> {
    let narrow = |value: u64, field: &str| {
        u32::try_from(value).map_err(|_| {
            BeaconError::InvalidRequest(format!("{} {} does not fit in 32 bits", field, value))
        })
    };

    encode(&ContextParams {
        provider: *provider,
        first_content_id: narrow(first_content_id, "first content id")?,
        count: narrow(width, "batch width")?,
    })
}

pub fn decode(bytes: &[u8]) -> Result<ContextParams> {
    if bytes.len() < HEADER_LEN {
        return Err(BeaconError::MalformedContextId(format!(
            "expected at least {} bytes, got {}",
            HEADER_LEN,
            bytes.len()
        )));
    }

    let (first, rest) = bytes.split_at(4);
    let (count, peer) = rest.split_at(4);

    let provider = PeerId::from_bytes(peer)
        .map_err(|e| BeaconError::MalformedContextId(format!("failed to read peer id: {}", e)))?;

    Ok(ContextParams {
        provider,
        first_content_id: u32::from_be_bytes([first[0], first[1], first[2], first[3]]),
        count: u32::from_be_bytes([count[0], count[1], count[2], count[3]]),
    })
}
