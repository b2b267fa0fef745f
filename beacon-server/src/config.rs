use beacon_core::{AddrInfo, BeaconError, ReconcileConfig, Result};
use libp2p_identity::PublicKey;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub advertisement: AdvertisementConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertisementConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_width")]
    pub batch_width: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    pub indexer_url: String,
    /// Hex of the announcing provider's protobuf-encoded libp2p public key.
    pub provider_public_key: String,
    #[serde(default)]
    pub public_addrs: Vec<String>,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_batch_width() -> u64 {
    beacon_core::DEFAULT_BATCH_WIDTH
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl AdvertisementConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: self.interval(),
            batch_width: self.batch_width,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    pub fn publisher(&self) -> Result<AddrInfo> {
        let key = hex::decode(self.provider_public_key.trim()).map_err(|e| {
            BeaconError::Config(format!("provider_public_key must be hex encoded: {}", e))
        })?;
        let key = PublicKey::try_decode_protobuf(&key).map_err(|e| {
            BeaconError::Config(format!("provider_public_key is not a libp2p public key: {}", e))
        })?;

        let addrs = self
            .public_addrs
            .iter()
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse::<Multiaddr>().map_err(|e| {
                    BeaconError::Config(format!("invalid public address {}: {}", addr, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AddrInfo {
            id: key.to_peer_id(),
            addrs,
        })
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("BEACON").separator("__"))
            .build()
            .map_err(|e| BeaconError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| BeaconError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.trim().is_empty() {
            return Err(BeaconError::Config("bind_addr cannot be empty".to_string()));
        }
        if self.advertisement.indexer_url.trim().is_empty() {
            return Err(BeaconError::Config(
                "advertisement.indexer_url cannot be empty".to_string(),
            ));
        }
        self.advertisement.publisher()?;
        self.advertisement.reconcile_config().validate()
    }
}
