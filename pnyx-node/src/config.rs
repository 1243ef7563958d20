//! Node configuration.
//!
//! A JSON file describing the consortium membership from this node's
//! point of view, plus local paths. Most fields have workable defaults
//! for single-machine experiments.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const APP_NAME: &str = "pnyxdb";

/// On-disk configuration of one node.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// This node's identity in the consortium keyring.
    pub identity: String,

    /// Peer overlay listen address.
    #[serde(default = "defaults::listen_peers")]
    pub listen_peers: SocketAddr,

    /// Client API listen address.
    #[serde(default = "defaults::listen_api")]
    pub listen_api: SocketAddr,

    /// Static addresses of the other consortium members.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,

    /// Endorsements required for applicability (w).
    pub quorum: usize,

    /// Total number of consortium participants (n).
    pub participants: usize,

    /// Agreeing peers required by a recovery pull; 0 disables recovery.
    #[serde(default)]
    pub recovery_quorum: usize,

    /// Demote long-outdated pending queries to checkpoints.
    #[serde(default)]
    pub demote_outdated: bool,

    /// Data directory; defaults to the platform data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let config: Config = serde_json::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Resolved data directory.
    ///
    /// - Linux: `~/.local/share/pnyxdb/`
    /// - macOS: `~/Library/Application Support/pnyxdb/`
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join(APP_NAME))
            .ok_or_else(|| anyhow::anyhow!("no platform data directory; set data_dir"))
    }

    pub fn keyring_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("keyring.pem"))
    }

    pub fn store_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("store.db"))
    }

    pub fn snapshot_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("engine.dump"))
    }
}

mod defaults {
    use std::net::SocketAddr;

    pub fn listen_peers() -> SocketAddr {
        "0.0.0.0:13531".parse().expect("static address parses")
    }

    pub fn listen_api() -> SocketAddr {
        "127.0.0.1:13530".parse().expect("static address parses")
    }
}
