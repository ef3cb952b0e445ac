//! Minimal config loader (`SPEC_FULL.md` §B). Configuration loading proper
//! is out of scope for the session layer (spec.md §1) — this only gets a
//! single node far enough to bind a listener and wire the core.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_base")]
    pub max_base_connections: usize,
    #[serde(default = "default_max_control")]
    pub max_control_connections: usize,
}

fn default_max_base() -> usize {
    10_000
}
fn default_max_control() -> usize {
    5_000
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_base_connections: default_max_base(),
            max_control_connections: default_max_control(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientEntry {
    pub id: i64,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Clients {
    #[serde(default)]
    pub entries: Vec<ClientEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen_addr: String,
    pub bridge_listen_addr: String,
    #[serde(default)]
    pub state_secret: String,
    #[serde(default)]
    pub resume_secret: String,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub clients: Clients,
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading config file {}: {e}", path.display()))?;
        let config: NodeConfig = toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing config file {}: {e}", path.display()))?;
        Ok(config)
    }

    /// §4.3: "missing secret falls back to a fixed compile-time constant
    /// with a warning ... implementations must refuse to start in cluster
    /// mode without an explicit secret." A bridge address distinct from the
    /// loopback default is this binary's signal that cluster mode is
    /// intended.
    pub fn is_cluster_mode(&self) -> bool {
        !self.bridge_listen_addr.starts_with("127.0.0.1") && !self.bridge_listen_addr.starts_with("localhost")
    }

    pub fn state_secret_bytes(&self) -> Vec<u8> {
        if self.state_secret.is_empty() {
            DEV_FALLBACK_SECRET.to_vec()
        } else {
            self.state_secret.clone().into_bytes()
        }
    }

    pub fn resume_secret_bytes(&self) -> Vec<u8> {
        if self.resume_secret.is_empty() {
            DEV_FALLBACK_SECRET.to_vec()
        } else {
            self.resume_secret.clone().into_bytes()
        }
    }

    pub fn client_roster(&self) -> HashMap<i64, String> {
        self.clients.entries.iter().map(|c| (c.id, c.secret.clone())).collect()
    }
}

/// §4.3: "the signing secret is injected; missing secret falls back to a
/// fixed compile-time constant with a warning (acceptable for single-node
/// dev, unsafe in production)".
const DEV_FALLBACK_SECRET: &[u8] = b"tunnox-dev-fallback-secret-do-not-use-in-production";
