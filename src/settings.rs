use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Top-level configuration for a queue service.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct QueueConfig {
    /// Which store backs the queue
    #[serde(default)]
    pub backend: KvBackend,
    #[serde(default)]
    pub etcd: EtcdConfig,
    #[serde(default)]
    pub embedded: EmbeddedKvConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Backing store type
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    /// Remote etcd cluster
    Etcd,
    /// In-process single-node server, no external dependencies
    #[default]
    Embedded,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct EtcdConfig {
    /// Endpoints of the cluster; the conventional local endpoint is used
    /// when empty.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Configuration surface of the embedded server.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddedKvConfig {
    /// TCP port for client traffic. Port 0 binds an ephemeral port; the
    /// resolved URL is reported by the server handle.
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    /// TCP port for peer traffic, required even for a single-node cluster.
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Directory for the persisted operation log and snapshots.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Retention window for accumulated history, in hours (minimum 1).
    #[serde(default = "default_compaction_retention_hours")]
    pub compaction_retention_hours: u64,
    /// Snapshot after this many log entries to bound replay cost.
    #[serde(default = "default_snapshot_entry_count")]
    pub snapshot_entry_count: u64,
}

fn default_client_port() -> u16 {
    22379
}

fn default_peer_port() -> u16 {
    22380
}

fn default_data_dir() -> String {
    "/tmp/hopper-kv".to_string()
}

fn default_compaction_retention_hours() -> u64 {
    1
}

fn default_snapshot_entry_count() -> u64 {
    1000
}

impl Default for EmbeddedKvConfig {
    fn default() -> Self {
        Self {
            client_port: default_client_port(),
            peer_port: default_peer_port(),
            data_dir: default_data_dir(),
            compaction_retention_hours: default_compaction_retention_hours(),
            snapshot_entry_count: default_snapshot_entry_count(),
        }
    }
}

/// Log output format.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl QueueConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }
}
