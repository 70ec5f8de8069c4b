//! Configuration for synod

use crate::error::SynodError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("synod")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for partitions, chain and artifact metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of physical graph partitions
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,

    /// Virtual nodes per physical partition on the hash ring
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Graph replication factor (distinct partitions per node id)
    #[serde(default = "default_graph_replication")]
    pub graph_replication: usize,

    /// Artifact replication factor (storage nodes per content id)
    #[serde(default = "default_artifact_replication")]
    pub artifact_replication: usize,

    /// Number of local artifact storage nodes
    #[serde(default = "default_storage_node_count")]
    pub storage_node_count: usize,

    /// Chunk size for large artifact payloads, in bytes
    #[serde(default = "default_chunk_size")]
    pub artifact_chunk_size: usize,

    /// Local artifact capacity before LRU garbage collection, in bytes
    #[serde(default = "default_artifact_capacity")]
    pub artifact_capacity_bytes: u64,

    /// Per-call timeout for storage node operations, in milliseconds
    #[serde(default = "default_storage_timeout_ms")]
    pub storage_timeout_ms: u64,

    /// Retries before a storage node is marked unhealthy
    #[serde(default = "default_storage_retries")]
    pub storage_retries: u32,

    /// Health check interval, in seconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Garbage collection interval, in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Cache capacity in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_bytes: u64,

    /// Compress cache values larger than this, in bytes
    #[serde(default = "default_compression_threshold")]
    pub cache_compression_threshold: usize,

    /// Default cache TTL, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Fraction of cache capacity that raises a high-memory event
    #[serde(default = "default_high_memory_fraction")]
    pub cache_high_memory_fraction: f64,

    /// Cache statistics sampling interval, in seconds
    #[serde(default = "default_stats_interval")]
    pub cache_stats_interval_secs: u64,

    /// Weighted ratio required to decide a proposal
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,

    /// Voting window, in milliseconds
    #[serde(default = "default_voting_window_ms")]
    pub voting_window_ms: u64,

    /// Minimum voters before any threshold check
    #[serde(default = "default_min_voters")]
    pub min_voters: usize,

    /// Leading zero hex digits required of a block hash
    #[serde(default = "default_difficulty")]
    pub proof_difficulty: usize,

    /// HTTP status endpoint port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_partition_count() -> usize {
    4
}

fn default_virtual_nodes() -> usize {
    150
}

fn default_graph_replication() -> usize {
    2
}

fn default_artifact_replication() -> usize {
    2
}

fn default_storage_node_count() -> usize {
    3
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_artifact_capacity() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_storage_timeout_ms() -> u64 {
    5_000
}

fn default_storage_retries() -> u32 {
    2
}

fn default_health_interval() -> u64 {
    30
}

fn default_gc_interval() -> u64 {
    300
}

fn default_cache_capacity() -> u64 {
    256 * 1024 * 1024
}

fn default_compression_threshold() -> usize {
    4 * 1024
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_high_memory_fraction() -> f64 {
    0.85
}

fn default_stats_interval() -> u64 {
    60
}

fn default_consensus_threshold() -> f64 {
    0.67
}

fn default_voting_window_ms() -> u64 {
    30_000
}

fn default_min_voters() -> usize {
    3
}

fn default_difficulty() -> usize {
    2
}

fn default_http_port() -> u16 {
    8140
}

impl Default for Config {
    fn default() -> Self {
        // serde defaults are the single source of truth
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SynodError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| SynodError::Config(e.to_string()))
    }

    /// Load config from a TOML file, or defaults if it does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, SynodError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// On-disk location of this node's config
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Save config as TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SynodError> {
        let raw = toml::to_string_pretty(self).map_err(|e| SynodError::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Logical namespace for a physical partition index
    pub fn partition_namespace(index: usize) -> String {
        format!("shard-{index}")
    }
}
