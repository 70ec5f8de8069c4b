//! Storage node abstraction for the artifact store
//!
//! A storage node holds content-addressed payloads. The artifact store
//! replicates each payload across several nodes and routes reads to the
//! healthiest ones, so the trait stays minimal: put/get/has/delete plus a
//! health probe.

use crate::error::SynodError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Content storage backend
#[async_trait]
pub trait StorageNode: Send + Sync {
    /// Stable node identifier
    fn node_id(&self) -> &str;

    /// Store a payload under its content id
    async fn put(&self, content_id: &str, payload: &[u8]) -> Result<(), SynodError>;

    /// Fetch a payload by content id
    async fn get(&self, content_id: &str) -> Result<Vec<u8>, SynodError>;

    /// Whether the node holds a payload
    async fn has(&self, content_id: &str) -> Result<bool, SynodError>;

    /// Remove a payload
    async fn delete(&self, content_id: &str) -> Result<(), SynodError>;

    /// Cheap liveness probe
    async fn health_check(&self) -> Result<(), SynodError>;
}

/// Health bookkeeping shared by the artifact store's routing
pub struct NodeHealth {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl NodeHealth {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Record a successful operation; an unhealthy node recovers here
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
    }

    /// Record a failure; the node is unhealthy once `max_failures` accrue
    pub fn record_failure(&self, max_failures: u32) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures > max_failures {
            self.healthy.store(false, Ordering::Relaxed);
        }
        self.healthy.load(Ordering::Relaxed)
    }
}

impl Default for NodeHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// A storage node plus its health state, as routed by the artifact store
pub struct ManagedNode {
    pub node: Arc<dyn StorageNode>,
    pub health: NodeHealth,
}

/// Local filesystem storage node
///
/// Payloads live under `root/blobs/<prefix>/<content_id>`, using the first
/// four characters of the hash part as a subdirectory for filesystem
/// distribution.
pub struct LocalStorageNode {
    node_id: String,
    root_dir: PathBuf,
}

impl LocalStorageNode {
    pub async fn new(node_id: impl Into<String>, root_dir: impl AsRef<Path>) -> Result<Self, SynodError> {
        let node_id = node_id.into();
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(root_dir.join("blobs")).await?;
        info!(node = %node_id, path = %root_dir.display(), "Initialized storage node");
        Ok(Self { node_id, root_dir })
    }

    fn payload_path(&self, content_id: &str) -> PathBuf {
        let hash_part = content_id.strip_prefix("sha256-").unwrap_or(content_id);
        let subdir = &hash_part[..4.min(hash_part.len())];
        self.root_dir.join("blobs").join(subdir).join(content_id)
    }
}

#[async_trait]
impl StorageNode for LocalStorageNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn put(&self, content_id: &str, payload: &[u8]) -> Result<(), SynodError> {
        let path = self.payload_path(content_id);
        if fs::try_exists(&path).await? {
            debug!(node = %self.node_id, content = %content_id, "Payload already stored");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write to a temp file first so readers never observe partial content
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(payload).await?;
        file.sync_all().await?;
        fs::rename(&tmp, &path).await?;
        debug!(node = %self.node_id, content = %content_id, bytes = payload.len(), "Stored payload");
        Ok(())
    }

    async fn get(&self, content_id: &str) -> Result<Vec<u8>, SynodError> {
        let path = self.payload_path(content_id);
        match fs::read(&path).await {
            Ok(payload) => Ok(payload),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SynodError::NotFound(content_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has(&self, content_id: &str) -> Result<bool, SynodError> {
        Ok(fs::try_exists(self.payload_path(content_id)).await?)
    }

    async fn delete(&self, content_id: &str) -> Result<(), SynodError> {
        match fs::remove_file(self.payload_path(content_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<(), SynodError> {
        fs::metadata(&self.root_dir)
            .await
            .map(|_| ())
            .map_err(|_| SynodError::NodeUnhealthy(self.node_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let node = LocalStorageNode::new("store-0", dir.path()).await.unwrap();

        node.put("sha256-abcd1234", b"payload").await.unwrap();
        assert!(node.has("sha256-abcd1234").await.unwrap());
        assert_eq!(node.get("sha256-abcd1234").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let node = LocalStorageNode::new("store-0", dir.path()).await.unwrap();

        match node.get("sha256-missing").await {
            Err(SynodError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let node = LocalStorageNode::new("store-0", dir.path()).await.unwrap();

        node.put("sha256-abcd", b"x").await.unwrap();
        node.delete("sha256-abcd").await.unwrap();
        node.delete("sha256-abcd").await.unwrap();
        assert!(!node.has("sha256-abcd").await.unwrap());
    }

    #[test]
    fn health_transitions() {
        let health = NodeHealth::new();
        assert!(health.is_healthy());
        health.record_failure(2);
        health.record_failure(2);
        assert!(health.is_healthy());
        health.record_failure(2);
        assert!(!health.is_healthy());
        health.record_success();
        assert!(health.is_healthy());
    }
}
