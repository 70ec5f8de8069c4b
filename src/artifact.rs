//! Content-addressed artifact store
//!
//! Stores large payloads (documents, embedding vectors) keyed by the
//! SHA-256 of their contents, replicated across several storage nodes.
//!
//! - `store` uploads to `replication` healthy nodes in parallel and
//!   tolerates partial failure: it succeeds once at least one upload
//!   lands, but reports the achieved replication count so callers can
//!   decide when the payload is actually safe.
//! - `retrieve` tries replicas in health-ranked order, verifies the
//!   checksum, and fails over on mismatch or timeout.
//! - Payloads above the chunk size are split into fixed-size chunks with
//!   a separate index object listing chunk content ids in order; a missing
//!   chunk makes reassembly an integrity failure.
//! - Periodic health checks exclude failing nodes from routing; periodic
//!   garbage collection evicts least-recently-used unpinned content when
//!   local usage exceeds the configured bound. Pinned content is never
//!   evicted.

use crate::config::Config;
use crate::error::SynodError;
use crate::events::{EventBus, SystemEvent};
use crate::storage_node::{ManagedNode, NodeHealth, StorageNode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Result of storing an artifact
#[derive(Debug, Clone, Serialize)]
pub struct StoreOutcome {
    /// Content id of the full payload (`sha256-` prefixed hex)
    pub content_id: String,
    /// Payload size in bytes
    pub size_bytes: u64,
    /// Nodes that acknowledged the write
    pub replication_count: usize,
    /// Whether the payload was chunked
    pub chunked: bool,
    /// Whether the content id was already present
    pub already_existed: bool,
}

/// Artifact record kept in the metadata tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub content_id: String,
    pub size_bytes: u64,
    /// Caller-supplied kind label (document, embedding, ...)
    pub kind: String,
    /// Pinned content is exempt from garbage collection
    pub pinned: bool,
    pub chunked: bool,
    pub chunk_count: u32,
    /// Node ids that acknowledged the initial write
    pub replicas: Vec<String>,
    pub stored_at: i64,
    pub last_accessed: i64,
}

/// Index object for a chunked artifact, itself stored content-addressed
/// under the full payload's content id
#[derive(Debug, Serialize, Deserialize)]
struct ChunkIndex {
    total_size: u64,
    chunk_ids: Vec<String>,
}

/// Per-component health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactStatus {
    pub node_count: usize,
    pub healthy_nodes: usize,
    pub artifact_count: usize,
    pub total_bytes: u64,
    pub pinned_count: usize,
}

/// Replicated content-addressed store
pub struct ArtifactStore {
    nodes: Vec<ManagedNode>,
    meta: sled::Tree,
    replication: usize,
    chunk_size: usize,
    capacity_bytes: u64,
    op_timeout: Duration,
    max_retries: u32,
    events: EventBus,
}

impl ArtifactStore {
    pub fn new(
        nodes: Vec<Arc<dyn StorageNode>>,
        db: &sled::Db,
        config: &Config,
        events: EventBus,
    ) -> Result<Self, SynodError> {
        let meta = db.open_tree("artifacts")?;
        let nodes = nodes
            .into_iter()
            .map(|node| ManagedNode {
                node,
                health: NodeHealth::new(),
            })
            .collect::<Vec<_>>();
        info!(nodes = nodes.len(), "Initialized artifact store");
        Ok(Self {
            replication: config.artifact_replication.clamp(1, nodes.len().max(1)),
            chunk_size: config.artifact_chunk_size,
            capacity_bytes: config.artifact_capacity_bytes,
            op_timeout: Duration::from_millis(config.storage_timeout_ms),
            max_retries: config.storage_retries,
            nodes,
            meta,
            events,
        })
    }

    /// Compute the content id of a payload
    pub fn content_id(payload: &[u8]) -> String {
        format!("sha256-{}", hex::encode(Sha256::digest(payload)))
    }

    /// Store a payload, replicating it across healthy storage nodes.
    ///
    /// Fails with `InsufficientReplication` only when no node at all
    /// acknowledged the write.
    pub async fn store(&self, payload: &[u8], kind: &str) -> Result<StoreOutcome, SynodError> {
        let content_id = Self::content_id(payload);
        let size_bytes = payload.len() as u64;

        if let Some(existing) = self.metadata(&content_id)? {
            self.touch(&content_id)?;
            debug!(content = %content_id, "Artifact already stored");
            return Ok(StoreOutcome {
                content_id,
                size_bytes,
                replication_count: existing.replicas.len(),
                chunked: existing.chunked,
                already_existed: true,
            });
        }

        let chunked = payload.len() > self.chunk_size;
        let (replicas, chunk_count) = if chunked {
            self.store_chunked(&content_id, payload).await?
        } else {
            (self.replicate(&content_id, payload).await?, 1)
        };

        if replicas.is_empty() {
            return Err(SynodError::InsufficientReplication {
                achieved: 0,
                required: self.replication,
            });
        }
        if replicas.len() < self.replication {
            warn!(
                content = %content_id,
                achieved = replicas.len(),
                required = self.replication,
                "Artifact stored below requested replication"
            );
        }

        let now = chrono::Utc::now().timestamp();
        let metadata = ArtifactMetadata {
            content_id: content_id.clone(),
            size_bytes,
            kind: kind.to_string(),
            pinned: false,
            chunked,
            chunk_count,
            replicas: replicas.clone(),
            stored_at: now,
            last_accessed: now,
        };
        self.put_metadata(&metadata)?;

        info!(
            content = %content_id,
            bytes = size_bytes,
            replicas = replicas.len(),
            chunked,
            "Stored artifact"
        );
        Ok(StoreOutcome {
            content_id,
            size_bytes,
            replication_count: replicas.len(),
            chunked,
            already_existed: false,
        })
    }

    /// Retrieve a payload by content id, verifying its checksum.
    pub async fn retrieve(&self, content_id: &str) -> Result<Vec<u8>, SynodError> {
        let metadata = self
            .metadata(content_id)?
            .ok_or_else(|| SynodError::NotFound(content_id.to_string()))?;
        self.touch(content_id)?;

        if !metadata.chunked {
            return self.fetch_verified(content_id).await;
        }

        // Chunked: the object at the content id is the index
        let index_bytes = self.fetch_any(content_id).await?;
        let index: ChunkIndex = serde_json::from_slice(&index_bytes)?;

        let mut payload = Vec::with_capacity(index.total_size as usize);
        for (i, chunk_id) in index.chunk_ids.iter().enumerate() {
            let chunk = self.fetch_verified(chunk_id).await.map_err(|e| match e {
                SynodError::NotFound(_) => SynodError::ChunkMissing {
                    content_id: content_id.to_string(),
                    index: i as u32,
                },
                other => other,
            })?;
            payload.extend_from_slice(&chunk);
        }

        // Reassembled payload must hash back to the content id
        let actual = Self::content_id(&payload);
        if actual != content_id {
            return Err(SynodError::ChecksumMismatch {
                expected: content_id.to_string(),
                actual,
            });
        }
        Ok(payload)
    }

    /// Pin content, exempting it from garbage collection
    pub fn pin(&self, content_id: &str) -> Result<(), SynodError> {
        self.set_pinned(content_id, true)
    }

    /// Unpin content, making it eligible for garbage collection again
    pub fn unpin(&self, content_id: &str) -> Result<(), SynodError> {
        self.set_pinned(content_id, false)
    }

    /// Run one health check pass over all storage nodes
    pub async fn health_check_once(&self) {
        for managed in &self.nodes {
            let probe = tokio::time::timeout(self.op_timeout, managed.node.health_check()).await;
            match probe {
                Ok(Ok(())) => managed.health.record_success(),
                _ => {
                    let was_healthy = managed.health.is_healthy();
                    let still_healthy = managed.health.record_failure(self.max_retries);
                    if was_healthy && !still_healthy {
                        warn!(node = %managed.node.node_id(), "Storage node marked unhealthy");
                        self.events.publish(SystemEvent::NodeUnhealthy {
                            node_id: managed.node.node_id().to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Run one garbage collection pass: evict least-recently-used unpinned
    /// artifacts until usage fits the configured capacity.
    pub async fn gc_once(&self) -> Result<usize, SynodError> {
        let mut artifacts: Vec<ArtifactMetadata> = Vec::new();
        let mut total: u64 = 0;
        for item in self.meta.iter() {
            let (_, value) = item?;
            let metadata: ArtifactMetadata = rmp_serde::from_slice(&value)
                .map_err(|e| SynodError::Encoding(e.to_string()))?;
            total += metadata.size_bytes;
            artifacts.push(metadata);
        }
        if total <= self.capacity_bytes {
            return Ok(0);
        }

        // LRU order, unpinned only
        artifacts.retain(|m| !m.pinned);
        artifacts.sort_by_key(|m| m.last_accessed);

        let mut evicted = 0;
        for metadata in artifacts {
            if total <= self.capacity_bytes {
                break;
            }
            self.delete_everywhere(&metadata).await;
            self.meta.remove(metadata.content_id.as_bytes())?;
            total = total.saturating_sub(metadata.size_bytes);
            evicted += 1;
            debug!(content = %metadata.content_id, "Evicted artifact");
        }
        if evicted > 0 {
            info!(evicted, remaining_bytes = total, "Garbage collection pass complete");
        }
        Ok(evicted)
    }

    /// Spawn the periodic health check and garbage collection loops
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        health_interval: Duration,
        gc_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut health = tokio::time::interval(health_interval);
            let mut gc = tokio::time::interval(gc_interval);
            loop {
                tokio::select! {
                    _ = health.tick() => store.health_check_once().await,
                    _ = gc.tick() => {
                        if let Err(e) = store.gc_once().await {
                            warn!(error = %e, "Garbage collection pass failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Component health snapshot
    pub fn status(&self) -> Result<ArtifactStatus, SynodError> {
        let mut artifact_count = 0;
        let mut total_bytes = 0;
        let mut pinned_count = 0;
        for item in self.meta.iter() {
            let (_, value) = item?;
            let metadata: ArtifactMetadata = rmp_serde::from_slice(&value)
                .map_err(|e| SynodError::Encoding(e.to_string()))?;
            artifact_count += 1;
            total_bytes += metadata.size_bytes;
            if metadata.pinned {
                pinned_count += 1;
            }
        }
        Ok(ArtifactStatus {
            node_count: self.nodes.len(),
            healthy_nodes: self.nodes.iter().filter(|n| n.health.is_healthy()).count(),
            artifact_count,
            total_bytes,
            pinned_count,
        })
    }

    pub fn metadata(&self, content_id: &str) -> Result<Option<ArtifactMetadata>, SynodError> {
        match self.meta.get(content_id.as_bytes())? {
            Some(value) => {
                let metadata = rmp_serde::from_slice(&value)
                    .map_err(|e| SynodError::Encoding(e.to_string()))?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    async fn store_chunked(
        &self,
        content_id: &str,
        payload: &[u8],
    ) -> Result<(Vec<String>, u32), SynodError> {
        let mut chunk_ids = Vec::new();
        for chunk in payload.chunks(self.chunk_size) {
            let chunk_id = Self::content_id(chunk);
            let replicas = self.replicate(&chunk_id, chunk).await?;
            if replicas.is_empty() {
                return Err(SynodError::InsufficientReplication {
                    achieved: 0,
                    required: self.replication,
                });
            }
            chunk_ids.push(chunk_id);
        }
        let chunk_count = chunk_ids.len() as u32;

        let index = ChunkIndex {
            total_size: payload.len() as u64,
            chunk_ids,
        };
        let index_bytes = serde_json::to_vec(&index)?;
        let replicas = self.replicate(content_id, &index_bytes).await?;
        Ok((replicas, chunk_count))
    }

    /// Upload one object to `replication` healthy nodes in parallel,
    /// returning the node ids that acknowledged.
    async fn replicate(&self, content_id: &str, payload: &[u8]) -> Result<Vec<String>, SynodError> {
        let targets: Vec<&ManagedNode> = self
            .nodes
            .iter()
            .filter(|n| n.health.is_healthy())
            .take(self.replication)
            .collect();
        if targets.is_empty() {
            return Err(SynodError::NodeUnhealthy(
                "no healthy storage nodes".to_string(),
            ));
        }

        let uploads = targets.into_iter().map(|managed| async move {
            let mut attempt = 0;
            loop {
                let result =
                    tokio::time::timeout(self.op_timeout, managed.node.put(content_id, payload))
                        .await;
                match result {
                    Ok(Ok(())) => {
                        managed.health.record_success();
                        return Some(managed.node.node_id().to_string());
                    }
                    _ if attempt < self.max_retries => attempt += 1,
                    _ => {
                        managed.health.record_failure(self.max_retries);
                        warn!(node = %managed.node.node_id(), content = %content_id, "Upload failed");
                        return None;
                    }
                }
            }
        });

        let acknowledged: Vec<String> = futures::future::join_all(uploads)
            .await
            .into_iter()
            .flatten()
            .collect();
        Ok(acknowledged)
    }

    /// Fetch an object from the healthiest replica and verify its checksum,
    /// failing over to the next node on mismatch or timeout.
    async fn fetch_verified(&self, content_id: &str) -> Result<Vec<u8>, SynodError> {
        let payload = self.fetch_where(content_id, |data| {
            Self::content_id(data) == content_id
        })
        .await?;
        Ok(payload)
    }

    /// Fetch without checksum verification (used for index objects, which
    /// are keyed by the hash of the payload they describe, not their own).
    async fn fetch_any(&self, content_id: &str) -> Result<Vec<u8>, SynodError> {
        self.fetch_where(content_id, |_| true).await
    }

    async fn fetch_where<F>(&self, content_id: &str, accept: F) -> Result<Vec<u8>, SynodError>
    where
        F: Fn(&[u8]) -> bool,
    {
        // Health-ranked: healthy nodes first, fewest recent failures first
        let mut ranked: Vec<&ManagedNode> = self.nodes.iter().collect();
        ranked.sort_by_key(|n| (!n.health.is_healthy(), n.health.failures()));

        for managed in ranked {
            if !managed.health.is_healthy() {
                continue;
            }
            match tokio::time::timeout(self.op_timeout, managed.node.get(content_id)).await {
                Ok(Ok(payload)) => {
                    if accept(&payload) {
                        managed.health.record_success();
                        return Ok(payload);
                    }
                    // Corrupted replica: never retried, fail over
                    warn!(
                        node = %managed.node.node_id(),
                        content = %content_id,
                        "Checksum mismatch on replica, failing over"
                    );
                }
                Ok(Err(SynodError::NotFound(_))) => continue,
                Ok(Err(e)) => {
                    debug!(node = %managed.node.node_id(), error = %e, "Replica read failed");
                    managed.health.record_failure(self.max_retries);
                }
                Err(_) => {
                    managed.health.record_failure(self.max_retries);
                }
            }
        }
        Err(SynodError::NotFound(content_id.to_string()))
    }

    async fn delete_everywhere(&self, metadata: &ArtifactMetadata) {
        // Chunks first, then the object itself
        if metadata.chunked {
            if let Ok(index_bytes) = self.fetch_any(&metadata.content_id).await {
                if let Ok(index) = serde_json::from_slice::<ChunkIndex>(&index_bytes) {
                    for chunk_id in &index.chunk_ids {
                        for managed in &self.nodes {
                            let _ = managed.node.delete(chunk_id).await;
                        }
                    }
                }
            }
        }
        for managed in &self.nodes {
            let _ = managed.node.delete(&metadata.content_id).await;
        }
    }

    fn put_metadata(&self, metadata: &ArtifactMetadata) -> Result<(), SynodError> {
        let value =
            rmp_serde::to_vec(metadata).map_err(|e| SynodError::Encoding(e.to_string()))?;
        self.meta.insert(metadata.content_id.as_bytes(), value)?;
        Ok(())
    }

    fn touch(&self, content_id: &str) -> Result<(), SynodError> {
        if let Some(mut metadata) = self.metadata(content_id)? {
            metadata.last_accessed = chrono::Utc::now().timestamp();
            self.put_metadata(&metadata)?;
        }
        Ok(())
    }

    fn set_pinned(&self, content_id: &str, pinned: bool) -> Result<(), SynodError> {
        let mut metadata = self
            .metadata(content_id)?
            .ok_or_else(|| SynodError::NotFound(content_id.to_string()))?;
        metadata.pinned = pinned;
        self.put_metadata(&metadata)?;
        debug!(content = %content_id, pinned, "Updated pin state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_node::LocalStorageNode;
    use tempfile::TempDir;

    async fn test_store(dir: &TempDir, config: &Config) -> ArtifactStore {
        let mut nodes: Vec<Arc<dyn StorageNode>> = Vec::new();
        for i in 0..config.storage_node_count {
            let node = LocalStorageNode::new(format!("store-{i}"), dir.path().join(format!("n{i}")))
                .await
                .unwrap();
            nodes.push(Arc::new(node));
        }
        let db = sled::open(dir.path().join("meta")).unwrap();
        ArtifactStore::new(nodes, &db, config, EventBus::new()).unwrap()
    }

    #[tokio::test]
    async fn store_and_retrieve() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, &Config::default()).await;

        let outcome = store.store(b"hello artifacts", "document").await.unwrap();
        assert!(outcome.content_id.starts_with("sha256-"));
        assert_eq!(outcome.replication_count, 2);
        assert!(!outcome.chunked);

        let payload = store.retrieve(&outcome.content_id).await.unwrap();
        assert_eq!(payload, b"hello artifacts");
    }

    #[tokio::test]
    async fn store_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, &Config::default()).await;

        let first = store.store(b"same bytes", "document").await.unwrap();
        let second = store.store(b"same bytes", "document").await.unwrap();
        assert_eq!(first.content_id, second.content_id);
        assert!(!first.already_existed);
        assert!(second.already_existed);
    }

    #[tokio::test]
    async fn retrieve_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, &Config::default()).await;

        match store.retrieve("sha256-deadbeef").await {
            Err(SynodError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_payload_is_chunked_and_reassembled() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.artifact_chunk_size = 1024;
        let store = test_store(&dir, &config).await;

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let outcome = store.store(&payload, "embedding").await.unwrap();
        assert!(outcome.chunked);

        let retrieved = store.retrieve(&outcome.content_id).await.unwrap();
        assert_eq!(retrieved, payload);
    }

    #[tokio::test]
    async fn missing_chunk_is_integrity_error() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.artifact_chunk_size = 1024;
        let store = test_store(&dir, &config).await;

        let payload: Vec<u8> = (0..4096u32).map(|i| (i / 7) as u8).collect();
        let outcome = store.store(&payload, "embedding").await.unwrap();

        // Remove the first chunk from every node
        let first_chunk = ArtifactStore::content_id(&payload[..1024]);
        for managed in &store.nodes {
            managed.node.delete(&first_chunk).await.unwrap();
        }

        match store.retrieve(&outcome.content_id).await {
            Err(SynodError::ChunkMissing { index, .. }) => assert_eq!(index, 0),
            other => panic!("expected ChunkMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gc_never_evicts_pinned_content() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.artifact_capacity_bytes = 64; // force pressure
        let store = test_store(&dir, &config).await;

        let pinned = store.store(&[1u8; 100], "document").await.unwrap();
        store.pin(&pinned.content_id).unwrap();
        let loose = store.store(&[2u8; 100], "document").await.unwrap();

        store.gc_once().await.unwrap();

        assert!(store.metadata(&pinned.content_id).unwrap().is_some());
        assert!(store.retrieve(&pinned.content_id).await.is_ok());
        assert!(store.metadata(&loose.content_id).unwrap().is_none());
    }

    struct FailingNode;

    #[async_trait::async_trait]
    impl StorageNode for FailingNode {
        fn node_id(&self) -> &str {
            "bad"
        }
        async fn put(&self, _: &str, _: &[u8]) -> Result<(), SynodError> {
            Err(SynodError::NodeUnhealthy("bad".to_string()))
        }
        async fn get(&self, _: &str) -> Result<Vec<u8>, SynodError> {
            Err(SynodError::NodeUnhealthy("bad".to_string()))
        }
        async fn has(&self, _: &str) -> Result<bool, SynodError> {
            Err(SynodError::NodeUnhealthy("bad".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<(), SynodError> {
            Err(SynodError::NodeUnhealthy("bad".to_string()))
        }
        async fn health_check(&self) -> Result<(), SynodError> {
            Err(SynodError::NodeUnhealthy("bad".to_string()))
        }
    }

    #[tokio::test]
    async fn unhealthy_node_is_excluded_from_routing() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let mut nodes: Vec<Arc<dyn StorageNode>> = vec![Arc::new(FailingNode)];
        for i in 0..2 {
            nodes.push(Arc::new(
                LocalStorageNode::new(format!("store-{i}"), dir.path().join(format!("n{i}")))
                    .await
                    .unwrap(),
            ));
        }
        let db = sled::open(dir.path().join("meta")).unwrap();
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let store = ArtifactStore::new(nodes, &db, &config, bus).unwrap();

        // Three straight failed probes cross the retry bound
        for _ in 0..3 {
            store.health_check_once().await;
        }
        match events.recv().await.unwrap() {
            SystemEvent::NodeUnhealthy { node_id } => assert_eq!(node_id, "bad"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(store.status().unwrap().healthy_nodes, 2);

        // Writes route around the failed node at full replication
        let outcome = store.store(b"routed", "document").await.unwrap();
        assert_eq!(outcome.replication_count, 2);
        let replicas = store
            .metadata(&outcome.content_id)
            .unwrap()
            .unwrap()
            .replicas;
        assert!(!replicas.contains(&"bad".to_string()));
        assert_eq!(store.retrieve(&outcome.content_id).await.unwrap(), b"routed");
    }

    #[tokio::test]
    async fn corrupted_replica_fails_over() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir, &Config::default()).await;

        let outcome = store.store(b"precious", "document").await.unwrap();

        // Corrupt the copy on the first replica only
        let first = &store.nodes[0];
        first.node.delete(&outcome.content_id).await.unwrap();
        first.node.put(&outcome.content_id, b"garbage").await.unwrap();

        let payload = store.retrieve(&outcome.content_id).await.unwrap();
        assert_eq!(payload, b"precious");
    }
}
