//! Sharded knowledge-graph store
//!
//! Knowledge nodes and their relationships are partitioned across a fixed
//! set of sled trees by the consistent hash ring. A node is written to its
//! full placement set in parallel and considered durable once a majority
//! of those partitions acknowledge.
//!
//! Relationships whose endpoints share a partition are written as a single
//! local transaction on that partition. Endpoints with disjoint placement
//! sets get a cross-shard relationship record duplicated on both sides
//! with explicit shard metadata: no cross-partition transaction guarantee
//! exists, which is a documented consistency trade-off, not a bug.

use crate::config::Config;
use crate::error::SynodError;
use crate::ring::{HashRing, ShardPlacement};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sled::transaction::TransactionError;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// A node in the knowledge graph.
///
/// The shard set is derived from `id` via the hash ring and never stored;
/// recomputing it always yields the same placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: String,
    pub node_type: String,
    pub properties: Map<String, Value>,
    pub embeddings: Option<Vec<f32>>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KnowledgeNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: id.into(),
            node_type: node_type.into(),
            properties: Map::new(),
            embeddings: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// A directed, typed relationship between two nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_id: String,
    pub to_id: String,
    pub rel_type: String,
    pub properties: Map<String, Value>,
    /// Set when the endpoints resolve to disjoint shard sets
    pub cross_shard: bool,
    pub from_shard: usize,
    pub to_shard: usize,
    pub created_at: i64,
}

/// Per-partition result of a replicated node write
#[derive(Debug, Clone, Serialize)]
pub struct ShardWriteReport {
    pub placement: ShardPlacement,
    /// Partitions that acknowledged the write
    pub acknowledged: Vec<usize>,
    /// Partitions that failed it
    pub failed: Vec<usize>,
}

/// Pattern for fan-out queries: all clauses must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPattern {
    /// Match nodes of this type
    pub node_type: Option<String>,
    /// Property equality clauses
    pub properties: Map<String, Value>,
}

/// Per-component health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct GraphStatus {
    pub partition_count: usize,
    pub node_count: usize,
    pub relationship_count: usize,
}

/// Sharded graph store over local sled partitions
pub struct GraphShardManager {
    ring: HashRing,
    partitions: Vec<sled::Tree>,
}

impl GraphShardManager {
    pub fn new(db: &sled::Db, config: &Config) -> Result<Self, SynodError> {
        let ring = HashRing::new(
            config.partition_count,
            config.virtual_nodes,
            config.graph_replication,
        );
        let mut partitions = Vec::with_capacity(config.partition_count);
        for i in 0..config.partition_count {
            partitions.push(db.open_tree(Config::partition_namespace(i))?);
        }
        info!(
            partitions = partitions.len(),
            replication = ring.replication(),
            "Initialized graph shard manager"
        );
        Ok(Self { ring, partitions })
    }

    /// Shard placement for a node id (deterministic, never stored)
    pub fn placement(&self, node_id: &str) -> ShardPlacement {
        self.ring.placement(node_id)
    }

    /// Idempotent upsert: merges properties by id, then writes the merged
    /// node to its full placement set in parallel. Durable once a quorum
    /// of the assigned partitions acknowledge.
    pub async fn upsert_node(&self, node: KnowledgeNode) -> Result<ShardWriteReport, SynodError> {
        let placement = self.placement(&node.id);

        // Merge against any existing copy so repeated application is safe
        let merged = match self.read_node(&placement, &node.id)? {
            Some(mut existing) => {
                existing.node_type = node.node_type;
                for (key, value) in node.properties {
                    existing.properties.insert(key, value);
                }
                if node.embeddings.is_some() {
                    existing.embeddings = node.embeddings;
                }
                existing.updated_at = node.updated_at.max(existing.updated_at);
                existing
            }
            None => node,
        };

        let value = rmp_serde::to_vec(&merged).map_err(|e| SynodError::Encoding(e.to_string()))?;
        let key = node_key(&merged.id);

        let writes = placement.partitions.iter().map(|&partition| {
            let tree = self.partitions[partition].clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                let result =
                    tokio::task::spawn_blocking(move || tree.insert(key.as_bytes(), value))
                        .await;
                match result {
                    Ok(Ok(_)) => (partition, true),
                    _ => (partition, false),
                }
            }
        });

        let mut acknowledged = Vec::new();
        let mut failed = Vec::new();
        for (partition, ok) in futures::future::join_all(writes).await {
            if ok {
                acknowledged.push(partition);
            } else {
                failed.push(partition);
            }
        }

        let report = ShardWriteReport {
            placement,
            acknowledged,
            failed,
        };
        if report.acknowledged.len() < report.placement.quorum() {
            warn!(
                node = %merged.id,
                acknowledged = report.acknowledged.len(),
                quorum = report.placement.quorum(),
                "Node write failed quorum"
            );
            return Err(SynodError::InsufficientReplication {
                achieved: report.acknowledged.len(),
                required: report.placement.quorum(),
            });
        }
        debug!(node = %merged.id, partitions = ?report.acknowledged, "Upserted node");
        Ok(report)
    }

    /// Fetch a node by id from its placement set
    pub fn get_node(&self, node_id: &str) -> Result<KnowledgeNode, SynodError> {
        let placement = self.placement(node_id);
        self.read_node(&placement, node_id)?
            .ok_or_else(|| SynodError::NotFound(node_id.to_string()))
    }

    /// Create a relationship between two existing nodes.
    ///
    /// Both endpoints must exist. If their placements share a partition the
    /// relationship is written atomically there; otherwise a cross-shard
    /// record is duplicated on both primaries.
    pub fn create_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: &str,
        properties: Map<String, Value>,
    ) -> Result<Relationship, SynodError> {
        self.get_node(from_id)?;
        self.get_node(to_id)?;

        let from_placement = self.placement(from_id);
        let to_placement = self.placement(to_id);
        let shared = from_placement.shared_partition(&to_placement);

        let relationship = Relationship {
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            rel_type: rel_type.to_string(),
            properties,
            cross_shard: shared.is_none(),
            from_shard: from_placement.primary(),
            to_shard: to_placement.primary(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let value =
            rmp_serde::to_vec(&relationship).map_err(|e| SynodError::Encoding(e.to_string()))?;
        let out_key = outgoing_key(from_id, rel_type, to_id);
        let in_key = incoming_key(to_id, rel_type, from_id);

        match shared {
            Some(partition) => {
                // Single local transaction on the shared partition
                let tree = &self.partitions[partition];
                tree.transaction(|tx| {
                    tx.insert(out_key.as_bytes(), value.clone())?;
                    tx.insert(in_key.as_bytes(), value.clone())?;
                    Ok(())
                })
                .map_err(|e: TransactionError| SynodError::Internal(e.to_string()))?;
                debug!(from = %from_id, to = %to_id, partition, "Created local relationship");
            }
            None => {
                // Duplicated records, best-effort: no cross-partition
                // transaction guarantee
                self.partitions[relationship.from_shard].insert(out_key.as_bytes(), value.clone())?;
                self.partitions[relationship.to_shard].insert(in_key.as_bytes(), value.clone())?;
                debug!(
                    from = %from_id,
                    to = %to_id,
                    from_shard = relationship.from_shard,
                    to_shard = relationship.to_shard,
                    "Created cross-shard relationship"
                );
            }
        }
        Ok(relationship)
    }

    /// Relationships originating at a node
    pub fn outgoing_relationships(&self, node_id: &str) -> Result<Vec<Relationship>, SynodError> {
        let placement = self.placement(node_id);
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        let prefix = format!("rel/{node_id}/");
        for &partition in &placement.partitions {
            for item in self.partitions[partition].scan_prefix(prefix.as_bytes()) {
                let (key, value) = item?;
                if seen.insert(key.to_vec()) {
                    let rel: Relationship = rmp_serde::from_slice(&value)
                        .map_err(|e| SynodError::Encoding(e.to_string()))?;
                    results.push(rel);
                }
            }
        }
        Ok(results)
    }

    /// Fan a pattern out to every partition and merge the result sets.
    /// Ordering holds within a partition only; none is guaranteed across.
    pub async fn query(&self, pattern: &QueryPattern) -> Result<Vec<KnowledgeNode>, SynodError> {
        let scans = self.partitions.iter().map(|tree| {
            let tree = tree.clone();
            let pattern = pattern.clone();
            tokio::task::spawn_blocking(move || scan_partition(&tree, &pattern))
        });

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for scan in futures::future::join_all(scans).await {
            let nodes = scan.map_err(|e| SynodError::Internal(e.to_string()))??;
            for node in nodes {
                // Replicated nodes appear on several partitions
                if seen.insert(node.id.clone()) {
                    merged.push(node);
                }
            }
        }
        Ok(merged)
    }

    /// Delete a node and cascade to its incident relationships.
    ///
    /// Cross-shard duplicates on reachable partitions are removed too;
    /// any that are not reachable are tolerated as orphans and filtered
    /// by existence checks on read.
    pub fn delete_node(&self, node_id: &str) -> Result<(), SynodError> {
        let placement = self.placement(node_id);
        let out_prefix = format!("rel/{node_id}/");
        let in_prefix = format!("rin/{node_id}/");

        for &partition in &placement.partitions {
            let tree = &self.partitions[partition];

            // Incident relationship records on this partition, both directions
            let mut doomed: Vec<(Vec<u8>, Relationship)> = Vec::new();
            for prefix in [&out_prefix, &in_prefix] {
                for item in tree.scan_prefix(prefix.as_bytes()) {
                    let (key, value) = item?;
                    let rel: Relationship = rmp_serde::from_slice(&value)
                        .map_err(|e| SynodError::Encoding(e.to_string()))?;
                    doomed.push((key.to_vec(), rel));
                }
            }
            for (key, rel) in doomed {
                tree.remove(key)?;
                // Mirror record lives on the shared partition for local
                // relationships or on the other endpoint's primary for
                // cross-shard ones; sweep that endpoint's placement set.
                let (other_id, mirror_key) = if rel.from_id == node_id {
                    (rel.to_id.clone(), incoming_key(&rel.to_id, &rel.rel_type, &rel.from_id))
                } else {
                    (rel.from_id.clone(), outgoing_key(&rel.from_id, &rel.rel_type, &rel.to_id))
                };
                for &mirror in &self.placement(&other_id).partitions {
                    self.partitions[mirror].remove(mirror_key.as_bytes())?;
                }
            }

            tree.remove(node_key(node_id).as_bytes())?;
        }
        info!(node = %node_id, "Deleted node and incident relationships");
        Ok(())
    }

    /// Component health snapshot
    pub fn status(&self) -> Result<GraphStatus, SynodError> {
        let mut node_count = 0;
        let mut relationship_count = 0;
        let mut seen = HashSet::new();
        for tree in &self.partitions {
            for item in tree.scan_prefix(b"node/") {
                let (key, _) = item?;
                if seen.insert(key.to_vec()) {
                    node_count += 1;
                }
            }
            relationship_count += tree.scan_prefix(b"rel/").count();
        }
        Ok(GraphStatus {
            partition_count: self.partitions.len(),
            node_count,
            relationship_count,
        })
    }

    fn read_node(
        &self,
        placement: &ShardPlacement,
        node_id: &str,
    ) -> Result<Option<KnowledgeNode>, SynodError> {
        let key = node_key(node_id);
        for &partition in &placement.partitions {
            if let Some(value) = self.partitions[partition].get(key.as_bytes())? {
                let node = rmp_serde::from_slice(&value)
                    .map_err(|e| SynodError::Encoding(e.to_string()))?;
                return Ok(Some(node));
            }
        }
        Ok(None)
    }
}

fn node_key(node_id: &str) -> String {
    format!("node/{node_id}")
}

fn outgoing_key(from_id: &str, rel_type: &str, to_id: &str) -> String {
    format!("rel/{from_id}/{rel_type}/{to_id}")
}

fn incoming_key(to_id: &str, rel_type: &str, from_id: &str) -> String {
    format!("rin/{to_id}/{rel_type}/{from_id}")
}

fn scan_partition(
    tree: &sled::Tree,
    pattern: &QueryPattern,
) -> Result<Vec<KnowledgeNode>, SynodError> {
    let mut matches = Vec::new();
    for item in tree.scan_prefix(b"node/") {
        let (_, value) = item?;
        let node: KnowledgeNode =
            rmp_serde::from_slice(&value).map_err(|e| SynodError::Encoding(e.to_string()))?;
        if let Some(node_type) = &pattern.node_type {
            if &node.node_type != node_type {
                continue;
            }
        }
        let properties_match = pattern
            .properties
            .iter()
            .all(|(key, expected)| node.properties.get(key) == Some(expected));
        if properties_match {
            matches.push(node);
        }
    }
    Ok(matches)
}
