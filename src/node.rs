//! Node facade wiring the four subsystems together
//!
//! `SynodNode` owns the artifact store, the graph shard manager, the cache
//! and the consensus network, and exposes the programmatic boundary used
//! by agent-facing callers: propose a change, cast a vote, read and query
//! the graph, and inspect per-component health.
//!
//! Approved decisions flow back in through the event bus: a background
//! task applies the mutation to the graph and invalidates the affected
//! cache keys. The consensus core itself never touches its consumers.

use crate::artifact::{ArtifactStatus, ArtifactStore};
use crate::cache::{CacheCluster, CacheStats, Keyspace};
use crate::config::Config;
use crate::consensus::{
    ConsensusNetwork, ConsensusStatus, Proposal, ProposalReceipt, Vote, VoteChoice,
};
use crate::error::SynodError;
use crate::events::{EventBus, SystemEvent};
use crate::graph::{GraphShardManager, GraphStatus, KnowledgeNode, QueryPattern};
use crate::identity::AgentIdentity;
use crate::storage_node::{LocalStorageNode, StorageNode};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Combined per-component health
#[derive(Debug, Clone, Serialize)]
pub struct SynodStatus {
    pub artifacts: ArtifactStatus,
    pub graph: GraphStatus,
    pub cache: CacheStats,
    pub cache_hit_rate: f64,
    pub consensus: ConsensusStatus,
}

/// A running synod node
pub struct SynodNode {
    config: Config,
    identity: AgentIdentity,
    pub artifacts: Arc<ArtifactStore>,
    pub graph: Arc<GraphShardManager>,
    pub cache: Arc<CacheCluster>,
    pub consensus: Arc<ConsensusNetwork>,
    events: EventBus,
    shutdown_tx: broadcast::Sender<()>,
}

impl SynodNode {
    /// Bring up all subsystems and their background tasks
    pub async fn start(config: Config) -> Result<Arc<Self>, SynodError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = sled::open(config.data_dir.join("db"))?;
        let identity =
            AgentIdentity::load_or_generate("synod-validator", config.data_dir.join("identity.key"))?;
        let events = EventBus::new();
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut storage_nodes: Vec<Arc<dyn StorageNode>> = Vec::new();
        for i in 0..config.storage_node_count {
            let node = LocalStorageNode::new(
                format!("store-{i}"),
                config.data_dir.join("artifacts").join(format!("node-{i}")),
            )
            .await?;
            storage_nodes.push(Arc::new(node));
        }
        let artifacts = Arc::new(ArtifactStore::new(
            storage_nodes,
            &db,
            &config,
            events.clone(),
        )?);
        let graph = Arc::new(GraphShardManager::new(&db, &config)?);
        let cache = Arc::new(CacheCluster::new(&config, events.clone()));
        let consensus = Arc::new(ConsensusNetwork::new(
            identity.clone(),
            Arc::clone(&graph),
            &db,
            &config,
            events.clone(),
        )?);

        artifacts.spawn_maintenance(
            Duration::from_secs(config.health_check_interval_secs),
            Duration::from_secs(config.gc_interval_secs),
            shutdown_tx.subscribe(),
        );
        cache.spawn_invalidation_listener(shutdown_tx.subscribe());
        cache.spawn_stats_sampler(
            Duration::from_secs(config.cache_stats_interval_secs),
            shutdown_tx.subscribe(),
        );

        let node = Arc::new(Self {
            config,
            identity,
            artifacts,
            graph,
            cache,
            consensus,
            events,
            shutdown_tx,
        });
        node.spawn_mutation_applier();
        info!(agent = %node.identity.agent_id(), "Synod node started");
        Ok(node)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    /// Build, sign and submit a change proposal on behalf of an agent
    pub async fn propose_change(
        &self,
        node_id: &str,
        changes: Map<String, Value>,
        agent: &AgentIdentity,
    ) -> Result<ProposalReceipt, SynodError> {
        let mut proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            knowledge_node_id: node_id.to_string(),
            changes,
            proposer: agent.agent_id().to_string(),
            proposer_public_key: agent.public_key_hex(),
            signature: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        proposal.signature = agent.sign(&proposal.signable_bytes());
        self.consensus.submit_proposal(proposal).await
    }

    /// Build, sign and cast a vote on behalf of an agent
    pub async fn cast_vote(
        &self,
        proposal_id: &str,
        choice: VoteChoice,
        confidence: f64,
        reasoning: &str,
        agent: &AgentIdentity,
    ) -> Result<Vote, SynodError> {
        let mut vote = Vote {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: proposal_id.to_string(),
            voter: agent.agent_id().to_string(),
            voter_public_key: agent.public_key_hex(),
            choice,
            confidence,
            reasoning: reasoning.to_string(),
            signature: String::new(),
        };
        vote.signature = agent.sign(&vote.signable_bytes());
        self.consensus.cast_vote(vote).await
    }

    /// Read a knowledge node, read-aside through the cache
    pub async fn get_knowledge_node(&self, node_id: &str) -> Result<KnowledgeNode, SynodError> {
        let key = Keyspace::Node.key(node_id);
        if let Some(node) = self.cache.get_json::<KnowledgeNode>(&key) {
            return Ok(node);
        }
        let node = self.graph.get_node(node_id)?;
        self.cache.set_json(&key, &node, None);
        Ok(node)
    }

    /// Query the knowledge graph, read-aside through the cache
    pub async fn query_knowledge_graph(
        &self,
        pattern: &QueryPattern,
    ) -> Result<Vec<KnowledgeNode>, SynodError> {
        let key = Keyspace::Query.key(&query_cache_key(pattern));
        if let Some(results) = self.cache.get_json::<Vec<KnowledgeNode>>(&key) {
            return Ok(results);
        }
        let results = self.graph.query(pattern).await?;
        self.cache.set_json(&key, &results, None);
        Ok(results)
    }

    /// Write a node directly (outside consensus), invalidating the cache
    pub async fn upsert_node(&self, node: KnowledgeNode) -> Result<(), SynodError> {
        let id = node.id.clone();
        self.graph.upsert_node(node).await?;
        self.cache.invalidate(&Keyspace::Node.key(&id));
        self.cache.invalidate_by_pattern("query:*");
        Ok(())
    }

    /// Per-component health snapshot
    pub fn status(&self) -> Result<SynodStatus, SynodError> {
        let cache = self.cache.stats();
        Ok(SynodStatus {
            artifacts: self.artifacts.status()?,
            graph: self.graph.status()?,
            cache_hit_rate: cache.hit_rate(),
            cache,
            consensus: self.consensus.status(),
        })
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Synod node shutting down");
    }

    /// Apply approved mutations and invalidate affected cache entries.
    /// This is the sole consumer-side effect of a consensus decision.
    fn spawn_mutation_applier(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut events = self.events.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SystemEvent::ConsensusReached {
                            knowledge_node_id,
                            approved: true,
                            changes,
                            ..
                        }) => {
                            if let Err(e) = node.apply_approved_change(&knowledge_node_id, changes).await {
                                warn!(node_id = %knowledge_node_id, error = %e, "Failed to apply approved change");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    async fn apply_approved_change(
        &self,
        node_id: &str,
        changes: Map<String, Value>,
    ) -> Result<(), SynodError> {
        let mut node = self.graph.get_node(node_id)?;
        for (key, value) in changes {
            node.properties.insert(key, value);
        }
        node.updated_at = chrono::Utc::now().timestamp_millis();
        self.graph.upsert_node(node).await?;

        self.cache.invalidate(&Keyspace::Node.key(node_id));
        self.cache.invalidate_by_pattern("query:*");
        info!(node_id, "Applied approved change");
        Ok(())
    }
}

/// Stable cache key for a query pattern
fn query_cache_key(pattern: &QueryPattern) -> String {
    let encoded = serde_json::to_vec(pattern).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_node(window_ms: u64) -> (Arc<SynodNode>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.voting_window_ms = window_ms;
        config.proof_difficulty = 1;
        let node = SynodNode::start(config).await.unwrap();
        (node, dir)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn approved_change_applies_and_invalidates_cache() {
        let (node, _dir) = test_node(30_000).await;

        node.upsert_node(KnowledgeNode::new("n1", "concept").with_property("color", json!("red")))
            .await
            .unwrap();
        // Warm the cache
        node.get_knowledge_node("n1").await.unwrap();
        assert!(node.cache.get(&Keyspace::Node.key("n1")).is_some());

        let proposer = AgentIdentity::generate("proposer");
        let mut changes = Map::new();
        changes.insert("color".to_string(), json!("blue"));
        let receipt = node.propose_change("n1", changes, &proposer).await.unwrap();

        let height_before = node.consensus.chain().height();
        for (name, confidence) in [("a", 0.4), ("b", 0.4), ("c", 0.3)] {
            let voter = AgentIdentity::generate(name);
            node.cast_vote(&receipt.proposal_id, VoteChoice::Approve, confidence, "agreed", &voter)
                .await
                .unwrap();
        }

        // Block height increases by exactly one
        assert_eq!(node.consensus.chain().height(), height_before + 1);

        // The applier runs asynchronously off the event bus
        wait_for(|| {
            node.graph
                .get_node("n1")
                .map(|n| n.properties.get("color") == Some(&json!("blue")))
                .unwrap_or(false)
        })
        .await;

        // The stale cache entry is gone
        wait_for(|| node.cache.get(&Keyspace::Node.key("n1")).is_none()).await;
    }

    #[tokio::test]
    async fn split_votes_time_out_and_leave_state_untouched() {
        let (node, _dir) = test_node(200).await;

        node.upsert_node(KnowledgeNode::new("n1", "concept").with_property("color", json!("red")))
            .await
            .unwrap();

        let proposer = AgentIdentity::generate("proposer");
        let mut changes = Map::new();
        changes.insert("color".to_string(), json!("blue"));
        let receipt = node.propose_change("n1", changes, &proposer).await.unwrap();

        let votes = [
            ("a", VoteChoice::Approve, 0.3),
            ("b", VoteChoice::Reject, 0.3),
            ("c", VoteChoice::Abstain, 0.4),
        ];
        for (name, choice, confidence) in votes {
            let voter = AgentIdentity::generate(name);
            node.cast_vote(&receipt.proposal_id, choice, confidence, "split", &voter)
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;

        // No block, no mutation
        assert_eq!(node.consensus.chain().height(), 0);
        let n1 = node.get_knowledge_node("n1").await.unwrap();
        assert_eq!(n1.properties.get("color"), Some(&json!("red")));

        let history = node.consensus.voting_history(1).unwrap();
        assert_eq!(history[0].decision, crate::consensus::Decision::TimedOut);
    }

    #[tokio::test]
    async fn read_aside_caching_round_trip() {
        let (node, _dir) = test_node(30_000).await;

        node.upsert_node(KnowledgeNode::new("n1", "concept")).await.unwrap();

        let miss_path = node.get_knowledge_node("n1").await.unwrap();
        let hit_path = node.get_knowledge_node("n1").await.unwrap();
        assert_eq!(miss_path, hit_path);
        assert!(node.cache.stats().hits >= 1);

        let pattern = QueryPattern {
            node_type: Some("concept".to_string()),
            properties: Map::new(),
        };
        assert_eq!(node.query_knowledge_graph(&pattern).await.unwrap().len(), 1);
        assert_eq!(node.query_knowledge_graph(&pattern).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn status_reports_all_components() {
        let (node, _dir) = test_node(30_000).await;
        node.upsert_node(KnowledgeNode::new("n1", "concept")).await.unwrap();

        let status = node.status().unwrap();
        assert_eq!(status.graph.node_count, 1);
        assert_eq!(status.consensus.chain_height, 0);
        assert!(status.artifacts.healthy_nodes > 0);

        node.shutdown();
    }
}
