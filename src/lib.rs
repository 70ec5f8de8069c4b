//! Synod - consensus-validated distributed knowledge graph
//!
//! A single process hosting four cooperating subsystems:
//!
//! - **Artifact store**: content-addressed, replicated binary storage with
//!   chunking and checksum verification on every read
//! - **Graph shard manager**: knowledge nodes and relationships placed on
//!   partitions by a consistent hash ring
//! - **Cache cluster**: keyspace-prefixed in-memory cache with LZ4
//!   compression and event-driven invalidation
//! - **Consensus network**: signed proposals, confidence-weighted voting
//!   and a hash-chained block log of approved changes
//!
//! ## Storage Layout
//!
//! ```text
//! <data_dir>/
//! ├── artifacts/node-N/blobs/   # Content-addressed replica directories
//! ├── db/                       # Sled database (graph, chain, metadata)
//! ├── identity.key              # Validator signing key
//! └── config.toml               # Configuration
//! ```

pub mod artifact;
pub mod cache;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod graph;
pub mod http;
pub mod identity;
pub mod node;
pub mod ring;
pub mod storage_node;

// Re-exports
pub use artifact::ArtifactStore;
pub use cache::{CacheCluster, Keyspace};
pub use config::Config;
pub use consensus::{ConsensusNetwork, Decision, Proposal, Vote, VoteChoice};
pub use error::SynodError;
pub use events::{EventBus, SystemEvent};
pub use graph::{GraphShardManager, KnowledgeNode, QueryPattern, Relationship};
pub use http::StatusServer;
pub use identity::AgentIdentity;
pub use node::{SynodNode, SynodStatus};
pub use ring::HashRing;
pub use storage_node::{LocalStorageNode, StorageNode};
