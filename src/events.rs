//! System event bus
//!
//! Consensus outcomes and cache invalidations travel over one broadcast
//! channel instead of direct callbacks, so the consensus core never holds
//! references to its consumers. Every cache process subscribes and evicts
//! matching keys locally; coherence across processes is eventual, bounded
//! by channel propagation.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity; slow subscribers lag rather than block senders
const CHANNEL_CAPACITY: usize = 1024;

/// Events published on the shared bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    /// Evict one cache key everywhere
    InvalidateKey { key: String },
    /// Evict every cache key matching a pattern (prefix, `*` suffix)
    InvalidatePattern { pattern: String },
    /// A proposal reached a final decision. Carries the approved diff so
    /// subscribers can apply the mutation without reaching back into the
    /// consensus core.
    ConsensusReached {
        proposal_id: String,
        knowledge_node_id: String,
        approved: bool,
        changes: serde_json::Map<String, serde_json::Value>,
        block_index: Option<u64>,
    },
    /// Cache memory usage crossed the configured fraction of capacity
    HighMemoryUsage { used_bytes: u64, capacity_bytes: u64 },
    /// A storage or peer node failed its health check
    NodeUnhealthy { node_id: String },
}

/// Shared event bus
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Delivery is best-effort: with no subscribers the
    /// event is dropped, which is correct for invalidation traffic.
    pub fn publish(&self, event: SystemEvent) {
        debug!(?event, "Publishing system event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
