//! Peer wire protocol and fan-out hub
//!
//! Four logical message types travel between peers: `Identify`,
//! `Proposal`, `Vote` and `Block`. The protocol is transport-agnostic;
//! messages are serde-encoded and any peer may originate any of them.
//! Receivers validate signatures before acting.
//!
//! `PeerHub` is the fan-out side: each connected peer registers an mpsc
//! channel and broadcasts go to every registered peer in parallel. A peer
//! whose channel is gone is pruned on the next broadcast.

use crate::consensus::chain::Block;
use crate::consensus::session::{Proposal, Vote};
use serde::{Deserialize, Serialize};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-peer channel capacity
const PEER_CHANNEL_CAPACITY: usize = 256;

/// Logical peer messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Peer introduction
    Identify {
        node_id: String,
        public_key: String,
        is_validator: bool,
    },
    /// A new proposal entering its voting window
    Proposal(Proposal),
    /// A vote on a pending proposal
    Vote(Vote),
    /// A finalized block
    Block(Block),
}

/// A connected peer as seen by the hub
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub public_key: String,
    pub is_validator: bool,
}

struct PeerSlot {
    info: PeerInfo,
    tx: mpsc::Sender<PeerMessage>,
}

/// Fan-out hub over the currently connected peers
pub struct PeerHub {
    peers: DashMap<String, PeerSlot>,
}

impl PeerHub {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    /// Register a peer, returning the receiving end of its channel
    pub fn register(&self, info: PeerInfo) -> mpsc::Receiver<PeerMessage> {
        let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        debug!(peer = %info.node_id, "Registered peer");
        self.peers
            .insert(info.node_id.clone(), PeerSlot { info, tx });
        rx
    }

    /// Remove a peer
    pub fn unregister(&self, node_id: &str) {
        if self.peers.remove(node_id).is_some() {
            debug!(peer = %node_id, "Unregistered peer");
        }
    }

    /// Broadcast a message to every connected peer.
    ///
    /// Sends are asynchronous and best-effort; peers with closed channels
    /// are pruned.
    pub async fn broadcast(&self, message: PeerMessage) {
        let targets: Vec<(String, mpsc::Sender<PeerMessage>)> = self
            .peers
            .iter()
            .map(|slot| (slot.key().clone(), slot.value().tx.clone()))
            .collect();

        let sends = targets.into_iter().map(|(node_id, tx)| {
            let message = message.clone();
            async move {
                if tx.send(message).await.is_err() {
                    Some(node_id)
                } else {
                    None
                }
            }
        });

        for dead in futures::future::join_all(sends).await.into_iter().flatten() {
            warn!(peer = %dead, "Peer channel closed, pruning");
            self.unregister(&dead);
        }
    }

    /// Send to one peer
    pub async fn send_to(&self, node_id: &str, message: PeerMessage) -> bool {
        let tx = match self.peers.get(node_id) {
            Some(slot) => slot.tx.clone(),
            None => return false,
        };
        tx.send(message).await.is_ok()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(|slot| slot.info.clone()).collect()
    }
}

impl Default for PeerHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerInfo {
        PeerInfo {
            node_id: id.to_string(),
            public_key: String::new(),
            is_validator: true,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_peers() {
        let hub = PeerHub::new();
        let mut rx1 = hub.register(peer("p1"));
        let mut rx2 = hub.register(peer("p2"));

        hub.broadcast(PeerMessage::Identify {
            node_id: "origin".to_string(),
            public_key: "pk".to_string(),
            is_validator: false,
        })
        .await;

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                PeerMessage::Identify { node_id, .. } => assert_eq!(node_id, "origin"),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dropped_peers_are_pruned() {
        let hub = PeerHub::new();
        let rx = hub.register(peer("p1"));
        drop(rx);
        assert_eq!(hub.peer_count(), 1);

        hub.broadcast(PeerMessage::Identify {
            node_id: "origin".to_string(),
            public_key: String::new(),
            is_validator: false,
        })
        .await;
        assert_eq!(hub.peer_count(), 0);
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_false() {
        let hub = PeerHub::new();
        assert!(
            !hub.send_to(
                "ghost",
                PeerMessage::Identify {
                    node_id: "x".to_string(),
                    public_key: String::new(),
                    is_validator: false,
                }
            )
            .await
        );
    }
}
