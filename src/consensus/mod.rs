//! Consensus network
//!
//! Accepts change proposals referencing nodes in the graph store, collects
//! weighted votes from peers, and finalizes outcomes into the hash-chained
//! block log. Pending sessions live in an owned state store keyed by
//! proposal id and exposed only through insert-if-absent and
//! transition-if-voting operations, so a vote-driven closure and a
//! concurrent window-expiry closure can never both finalize the same
//! proposal.
//!
//! Approved proposals become blocks; rejected and timed-out outcomes are
//! recorded in the voting history log but produce no block. Signature and
//! integrity failures are rejected immediately and excluded from tallies,
//! never retried.

pub mod chain;
pub mod network;
pub mod session;

pub use chain::{merkle_root, Block, BlockChain};
pub use network::{PeerHub, PeerInfo, PeerMessage};
pub use session::{
    ConsensusRecord, Decision, Proposal, SessionState, Tally, Vote, VoteChoice, VotingSession,
};

use crate::config::Config;
use crate::error::SynodError;
use crate::events::{EventBus, SystemEvent};
use crate::graph::GraphShardManager;
use crate::identity::AgentIdentity;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Returned to a proposer when its proposal enters the voting window
#[derive(Debug, Clone, Serialize)]
pub struct ProposalReceipt {
    pub proposal_id: String,
    pub voting_session_id: String,
    /// Latest moment a decision will exist (window expiry)
    pub estimated_decision_ms: i64,
}

/// Audit record of a finalized outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub proposal_id: String,
    pub knowledge_node_id: String,
    pub decision: Decision,
    pub confidence: f64,
    pub voter_count: usize,
    /// Voter reasonings, kept for auditability
    pub reasonings: Vec<String>,
    pub block_index: Option<u64>,
    pub decided_at: i64,
}

/// Per-component health snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusStatus {
    pub chain_height: u64,
    pub tip_hash: String,
    pub peer_count: usize,
    pub pending_proposals: usize,
}

/// The consensus core
pub struct ConsensusNetwork {
    identity: AgentIdentity,
    graph: Arc<GraphShardManager>,
    chain: Arc<BlockChain>,
    peers: Arc<PeerHub>,
    events: EventBus,
    sessions: DashMap<String, Arc<Mutex<VotingSession>>>,
    history: sled::Tree,
    /// Consumed proposal nonces, for replay protection
    nonces: sled::Tree,
    /// Agent id -> public key, pinned on first sight
    agent_keys: sled::Tree,
    /// Monotonic history sequence (keys the history tree in decision order)
    history_seq: std::sync::atomic::AtomicU64,
    threshold: f64,
    window_ms: u64,
    min_voters: usize,
}

impl ConsensusNetwork {
    pub fn new(
        identity: AgentIdentity,
        graph: Arc<GraphShardManager>,
        db: &sled::Db,
        config: &Config,
        events: EventBus,
    ) -> Result<Self, SynodError> {
        let chain = Arc::new(BlockChain::open(db, config.proof_difficulty)?);
        let history = db.open_tree("voting-history")?;
        let nonces = db.open_tree("proposal-nonces")?;
        let agent_keys = db.open_tree("agent-keys")?;
        let next_seq = history
            .last()?
            .map(|(key, _)| {
                key.as_ref()
                    .try_into()
                    .map(u64::from_be_bytes)
                    .map(|n| n + 1)
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        info!(
            height = chain.height(),
            threshold = config.consensus_threshold,
            "Initialized consensus network"
        );
        Ok(Self {
            identity,
            graph,
            chain,
            peers: Arc::new(PeerHub::new()),
            events,
            sessions: DashMap::new(),
            history,
            nonces,
            agent_keys,
            history_seq: std::sync::atomic::AtomicU64::new(next_seq),
            threshold: config.consensus_threshold,
            window_ms: config.voting_window_ms,
            min_voters: config.min_voters,
        })
    }

    pub fn peers(&self) -> &Arc<PeerHub> {
        &self.peers
    }

    pub fn chain(&self) -> &Arc<BlockChain> {
        &self.chain
    }

    /// Accept a proposal, open its voting window and broadcast it.
    ///
    /// The referenced knowledge node must exist and the proposer signature
    /// must verify. Duplicate proposal ids are rejected: insertion into
    /// the pending store is insert-if-absent.
    pub async fn submit_proposal(
        self: &Arc<Self>,
        proposal: Proposal,
    ) -> Result<ProposalReceipt, SynodError> {
        if !proposal.verify_signature() {
            warn!(proposal = %proposal.id, proposer = %proposal.proposer, "Proposal signature invalid");
            return Err(SynodError::SignatureInvalid {
                signer: proposal.proposer.clone(),
            });
        }
        self.bind_agent_key(&proposal.proposer, &proposal.proposer_public_key)?;
        // The referenced node must exist before voting opens
        self.graph.get_node(&proposal.knowledge_node_id)?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut session =
            VotingSession::new(proposal.clone(), now, self.window_ms, self.threshold, self.min_voters);
        session.open()?;
        let deadline = session.deadline_ms;

        match self.sessions.entry(proposal.id.clone()) {
            Entry::Occupied(_) => {
                return Err(SynodError::Internal(format!(
                    "proposal {} already pending",
                    proposal.id
                )));
            }
            Entry::Vacant(slot) => {
                // Replay protection: a (proposer, nonce) pair is consumed
                // forever, but only by a proposal actually admitted. A
                // rejected duplicate must not burn a fresh nonce.
                let nonce_key = format!("{}:{}", proposal.proposer, proposal.nonce);
                if self
                    .nonces
                    .insert(nonce_key.as_bytes(), &[1u8][..])?
                    .is_some()
                {
                    return Err(SynodError::Internal(format!(
                        "proposal nonce {} already consumed",
                        proposal.nonce
                    )));
                }
                slot.insert(Arc::new(Mutex::new(session)));
            }
        }

        self.peers
            .broadcast(PeerMessage::Proposal(proposal.clone()))
            .await;
        info!(proposal = %proposal.id, node = %proposal.knowledge_node_id, "Opened voting window");

        // Hard deadline: the timer forces closure regardless of in-flight
        // votes; the state machine arbitrates if a vote closes it first.
        let network = Arc::clone(self);
        let proposal_id = proposal.id.clone();
        let window = Duration::from_millis(self.window_ms);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Err(e) = network.close_due_session(&proposal_id).await {
                warn!(proposal = %proposal_id, error = %e, "Window-expiry closure failed");
            }
        });

        Ok(ProposalReceipt {
            proposal_id: proposal.id.clone(),
            voting_session_id: proposal.id,
            estimated_decision_ms: deadline,
        })
    }

    /// Record a vote on a pending proposal and close the session if a
    /// threshold is crossed.
    pub async fn cast_vote(self: &Arc<Self>, vote: Vote) -> Result<Vote, SynodError> {
        if !(0.0..=1.0).contains(&vote.confidence) {
            return Err(SynodError::Internal(format!(
                "vote confidence {} outside [0, 1]",
                vote.confidence
            )));
        }
        if !vote.verify_signature() {
            warn!(vote = %vote.id, voter = %vote.voter, "Vote signature invalid, excluded");
            return Err(SynodError::SignatureInvalid {
                signer: vote.voter.clone(),
            });
        }
        self.bind_agent_key(&vote.voter, &vote.voter_public_key)?;

        let session = self
            .sessions
            .get(&vote.proposal_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SynodError::NotFound(vote.proposal_id.clone()))?;

        let decision = {
            let mut session = session.lock().await;
            session.add_vote(vote.clone())?;
            debug!(proposal = %vote.proposal_id, voter = %vote.voter, choice = vote.choice.as_str(), "Vote recorded");
            session.try_decide(chrono::Utc::now().timestamp_millis())
        };

        self.peers.broadcast(PeerMessage::Vote(vote.clone())).await;

        if let Some(decision) = decision {
            self.finalize(&vote.proposal_id, decision).await?;
        }
        Ok(vote)
    }

    /// Timer-driven closure at window expiry
    async fn close_due_session(self: &Arc<Self>, proposal_id: &str) -> Result<(), SynodError> {
        let session = match self.sessions.get(proposal_id) {
            Some(s) => Arc::clone(s.value()),
            // Already finalized by a vote
            None => return Ok(()),
        };
        let decision = {
            let session = session.lock().await;
            session.try_decide(chrono::Utc::now().timestamp_millis())
        };
        if let Some(decision) = decision {
            self.finalize(proposal_id, decision).await?;
        }
        Ok(())
    }

    /// Finalize exactly once: the session transition arbitrates between
    /// racing vote-driven and timer-driven closures. On approval a block
    /// is assembled, mined, validated and appended; otherwise only the
    /// history log records the outcome.
    async fn finalize(
        self: &Arc<Self>,
        proposal_id: &str,
        decision: Decision,
    ) -> Result<Option<u64>, SynodError> {
        let session = match self.sessions.get(proposal_id) {
            Some(s) => Arc::clone(s.value()),
            None => return Ok(None),
        };
        let mut session = session.lock().await;
        if session.decide(decision).is_err() {
            // The other closure path got here first
            return Ok(None);
        }

        let votes = session.votes();
        let vote_root = merkle_root(&votes.iter().map(|v| v.leaf_bytes()).collect::<Vec<_>>());
        let record = ConsensusRecord {
            proposal_id: proposal_id.to_string(),
            decision,
            confidence: session.winning_confidence(decision),
            votes,
            merkle_root: vote_root.clone(),
            validator: self.identity.agent_id().to_string(),
            validator_public_key: self.identity.public_key_hex(),
            signature: self.identity.sign(vote_root.as_bytes()),
        };

        let block_index = if decision == Decision::Approved {
            let block = self.chain.build_block(
                vec![session.proposal.clone()],
                record.clone(),
                &self.identity,
            );
            let index = self.chain.append(block.clone())?;
            self.peers.broadcast(PeerMessage::Block(block)).await;
            Some(index)
        } else {
            None
        };

        session.finalize()?;
        let proposal = session.proposal.clone();
        let tally = session.tally();
        let reasonings = session
            .votes()
            .iter()
            .map(|v| format!("{} ({}): {}", v.voter, v.choice.as_str(), v.reasoning))
            .collect();
        drop(session);

        // Consumed exactly once; a second finalize finds nothing
        self.sessions.remove(proposal_id);

        self.record_history(HistoryEntry {
            proposal_id: proposal_id.to_string(),
            knowledge_node_id: proposal.knowledge_node_id.clone(),
            decision,
            confidence: record.confidence,
            voter_count: tally.voter_count,
            reasonings,
            block_index,
            decided_at: chrono::Utc::now().timestamp_millis(),
        })?;

        info!(
            proposal = %proposal_id,
            decision = decision.as_str(),
            confidence = record.confidence,
            block = ?block_index,
            "Proposal finalized"
        );
        self.events.publish(SystemEvent::ConsensusReached {
            proposal_id: proposal_id.to_string(),
            knowledge_node_id: proposal.knowledge_node_id,
            approved: decision == Decision::Approved,
            changes: proposal.changes,
            block_index,
        });
        Ok(block_index)
    }

    /// Pin an agent id to the first public key seen for it. Signatures are
    /// self-certifying against the key carried in the message, so without
    /// this binding anyone could claim another agent's id; with it, a later
    /// message naming a bound id under a different key is rejected.
    fn bind_agent_key(&self, agent_id: &str, public_key_hex: &str) -> Result<(), SynodError> {
        match self.agent_keys.compare_and_swap(
            agent_id.as_bytes(),
            None as Option<&[u8]>,
            Some(public_key_hex.as_bytes()),
        )? {
            Ok(()) => Ok(()),
            Err(cas) if cas.current.as_deref() == Some(public_key_hex.as_bytes()) => Ok(()),
            Err(_) => {
                warn!(agent = %agent_id, "Key does not match the one bound to this agent id");
                Err(SynodError::SignatureInvalid {
                    signer: agent_id.to_string(),
                })
            }
        }
    }

    /// Handle an inbound peer message. Signatures are validated before any
    /// state changes (inside submit/cast/append).
    pub async fn handle_message(self: &Arc<Self>, message: PeerMessage) {
        match message {
            PeerMessage::Identify {
                node_id,
                public_key,
                is_validator,
            } => {
                match self.bind_agent_key(&node_id, &public_key) {
                    Ok(()) => debug!(peer = %node_id, is_validator, "Peer identified"),
                    Err(e) => warn!(peer = %node_id, error = %e, "Peer identity rejected"),
                }
            }
            PeerMessage::Proposal(proposal) => {
                if let Err(e) = self.submit_proposal(proposal).await {
                    warn!(error = %e, "Rejected peer proposal");
                }
            }
            PeerMessage::Vote(vote) => {
                if let Err(e) = self.cast_vote(vote).await {
                    warn!(error = %e, "Rejected peer vote");
                }
            }
            PeerMessage::Block(block) => {
                // A failing block never mutates the chain; we keep our tip
                if let Err(e) = self.chain.append(block) {
                    warn!(error = %e, "Rejected peer block");
                }
            }
        }
    }

    /// Most recent finalized outcomes, newest first
    pub fn voting_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, SynodError> {
        let mut entries = Vec::new();
        for item in self.history.iter().rev().take(limit) {
            let (_, value) = item?;
            let entry: HistoryEntry = rmp_serde::from_slice(&value)
                .map_err(|e| SynodError::Encoding(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Component health snapshot
    pub fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            chain_height: self.chain.height(),
            tip_hash: self.chain.tip_hash(),
            peer_count: self.peers.peer_count(),
            pending_proposals: self.sessions.len(),
        }
    }

    fn record_history(&self, entry: HistoryEntry) -> Result<(), SynodError> {
        let seq = self
            .history_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let value = rmp_serde::to_vec(&entry).map_err(|e| SynodError::Encoding(e.to_string()))?;
        self.history.insert(seq.to_be_bytes(), value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::KnowledgeNode;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        network: Arc<ConsensusNetwork>,
        #[allow(dead_code)]
        graph: Arc<GraphShardManager>,
        events: EventBus,
        _dir: TempDir,
    }

    async fn harness(window_ms: u64) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.voting_window_ms = window_ms;
        config.proof_difficulty = 1;

        let db = sled::open(dir.path().join("db")).unwrap();
        let graph = Arc::new(GraphShardManager::new(&db, &config).unwrap());
        graph
            .upsert_node(KnowledgeNode::new("n1", "concept").with_property("v", json!(1)))
            .await
            .unwrap();

        let events = EventBus::new();
        let identity = AgentIdentity::generate("validator");
        let network = Arc::new(
            ConsensusNetwork::new(identity, Arc::clone(&graph), &db, &config, events.clone())
                .unwrap(),
        );
        Harness {
            network,
            graph,
            events,
            _dir: dir,
        }
    }

    fn proposal_for(identity: &AgentIdentity, node_id: &str) -> Proposal {
        let mut changes = serde_json::Map::new();
        changes.insert("v".to_string(), json!(2));
        let mut proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            knowledge_node_id: node_id.to_string(),
            changes,
            proposer: identity.agent_id().to_string(),
            proposer_public_key: identity.public_key_hex(),
            signature: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            nonce: uuid::Uuid::new_v4().to_string(),
        };
        proposal.signature = identity.sign(&proposal.signable_bytes());
        proposal
    }

    fn vote_for(
        identity: &AgentIdentity,
        proposal_id: &str,
        choice: VoteChoice,
        confidence: f64,
    ) -> Vote {
        let mut vote = Vote {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: proposal_id.to_string(),
            voter: identity.agent_id().to_string(),
            voter_public_key: identity.public_key_hex(),
            choice,
            confidence,
            reasoning: "because".to_string(),
            signature: String::new(),
        };
        vote.signature = identity.sign(&vote.signable_bytes());
        vote
    }

    #[tokio::test]
    async fn weighted_approval_produces_a_block() {
        let h = harness(30_000).await;
        let proposer = AgentIdentity::generate("proposer");
        let mut events = h.events.subscribe();

        let receipt = h
            .network
            .submit_proposal(proposal_for(&proposer, "n1"))
            .await
            .unwrap();
        assert_eq!(h.network.status().pending_proposals, 1);

        for (name, confidence) in [("a", 0.4), ("b", 0.4), ("c", 0.3)] {
            let voter = AgentIdentity::generate(name);
            h.network
                .cast_vote(vote_for(&voter, &receipt.proposal_id, VoteChoice::Approve, confidence))
                .await
                .unwrap();
        }

        assert_eq!(h.network.chain().height(), 1);
        assert_eq!(h.network.status().pending_proposals, 0);

        // ConsensusReached event carries the block index
        loop {
            match events.recv().await.unwrap() {
                SystemEvent::ConsensusReached {
                    approved,
                    block_index,
                    ..
                } => {
                    assert!(approved);
                    assert_eq!(block_index, Some(1));
                    break;
                }
                _ => continue,
            }
        }

        let history = h.network.voting_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision, Decision::Approved);
        assert_eq!(history[0].voter_count, 3);
    }

    #[tokio::test]
    async fn weighted_rejection_produces_no_block() {
        let h = harness(30_000).await;
        let proposer = AgentIdentity::generate("proposer");

        let receipt = h
            .network
            .submit_proposal(proposal_for(&proposer, "n1"))
            .await
            .unwrap();

        for (name, confidence) in [("a", 0.5), ("b", 0.3), ("c", 0.2)] {
            let voter = AgentIdentity::generate(name);
            let _ = h
                .network
                .cast_vote(vote_for(&voter, &receipt.proposal_id, VoteChoice::Reject, confidence))
                .await;
        }

        assert_eq!(h.network.chain().height(), 0);
        let history = h.network.voting_history(10).unwrap();
        assert_eq!(history[0].decision, Decision::Rejected);
        assert!(history[0].block_index.is_none());
    }

    #[tokio::test]
    async fn split_votes_time_out_without_block() {
        let h = harness(200).await;
        let proposer = AgentIdentity::generate("proposer");

        let receipt = h
            .network
            .submit_proposal(proposal_for(&proposer, "n1"))
            .await
            .unwrap();

        let votes = [
            ("a", VoteChoice::Approve, 0.3),
            ("b", VoteChoice::Reject, 0.3),
            ("c", VoteChoice::Abstain, 0.4),
        ];
        for (name, choice, confidence) in votes {
            let voter = AgentIdentity::generate(name);
            h.network
                .cast_vote(vote_for(&voter, &receipt.proposal_id, choice, confidence))
                .await
                .unwrap();
        }

        // Wait out the voting window
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(h.network.chain().height(), 0);
        let history = h.network.voting_history(10).unwrap();
        assert_eq!(history[0].decision, Decision::TimedOut);
        assert_eq!(h.network.status().pending_proposals, 0);
    }

    #[tokio::test]
    async fn unsigned_proposal_is_rejected() {
        let h = harness(30_000).await;
        let proposer = AgentIdentity::generate("proposer");
        let mut proposal = proposal_for(&proposer, "n1");
        proposal.changes.insert("extra".to_string(), json!(true));

        assert!(matches!(
            h.network.submit_proposal(proposal).await,
            Err(SynodError::SignatureInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn proposal_for_missing_node_is_rejected() {
        let h = harness(30_000).await;
        let proposer = AgentIdentity::generate("proposer");

        assert!(matches!(
            h.network.submit_proposal(proposal_for(&proposer, "ghost")).await,
            Err(SynodError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn vote_on_unknown_proposal_is_rejected() {
        let h = harness(30_000).await;
        let voter = AgentIdentity::generate("a");
        assert!(matches!(
            h.network
                .cast_vote(vote_for(&voter, "ghost", VoteChoice::Approve, 0.9))
                .await,
            Err(SynodError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn forged_vote_cannot_overwrite_a_bound_voter() {
        let h = harness(30_000).await;
        let proposer = AgentIdentity::generate("proposer");
        let receipt = h
            .network
            .submit_proposal(proposal_for(&proposer, "n1"))
            .await
            .unwrap();

        let alice = AgentIdentity::generate("alice");
        h.network
            .cast_vote(vote_for(&alice, &receipt.proposal_id, VoteChoice::Approve, 0.9))
            .await
            .unwrap();

        // A vote claiming alice's id, signed with another keypair, is
        // self-consistent but must not replace her vote
        let mallory = AgentIdentity::generate("mallory");
        let mut forged = vote_for(&mallory, &receipt.proposal_id, VoteChoice::Reject, 1.0);
        forged.voter = alice.agent_id().to_string();
        forged.signature = mallory.sign(&forged.signable_bytes());
        assert!(forged.verify_signature());
        assert!(matches!(
            h.network.cast_vote(forged).await,
            Err(SynodError::SignatureInvalid { .. })
        ));

        // Alice's approval still counts toward the threshold
        for (name, confidence) in [("b", 0.4), ("c", 0.3)] {
            let voter = AgentIdentity::generate(name);
            h.network
                .cast_vote(vote_for(&voter, &receipt.proposal_id, VoteChoice::Approve, confidence))
                .await
                .unwrap();
        }
        assert_eq!(h.network.chain().height(), 1);
        let history = h.network.voting_history(1).unwrap();
        assert_eq!(history[0].decision, Decision::Approved);
    }

    #[tokio::test]
    async fn proposer_id_is_bound_to_its_key() {
        let h = harness(30_000).await;
        let real = AgentIdentity::generate("proposer");
        h.network
            .submit_proposal(proposal_for(&real, "n1"))
            .await
            .unwrap();

        let impostor = AgentIdentity::generate("impostor");
        let mut forged = proposal_for(&impostor, "n1");
        forged.proposer = real.agent_id().to_string();
        forged.signature = impostor.sign(&forged.signable_bytes());
        assert!(matches!(
            h.network.submit_proposal(forged).await,
            Err(SynodError::SignatureInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_duplicate_does_not_burn_its_nonce() {
        let h = harness(30_000).await;
        let proposer = AgentIdentity::generate("proposer");
        let first = proposal_for(&proposer, "n1");
        h.network.submit_proposal(first.clone()).await.unwrap();

        // Same id under a fresh nonce: rejected as already pending
        let mut duplicate = proposal_for(&proposer, "n1");
        duplicate.id = first.id.clone();
        duplicate.signature = proposer.sign(&duplicate.signable_bytes());
        let unburned_nonce = duplicate.nonce.clone();
        assert!(h.network.submit_proposal(duplicate).await.is_err());

        // That nonce is still usable by a later proposal
        let mut fresh = proposal_for(&proposer, "n1");
        fresh.nonce = unburned_nonce;
        fresh.signature = proposer.sign(&fresh.signable_bytes());
        h.network.submit_proposal(fresh).await.unwrap();

        // Whereas an admitted proposal's nonce is consumed forever
        let mut replay = proposal_for(&proposer, "n1");
        replay.nonce = first.nonce.clone();
        replay.signature = proposer.sign(&replay.signable_bytes());
        assert!(h.network.submit_proposal(replay).await.is_err());
    }

    #[tokio::test]
    async fn revote_overwrites_and_duplicate_proposals_are_rejected() {
        let h = harness(30_000).await;
        let proposer = AgentIdentity::generate("proposer");
        let proposal = proposal_for(&proposer, "n1");

        h.network.submit_proposal(proposal.clone()).await.unwrap();
        assert!(h.network.submit_proposal(proposal.clone()).await.is_err());

        // A voter flipping its vote replaces the prior one
        let voter = AgentIdentity::generate("a");
        h.network
            .cast_vote(vote_for(&voter, &proposal.id, VoteChoice::Approve, 0.9))
            .await
            .unwrap();
        h.network
            .cast_vote(vote_for(&voter, &proposal.id, VoteChoice::Reject, 0.9))
            .await
            .unwrap();
        assert_eq!(h.network.status().pending_proposals, 1);
    }
}
