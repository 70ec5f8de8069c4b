//! Per-proposal voting session state machine
//!
//! Pure state transitions, no IO and no timers: the network layer owns
//! the clock and feeds `now` in. The lifecycle is
//!
//! ```text
//! Proposed → Voting → Decided(Approved | Rejected | TimedOut) → Finalized
//! ```
//!
//! Terminal transitions happen exactly once: `decide` fails unless the
//! session is still `Voting`, so a vote-driven closure and a concurrent
//! window-expiry closure cannot both finalize the same proposal.

use crate::error::SynodError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A vote kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

impl VoteChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteChoice::Approve => "APPROVE",
            VoteChoice::Reject => "REJECT",
            VoteChoice::Abstain => "ABSTAIN",
        }
    }
}

/// A proposed mutation to a knowledge node.
///
/// Immutable once broadcast; the nonce protects against replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub knowledge_node_id: String,
    /// Diff payload merged into the node's properties on approval
    pub changes: serde_json::Map<String, serde_json::Value>,
    pub proposer: String,
    pub proposer_public_key: String,
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

impl Proposal {
    /// Canonical byte encoding covered by the proposer's signature
    pub fn signable_bytes(&self) -> Vec<u8> {
        let changes = serde_json::to_string(&self.changes).unwrap_or_default();
        format!(
            "proposal|{}|{}|{}|{}|{}|{}",
            self.id, self.knowledge_node_id, changes, self.proposer, self.timestamp, self.nonce
        )
        .into_bytes()
    }

    pub fn verify_signature(&self) -> bool {
        crate::identity::verify(
            &self.signable_bytes(),
            &self.signature,
            &self.proposer_public_key,
        )
    }
}

/// A confidence-weighted vote on a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub proposal_id: String,
    pub voter: String,
    pub voter_public_key: String,
    pub choice: VoteChoice,
    /// Vote weight in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub signature: String,
}

impl Vote {
    /// Canonical byte encoding covered by the voter's signature
    pub fn signable_bytes(&self) -> Vec<u8> {
        format!(
            "vote|{}|{}|{}|{}|{:.6}|{}",
            self.id,
            self.proposal_id,
            self.voter,
            self.choice.as_str(),
            self.confidence,
            self.reasoning
        )
        .into_bytes()
    }

    pub fn verify_signature(&self) -> bool {
        crate::identity::verify(&self.signable_bytes(), &self.signature, &self.voter_public_key)
    }

    /// Merkle leaf covering every field, so any post-hoc tampering is
    /// detectable
    pub fn leaf_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Final decision for a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Approved,
    Rejected,
    TimedOut,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "APPROVED",
            Decision::Rejected => "REJECTED",
            Decision::TimedOut => "TIMEOUT",
        }
    }
}

/// The immutable outcome of a voting session, feeding block construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub proposal_id: String,
    pub decision: Decision,
    /// Winning weighted ratio
    pub confidence: f64,
    pub votes: Vec<Vote>,
    /// Merkle root over the votes
    pub merkle_root: String,
    pub validator: String,
    pub validator_public_key: String,
    pub signature: String,
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Proposed,
    Voting,
    Decided(Decision),
    Finalized(Decision),
}

impl SessionState {
    fn name(&self) -> String {
        match self {
            SessionState::Proposed => "PROPOSED".to_string(),
            SessionState::Voting => "VOTING".to_string(),
            SessionState::Decided(d) => format!("DECIDED({})", d.as_str()),
            SessionState::Finalized(d) => format!("FINALIZED({})", d.as_str()),
        }
    }
}

/// Weighted tally over the votes cast so far
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tally {
    pub approve_ratio: f64,
    pub reject_ratio: f64,
    pub total_confidence: f64,
    pub voter_count: usize,
}

/// One proposal's voting session
#[derive(Debug, Clone)]
pub struct VotingSession {
    pub proposal: Proposal,
    votes: HashMap<String, Vote>,
    state: SessionState,
    pub opened_at_ms: i64,
    pub deadline_ms: i64,
    threshold: f64,
    min_voters: usize,
}

impl VotingSession {
    pub fn new(
        proposal: Proposal,
        now_ms: i64,
        window_ms: u64,
        threshold: f64,
        min_voters: usize,
    ) -> Self {
        Self {
            proposal,
            votes: HashMap::new(),
            state: SessionState::Proposed,
            opened_at_ms: now_ms,
            deadline_ms: now_ms + window_ms as i64,
            threshold,
            min_voters,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn votes(&self) -> Vec<Vote> {
        let mut votes: Vec<Vote> = self.votes.values().cloned().collect();
        // Stable order for merkle construction
        votes.sort_by(|a, b| a.voter.cmp(&b.voter));
        votes
    }

    /// Enter the voting window (on broadcast)
    pub fn open(&mut self) -> Result<(), SynodError> {
        match self.state {
            SessionState::Proposed => {
                self.state = SessionState::Voting;
                Ok(())
            }
            other => Err(SynodError::InvalidTransition {
                from: other.name(),
                to: "VOTING".to_string(),
            }),
        }
    }

    /// Record a vote. A voter casting twice overwrites its prior vote,
    /// provided the same key signs both: a vote claiming an already-seen
    /// voter id under a different key is rejected, so the overwrite right
    /// belongs to the keyholder, not to anyone who can type the name.
    pub fn add_vote(&mut self, vote: Vote) -> Result<(), SynodError> {
        if self.state != SessionState::Voting {
            return Err(SynodError::InvalidTransition {
                from: self.state.name(),
                to: "VOTING".to_string(),
            });
        }
        if let Some(existing) = self.votes.get(&vote.voter) {
            if existing.voter_public_key != vote.voter_public_key {
                return Err(SynodError::SignatureInvalid {
                    signer: vote.voter.clone(),
                });
            }
        }
        self.votes.insert(vote.voter.clone(), vote);
        Ok(())
    }

    /// Weighted ratios over all confidence cast so far
    pub fn tally(&self) -> Tally {
        let total: f64 = self.votes.values().map(|v| v.confidence).sum();
        let sum_for = |choice: VoteChoice| -> f64 {
            self.votes
                .values()
                .filter(|v| v.choice == choice)
                .map(|v| v.confidence)
                .sum()
        };
        let (approve_ratio, reject_ratio) = if total > 0.0 {
            (
                sum_for(VoteChoice::Approve) / total,
                sum_for(VoteChoice::Reject) / total,
            )
        } else {
            (0.0, 0.0)
        };
        Tally {
            approve_ratio,
            reject_ratio,
            total_confidence: total,
            voter_count: self.votes.len(),
        }
    }

    /// Whether the session has crossed a decision point.
    ///
    /// Threshold checks require the minimum voter count; the deadline
    /// forces closure regardless of in-flight votes.
    pub fn try_decide(&self, now_ms: i64) -> Option<Decision> {
        if self.state != SessionState::Voting {
            return None;
        }
        let tally = self.tally();
        if tally.voter_count >= self.min_voters {
            if tally.approve_ratio >= self.threshold {
                return Some(Decision::Approved);
            }
            if tally.reject_ratio >= self.threshold {
                return Some(Decision::Rejected);
            }
        }
        if now_ms >= self.deadline_ms {
            return Some(Decision::TimedOut);
        }
        None
    }

    /// Close the session exactly once. Fails unless still `Voting`.
    pub fn decide(&mut self, decision: Decision) -> Result<(), SynodError> {
        match self.state {
            SessionState::Voting => {
                self.state = SessionState::Decided(decision);
                Ok(())
            }
            other => Err(SynodError::InvalidTransition {
                from: other.name(),
                to: format!("DECIDED({})", decision.as_str()),
            }),
        }
    }

    /// Mark the decided outcome as fully applied
    pub fn finalize(&mut self) -> Result<Decision, SynodError> {
        match self.state {
            SessionState::Decided(decision) => {
                self.state = SessionState::Finalized(decision);
                Ok(decision)
            }
            other => Err(SynodError::InvalidTransition {
                from: other.name(),
                to: "FINALIZED".to_string(),
            }),
        }
    }

    /// Winning ratio for the decided outcome
    pub fn winning_confidence(&self, decision: Decision) -> f64 {
        let tally = self.tally();
        match decision {
            Decision::Approved => tally.approve_ratio,
            Decision::Rejected => tally.reject_ratio,
            Decision::TimedOut => tally.approve_ratio.max(tally.reject_ratio),
        }
    }
}
