//! Hash-chained block log for finalized decisions
//!
//! Blocks are appended to a sled tree keyed by big-endian index, starting
//! at a fixed genesis sentinel. The chain provides the single global total
//! order for finalized decisions: `block[i].previous_hash` must equal
//! `hash(block[i-1])` for every `i > 0`.
//!
//! The nonce is a brute-force proof-of-task against a fixed low difficulty
//! target. It is a correctness placeholder, not a Sybil or spam defense.

use crate::consensus::session::{ConsensusRecord, Proposal};
use crate::error::SynodError;
use crate::identity::{verify, AgentIdentity};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Previous-hash value of the genesis block
const GENESIS_PREVIOUS: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A finalized block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    /// Proposals finalized by this block
    pub transactions: Vec<Proposal>,
    /// Voting outcome; `None` only for the genesis sentinel
    pub consensus: Option<ConsensusRecord>,
    pub previous_hash: String,
    /// Merkle root over the transactions
    pub merkle_root: String,
    pub validator: String,
    pub validator_public_key: String,
    /// Proof-of-task solution
    pub nonce: u64,
    pub hash: String,
    pub signature: String,
}

impl Block {
    /// Recompute this block's hash from its fields
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.merkle_root.as_bytes());
        if let Some(consensus) = &self.consensus {
            hasher.update(consensus.merkle_root.as_bytes());
            hasher.update(consensus.decision.as_str().as_bytes());
        }
        hasher.update(self.validator.as_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// The fixed genesis sentinel
    pub fn genesis() -> Self {
        let mut block = Block {
            index: 0,
            timestamp: 0,
            transactions: Vec::new(),
            consensus: None,
            previous_hash: GENESIS_PREVIOUS.to_string(),
            merkle_root: merkle_root(&[]),
            validator: "genesis".to_string(),
            validator_public_key: String::new(),
            nonce: 0,
            hash: String::new(),
            signature: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }
}

/// Merkle root over a set of byte leaves.
///
/// Leaves are hashed, then folded pairwise (odd leaf duplicated) until a
/// single root remains. Any single-item tampering changes the root.
pub fn merkle_root(leaves: &[Vec<u8>]) -> String {
    if leaves.is_empty() {
        return hex::encode(Sha256::digest(b"empty"));
    }
    let mut level: Vec<Vec<u8>> = leaves
        .iter()
        .map(|leaf| Sha256::digest(leaf).to_vec())
        .collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(&pair[0]);
            hasher.update(pair.get(1).unwrap_or(&pair[0]));
            next.push(hasher.finalize().to_vec());
        }
        level = next;
    }
    hex::encode(&level[0])
}

/// Append-only hash-chained block store
pub struct BlockChain {
    blocks: sled::Tree,
    difficulty: usize,
    /// Cached tip (height, hash) so appends avoid a tree scan
    tip: RwLock<(u64, String)>,
}

impl BlockChain {
    /// Open the chain, writing the genesis sentinel if the tree is empty
    pub fn open(db: &sled::Db, difficulty: usize) -> Result<Self, SynodError> {
        let blocks = db.open_tree("chain")?;
        if blocks.is_empty() {
            let genesis = Block::genesis();
            blocks.insert(0u64.to_be_bytes(), encode_block(&genesis)?)?;
            info!("Wrote genesis block");
        }
        let (index, value) = blocks
            .last()?
            .ok_or_else(|| SynodError::Internal("chain tree empty after genesis".to_string()))?;
        let tip_block = decode_block(&value)?;
        let height = u64::from_be_bytes(
            index
                .as_ref()
                .try_into()
                .map_err(|_| SynodError::Internal("malformed chain key".to_string()))?,
        );
        info!(height, "Opened block chain");
        Ok(Self {
            blocks,
            difficulty,
            tip: RwLock::new((height, tip_block.hash)),
        })
    }

    /// Current chain height (genesis = 0)
    pub fn height(&self) -> u64 {
        self.tip.read().expect("tip lock poisoned").0
    }

    /// Hash of the chain tip
    pub fn tip_hash(&self) -> String {
        self.tip.read().expect("tip lock poisoned").1.clone()
    }

    /// Fetch a block by index
    pub fn get(&self, index: u64) -> Result<Option<Block>, SynodError> {
        match self.blocks.get(index.to_be_bytes())? {
            Some(value) => Ok(Some(decode_block(&value)?)),
            None => Ok(None),
        }
    }

    /// Assemble, mine and sign a block extending the current tip
    pub fn build_block(
        &self,
        transactions: Vec<Proposal>,
        consensus: ConsensusRecord,
        identity: &AgentIdentity,
    ) -> Block {
        let (height, previous_hash) = {
            let tip = self.tip.read().expect("tip lock poisoned");
            tip.clone()
        };
        let merkle = merkle_root(
            &transactions
                .iter()
                .map(|t| t.signable_bytes())
                .collect::<Vec<_>>(),
        );
        let mut block = Block {
            index: height + 1,
            timestamp: chrono::Utc::now().timestamp_millis(),
            transactions,
            consensus: Some(consensus),
            previous_hash,
            merkle_root: merkle,
            validator: identity.agent_id().to_string(),
            validator_public_key: identity.public_key_hex(),
            nonce: 0,
            hash: String::new(),
            signature: String::new(),
        };
        self.solve_proof(&mut block);
        block.hash = block.compute_hash();
        block.signature = identity.sign(block.hash.as_bytes());
        block
    }

    /// Validate a block against the current tip and append it.
    ///
    /// A block failing any check is rejected and never appended; the node
    /// keeps operating on its last valid tip.
    pub fn append(&self, block: Block) -> Result<u64, SynodError> {
        let mut tip = self.tip.write().expect("tip lock poisoned");
        self.validate_against(&block, tip.0, &tip.1)?;
        self.blocks
            .insert(block.index.to_be_bytes(), encode_block(&block)?)?;
        *tip = (block.index, block.hash.clone());
        info!(index = block.index, hash = %block.hash, "Appended block");
        Ok(block.index)
    }

    /// Full validation: linkage, recomputed hash, proof-of-task target,
    /// both merkle roots, and every signature.
    fn validate_against(
        &self,
        block: &Block,
        tip_height: u64,
        tip_hash: &str,
    ) -> Result<(), SynodError> {
        if block.index != tip_height + 1 {
            return Err(SynodError::BlockValidation(format!(
                "index {} does not extend height {}",
                block.index, tip_height
            )));
        }
        if block.previous_hash != tip_hash {
            return Err(SynodError::BlockValidation(
                "previous hash does not match chain tip".to_string(),
            ));
        }
        let recomputed = block.compute_hash();
        if recomputed != block.hash {
            return Err(SynodError::BlockValidation(
                "block hash does not recompute".to_string(),
            ));
        }
        if !block.hash.starts_with(&"0".repeat(self.difficulty)) {
            return Err(SynodError::BlockValidation(
                "proof-of-task target not met".to_string(),
            ));
        }

        let tx_root = merkle_root(
            &block
                .transactions
                .iter()
                .map(|t| t.signable_bytes())
                .collect::<Vec<_>>(),
        );
        if tx_root != block.merkle_root {
            return Err(SynodError::MerkleMismatch {
                expected: block.merkle_root.clone(),
                actual: tx_root,
            });
        }

        let consensus = block.consensus.as_ref().ok_or_else(|| {
            SynodError::BlockValidation("non-genesis block without consensus record".to_string())
        })?;
        let vote_root = merkle_root(
            &consensus
                .votes
                .iter()
                .map(|v| v.leaf_bytes())
                .collect::<Vec<_>>(),
        );
        if vote_root != consensus.merkle_root {
            return Err(SynodError::MerkleMismatch {
                expected: consensus.merkle_root.clone(),
                actual: vote_root,
            });
        }

        for vote in &consensus.votes {
            if !vote.verify_signature() {
                warn!(voter = %vote.voter, "Vote signature invalid in block");
                return Err(SynodError::SignatureInvalid {
                    signer: vote.voter.clone(),
                });
            }
        }
        for proposal in &block.transactions {
            if !proposal.verify_signature() {
                return Err(SynodError::SignatureInvalid {
                    signer: proposal.proposer.clone(),
                });
            }
        }
        if !verify(
            block.hash.as_bytes(),
            &block.signature,
            &block.validator_public_key,
        ) {
            return Err(SynodError::SignatureInvalid {
                signer: block.validator.clone(),
            });
        }
        Ok(())
    }

    /// Audit the full chain from genesis: linkage and hash recomputation.
    /// Used by restarted nodes to trust their local copy.
    pub fn verify_chain(&self) -> Result<u64, SynodError> {
        let mut previous: Option<Block> = None;
        let mut height = 0;
        for item in self.blocks.iter() {
            let (_, value) = item?;
            let block = decode_block(&value)?;
            if let Some(prev) = &previous {
                if block.previous_hash != prev.hash || block.index != prev.index + 1 {
                    return Err(SynodError::BlockValidation(format!(
                        "broken linkage at index {}",
                        block.index
                    )));
                }
            }
            if block.compute_hash() != block.hash {
                return Err(SynodError::BlockValidation(format!(
                    "hash mismatch at index {}",
                    block.index
                )));
            }
            height = block.index;
            previous = Some(block);
        }
        debug!(height, "Chain audit passed");
        Ok(height)
    }

    /// Brute-force the nonce until the block hash meets the difficulty
    /// target, leaving the solution on the block
    fn solve_proof(&self, block: &mut Block) {
        let target = "0".repeat(self.difficulty);
        let mut nonce = 0u64;
        loop {
            block.nonce = nonce;
            if block.compute_hash().starts_with(&target) {
                return;
            }
            nonce += 1;
        }
    }
}

fn encode_block(block: &Block) -> Result<Vec<u8>, SynodError> {
    rmp_serde::to_vec(block).map_err(|e| SynodError::Encoding(e.to_string()))
}

fn decode_block(value: &[u8]) -> Result<Block, SynodError> {
    rmp_serde::from_slice(value).map_err(|e| SynodError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::session::{Decision, Vote, VoteChoice};
    use tempfile::TempDir;

    fn record_with_votes(
        proposal_id: &str,
        votes: Vec<Vote>,
        validator: &AgentIdentity,
    ) -> ConsensusRecord {
        let root = merkle_root(&votes.iter().map(|v| v.leaf_bytes()).collect::<Vec<_>>());
        let mut record = ConsensusRecord {
            proposal_id: proposal_id.to_string(),
            decision: Decision::Approved,
            confidence: 1.0,
            votes,
            merkle_root: root.clone(),
            validator: validator.agent_id().to_string(),
            validator_public_key: validator.public_key_hex(),
            signature: String::new(),
        };
        record.signature = validator.sign(root.as_bytes());
        record
    }

    fn signed_vote(identity: &AgentIdentity, proposal_id: &str) -> Vote {
        let mut vote = Vote {
            id: uuid::Uuid::new_v4().to_string(),
            proposal_id: proposal_id.to_string(),
            voter: identity.agent_id().to_string(),
            voter_public_key: identity.public_key_hex(),
            choice: VoteChoice::Approve,
            confidence: 0.9,
            reasoning: "sound".to_string(),
            signature: String::new(),
        };
        vote.signature = identity.sign(&vote.signable_bytes());
        vote
    }

    fn signed_proposal(identity: &AgentIdentity) -> Proposal {
        let mut proposal = Proposal {
            id: uuid::Uuid::new_v4().to_string(),
            knowledge_node_id: "n1".to_string(),
            changes: serde_json::Map::new(),
            proposer: identity.agent_id().to_string(),
            proposer_public_key: identity.public_key_hex(),
            signature: String::new(),
            timestamp: 1,
            nonce: "nonce".to_string(),
        };
        proposal.signature = identity.sign(&proposal.signable_bytes());
        proposal
    }

    fn chain(dir: &TempDir) -> BlockChain {
        let db = sled::open(dir.path().join("chain")).unwrap();
        BlockChain::open(&db, 1).unwrap()
    }

    #[test]
    fn genesis_is_fixed() {
        assert_eq!(Block::genesis(), Block::genesis());
        assert_eq!(Block::genesis().index, 0);
    }

    #[test]
    fn append_links_blocks() {
        let dir = TempDir::new().unwrap();
        let chain = chain(&dir);
        let validator = AgentIdentity::generate("validator");

        for _ in 0..3 {
            let proposal = signed_proposal(&validator);
            let votes = vec![signed_vote(&validator, &proposal.id)];
            let record = record_with_votes(&proposal.id, votes, &validator);
            let block = chain.build_block(vec![proposal], record, &validator);
            chain.append(block).unwrap();
        }
        assert_eq!(chain.height(), 3);

        // Every block links to its predecessor and recomputes its own hash
        for i in 1..=3u64 {
            let block = chain.get(i).unwrap().unwrap();
            let prev = chain.get(i - 1).unwrap().unwrap();
            assert_eq!(block.previous_hash, prev.hash);
            assert_eq!(block.compute_hash(), block.hash);
        }
        assert_eq!(chain.verify_chain().unwrap(), 3);
    }

    #[test]
    fn tampered_vote_breaks_validation() {
        let dir = TempDir::new().unwrap();
        let chain = chain(&dir);
        let validator = AgentIdentity::generate("validator");

        let proposal = signed_proposal(&validator);
        let votes = vec![signed_vote(&validator, &proposal.id)];
        let record = record_with_votes(&proposal.id, votes, &validator);
        let mut block = chain.build_block(vec![proposal], record, &validator);

        // Tamper with a vote after the record was sealed
        block.consensus.as_mut().unwrap().votes[0].confidence = 0.1;

        match chain.append(block) {
            Err(SynodError::MerkleMismatch { .. }) => {}
            other => panic!("expected MerkleMismatch, got {other:?}"),
        }
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn wrong_linkage_is_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = chain(&dir);
        let validator = AgentIdentity::generate("validator");

        let proposal = signed_proposal(&validator);
        let record = record_with_votes(&proposal.id, vec![], &validator);
        let mut block = chain.build_block(vec![proposal], record, &validator);
        block.previous_hash = "ff".repeat(32);

        assert!(matches!(
            chain.append(block),
            Err(SynodError::BlockValidation(_))
        ));
    }

    #[test]
    fn unsigned_block_is_rejected() {
        let dir = TempDir::new().unwrap();
        let chain = chain(&dir);
        let validator = AgentIdentity::generate("validator");
        let intruder = AgentIdentity::generate("intruder");

        let proposal = signed_proposal(&validator);
        let record = record_with_votes(&proposal.id, vec![], &validator);
        let mut block = chain.build_block(vec![proposal], record, &validator);
        block.signature = intruder.sign(block.hash.as_bytes());

        assert!(matches!(
            chain.append(block),
            Err(SynodError::SignatureInvalid { .. })
        ));
    }

    #[test]
    fn merkle_root_detects_single_item_tampering() {
        let leaves: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let root = merkle_root(&leaves);
        let mut tampered = leaves.clone();
        tampered[1] = b"B".to_vec();
        assert_ne!(root, merkle_root(&tampered));
    }

    #[test]
    fn chain_reopens_at_height() {
        let dir = TempDir::new().unwrap();
        let validator = AgentIdentity::generate("validator");
        let db = sled::open(dir.path().join("chain")).unwrap();
        {
            let chain = BlockChain::open(&db, 1).unwrap();
            let proposal = signed_proposal(&validator);
            let record = record_with_votes(&proposal.id, vec![], &validator);
            let block = chain.build_block(vec![proposal], record, &validator);
            chain.append(block).unwrap();
        }
        let reopened = BlockChain::open(&db, 1).unwrap();
        assert_eq!(reopened.height(), 1);
        assert_eq!(reopened.verify_chain().unwrap(), 1);
    }
}
