//! Error types for synod

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynodError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Merkle root mismatch: expected {expected}, got {actual}")]
    MerkleMismatch { expected: String, actual: String },

    #[error("Chunk missing: artifact {content_id}, chunk {index}")]
    ChunkMissing { content_id: String, index: u32 },

    #[error("Invalid signature from {signer}")]
    SignatureInvalid { signer: String },

    #[error("Insufficient replication: {achieved} of {required} replicas acknowledged")]
    InsufficientReplication { achieved: usize, required: usize },

    #[error("Consensus timeout: proposal {0} closed without reaching threshold")]
    ConsensusTimeout(String),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Node unhealthy: {0}")]
    NodeUnhealthy(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SynodError {
    /// Whether a caller may retry the failed operation.
    ///
    /// Signature and integrity failures are never retried: they indicate
    /// corrupted or malicious input, not a transient fault.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SynodError::Timeout(_) | SynodError::NodeUnhealthy(_) | SynodError::Io(_)
        )
    }
}
