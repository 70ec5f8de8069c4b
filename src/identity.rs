//! Agent identity and signing
//!
//! All signing and verification in synod goes through this module so the
//! algorithm can change without touching consensus or storage logic.
//! Identities are ed25519 keypairs; signatures and public keys travel on
//! the wire as hex strings.

use crate::error::SynodError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;
use tracing::info;

/// Length of a serialized signing key
const KEY_LEN: usize = 32;

/// An agent identity holding the local signing key
#[derive(Clone)]
pub struct AgentIdentity {
    /// Stable external agent id
    agent_id: String,
    signing_key: SigningKey,
    /// Whether this agent participates as a block validator
    is_validator: bool,
}

impl AgentIdentity {
    /// Create a new identity with a fresh keypair
    pub fn generate(agent_id: impl Into<String>) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            agent_id: agent_id.into(),
            signing_key,
            is_validator: true,
        }
    }

    /// Load an identity keypair from disk, generating one if absent
    pub fn load_or_generate<P: AsRef<Path>>(
        agent_id: impl Into<String>,
        path: P,
    ) -> Result<Self, SynodError> {
        let path = path.as_ref();
        let agent_id = agent_id.into();

        if path.exists() {
            let raw = std::fs::read(path)?;
            if raw.len() != KEY_LEN {
                return Err(SynodError::Config(format!(
                    "identity key at {} has invalid length {}",
                    path.display(),
                    raw.len()
                )));
            }
            let mut bytes = [0u8; KEY_LEN];
            bytes.copy_from_slice(&raw);
            let signing_key = SigningKey::from_bytes(&bytes);
            info!(path = %path.display(), agent = %agent_id, "Loaded identity key");
            return Ok(Self {
                agent_id,
                signing_key,
                is_validator: true,
            });
        }

        let identity = Self::generate(agent_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, identity.signing_key.to_bytes())?;
        info!(path = %path.display(), agent = %identity.agent_id, "Generated identity key");
        Ok(identity)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn is_validator(&self) -> bool {
        self.is_validator
    }

    /// Public key as a hex string, suitable for the wire
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign arbitrary bytes, returning a hex signature
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }
}

/// Verify a hex signature over `data` against a hex public key.
///
/// Any malformed key or signature counts as invalid rather than an error:
/// callers uniformly reject the input either way.
pub fn verify(data: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
    fn inner(data: &[u8], signature_hex: &str, public_key_hex: &str) -> Option<()> {
        let key_bytes: [u8; 32] = hex::decode(public_key_hex).ok()?.try_into().ok()?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes).ok()?;
        let sig_bytes: [u8; 64] = hex::decode(signature_hex).ok()?.try_into().ok()?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key.verify(data, &signature).ok()
    }
    inner(data, signature_hex, public_key_hex).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sign_and_verify() {
        let identity = AgentIdentity::generate("agent-1");
        let sig = identity.sign(b"payload");
        assert!(verify(b"payload", &sig, &identity.public_key_hex()));
        assert!(!verify(b"tampered", &sig, &identity.public_key_hex()));
    }

    #[test]
    fn verify_rejects_garbage() {
        let identity = AgentIdentity::generate("agent-1");
        assert!(!verify(b"payload", "zz", &identity.public_key_hex()));
        assert!(!verify(b"payload", &identity.sign(b"payload"), "not-hex"));
    }

    #[test]
    fn key_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");

        let first = AgentIdentity::load_or_generate("agent-1", &path).unwrap();
        let second = AgentIdentity::load_or_generate("agent-1", &path).unwrap();
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }
}
