//! Signature capability.
//!
//! Consensus never touches key material directly. It is handed a [`Crypto`]
//! implementation that signs for the local node and verifies for any
//! committee member.

use crate::{Hash, NodeId};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Domain tag mixed into deterministic key derivation.
const KEY_DERIVATION_DOMAIN: &[u8] = b"blockmania:key:";

/// An opaque detached signature.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// A signature that verifies for nothing.
    pub fn empty() -> Self {
        Signature(Vec::new())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = self.0.len().min(4);
        write!(f, "Signature({}…)", hex::encode(&self.0[..prefix]))
    }
}

/// Injected signing and verification.
pub trait Crypto: Send + Sync {
    /// Node whose key produces [`Crypto::sign`] output.
    fn signer(&self) -> NodeId;

    fn sign(&self, payload: &[u8]) -> Signature;

    /// Check `signature` over `payload` against `sender`'s key. Unknown
    /// senders never verify.
    fn verify(&self, sender: NodeId, payload: &[u8], signature: &Signature) -> bool;
}

/// Ed25519 keys for the local node plus the committee's public keys.
pub struct Ed25519Keyring {
    local: NodeId,
    signing_key: SigningKey,
    directory: HashMap<NodeId, VerifyingKey>,
}

impl Ed25519Keyring {
    pub fn new(
        local: NodeId,
        signing_key: SigningKey,
        directory: HashMap<NodeId, VerifyingKey>,
    ) -> Self {
        Self {
            local,
            signing_key,
            directory,
        }
    }

    /// Derive every member's key from a shared seed.
    ///
    /// Only suitable for simulations and local devnets: anyone with the seed
    /// can sign for any member.
    pub fn deterministic(local: NodeId, members: &[NodeId], seed: u64) -> Self {
        let directory = members
            .iter()
            .map(|id| (*id, derive_signing_key(*id, seed).verifying_key()))
            .collect();
        Self::new(local, derive_signing_key(local, seed), directory)
    }

    pub fn into_arc(self) -> Arc<dyn Crypto> {
        Arc::new(self)
    }

    pub fn verifying_key(&self, node: NodeId) -> Option<&VerifyingKey> {
        self.directory.get(&node)
    }
}

impl fmt::Debug for Ed25519Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Keyring")
            .field("local", &self.local)
            .field("directory_size", &self.directory.len())
            .finish()
    }
}

impl Crypto for Ed25519Keyring {
    fn signer(&self) -> NodeId {
        self.local
    }

    fn sign(&self, payload: &[u8]) -> Signature {
        Signature(self.signing_key.sign(payload).to_bytes().to_vec())
    }

    fn verify(&self, sender: NodeId, payload: &[u8], signature: &Signature) -> bool {
        let Some(key) = self.directory.get(&sender) else {
            return false;
        };
        let Ok(sig) = ed25519_dalek::Signature::from_slice(signature.as_bytes()) else {
            return false;
        };
        key.verify(payload, &sig).is_ok()
    }
}

fn derive_signing_key(node: NodeId, seed: u64) -> SigningKey {
    let secret = Hash::from_parts(&[
        KEY_DERIVATION_DOMAIN,
        &seed.to_le_bytes(),
        &node.0.to_le_bytes(),
    ]);
    SigningKey::from_bytes(secret.as_bytes())
}
