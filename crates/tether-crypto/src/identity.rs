//! Core identity using Ed25519

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use tether_core::{CoreId, Fingerprint};

/// Public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Signature size
pub const SIGNATURE_SIZE: usize = 64;

/// Long-term identity keypair of a core
#[derive(Clone)]
pub struct Identity {
    core_id: CoreId,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    fingerprint: Fingerprint,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate(core_id: CoreId) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let fingerprint = fingerprint_of(verifying_key.as_bytes());

        Identity {
            core_id,
            signing_key,
            verifying_key,
            fingerprint,
        }
    }

    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    /// Public key bytes
    pub fn verifying_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.verifying_key.to_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
        let sig = Signature::from_bytes(signature);
        self.verifying_key.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("core_id", &self.core_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Fingerprint of a public key (SHA-256)
pub fn fingerprint_of(public_key: &[u8; PUBLIC_KEY_SIZE]) -> Fingerprint {
    let digest = Sha256::digest(public_key);
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&digest);
    Fingerprint::from_bytes(bytes)
}

/// Peer identity as presented on the wire, verification only
#[derive(Clone)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
    fingerprint: Fingerprint,
}

impl PublicIdentity {
    /// Parse a presented public key; `None` if malformed
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().ok()?;
        let verifying_key = VerifyingKey::from_bytes(&bytes).ok()?;
        Some(PublicIdentity {
            verifying_key,
            fingerprint: fingerprint_of(&bytes),
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Verify a signature given as a raw slice
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
            return false;
        };
        let sig = Signature::from_bytes(&signature);
        self.verifying_key.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}
