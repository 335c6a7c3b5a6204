//! Authenticated encryption using XChaCha20-Poly1305
//!
//! Ciphertext layout: AEAD nonce (24) + encrypted payload + auth tag (16).
//! The AEAD nonce is random per message, so callers never manage counters.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use tether_core::{Nonce, SecurityError, TetherError, TetherResult, NONCE_SIZE};

/// Symmetric key size
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const AEAD_NONCE_SIZE: usize = 24;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Smallest well-formed ciphertext
pub const MIN_CIPHERTEXT_SIZE: usize = AEAD_NONCE_SIZE + TAG_SIZE;

/// Symmetric key material
#[derive(Clone, PartialEq, Eq)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Key(..)")
    }
}

/// Key/nonce generation and symmetric encryption
#[derive(Clone, Copy, Debug, Default)]
pub struct CryptoProvider;

impl CryptoProvider {
    /// Fresh random key from the OS entropy source
    pub fn generate_key() -> TetherResult<Key> {
        let mut key = [0u8; KEY_SIZE];
        fill_random(&mut key)?;
        Ok(Key(key))
    }

    /// Fresh 128-bit nonce
    pub fn generate_nonce() -> TetherResult<Nonce> {
        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut nonce)?;
        Ok(Nonce::from_bytes(nonce))
    }

    pub fn encrypt(plaintext: &[u8], key: &Key) -> TetherResult<Vec<u8>> {
        Self::encrypt_with_aad(plaintext, &[], key)
    }

    pub fn decrypt(ciphertext: &[u8], key: &Key) -> TetherResult<Vec<u8>> {
        Self::decrypt_with_aad(ciphertext, &[], key)
    }

    /// Encrypt and bind associated data
    pub fn encrypt_with_aad(plaintext: &[u8], aad: &[u8], key: &Key) -> TetherResult<Vec<u8>> {
        let mut nonce = [0u8; AEAD_NONCE_SIZE];
        fill_random(&mut nonce)?;

        let sealed = cipher(key)
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| TetherError::Wire("plaintext too large to encrypt".into()))?;

        let mut out = Vec::with_capacity(AEAD_NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decrypt; fails on wrong key, wrong associated data or tampering
    pub fn decrypt_with_aad(ciphertext: &[u8], aad: &[u8], key: &Key) -> TetherResult<Vec<u8>> {
        if ciphertext.len() < MIN_CIPHERTEXT_SIZE {
            return Err(SecurityError::Decryption.into());
        }
        let (nonce, sealed) = ciphertext.split_at(AEAD_NONCE_SIZE);

        cipher(key)
            .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad })
            .map_err(|_| SecurityError::Decryption.into())
    }
}

fn cipher(key: &Key) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_bytes()))
}

fn fill_random(buf: &mut [u8]) -> TetherResult<()> {
    OsRng.try_fill_bytes(buf).map_err(|_| TetherError::Entropy)
}
