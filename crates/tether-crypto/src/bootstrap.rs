//! Bootstrap key wrapping for the first session key
//!
//! With `Cleartext` the first session key crosses the channel as-is and is
//! only as safe as that channel. With `PreSharedSecret` it is encrypted
//! under a key derived from the secret and both handshake nonces.

use hkdf::Hkdf;
use sha2::Sha256;
use tracing::warn;

use tether_core::{BootstrapPolicy, CoreId, Nonce, TetherError, TetherResult};

use crate::{CryptoProvider, Key, KEY_SIZE};

const BOOTSTRAP_INFO: &[u8] = b"tether-bootstrap-v1";

/// Derive the wrapping key for one handshake attempt
fn derive_wrap_key(secret: &[u8], initiator: &Nonce, responder: &Nonce) -> TetherResult<Key> {
    let mut salt = [0u8; 32];
    salt[..16].copy_from_slice(initiator.as_bytes());
    salt[16..].copy_from_slice(responder.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), secret);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(BOOTSTRAP_INFO, &mut key)
        .map_err(|_| TetherError::Wire("bootstrap key derivation failed".into()))?;
    Ok(Key::from_bytes(key))
}

/// Prepare a first session key for transmission
pub fn wrap_session_key(
    policy: &BootstrapPolicy,
    peer: CoreId,
    initiator: &Nonce,
    responder: &Nonce,
    key: &Key,
) -> TetherResult<Vec<u8>> {
    match policy {
        BootstrapPolicy::Cleartext => {
            warn!(core = %peer, "first session key sent in the clear (trust on first contact)");
            Ok(key.as_bytes().to_vec())
        }
        BootstrapPolicy::PreSharedSecret(secret) => {
            let wrap = derive_wrap_key(secret, initiator, responder)?;
            CryptoProvider::encrypt(key.as_bytes(), &wrap)
        }
    }
}

/// Recover a first session key received from the initiator
pub fn unwrap_session_key(
    policy: &BootstrapPolicy,
    peer: CoreId,
    initiator: &Nonce,
    responder: &Nonce,
    wrapped: &[u8],
) -> TetherResult<Key> {
    match policy {
        BootstrapPolicy::Cleartext => {
            let key = Key::from_slice(wrapped).ok_or_else(|| {
                TetherError::handshake(peer, "expected a cleartext session key")
            })?;
            warn!(core = %peer, "first session key received in the clear (trust on first contact)");
            Ok(key)
        }
        BootstrapPolicy::PreSharedSecret(secret) => {
            let wrap = derive_wrap_key(secret, initiator, responder)?;
            let bytes = CryptoProvider::decrypt(wrapped, &wrap).map_err(|e| e.with_core(peer))?;
            Key::from_slice(&bytes)
                .ok_or_else(|| TetherError::handshake(peer, "wrapped session key has wrong size"))
        }
    }
}
