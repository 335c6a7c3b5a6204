//! Tether Crypto Engine
//!
//! Provides the trust-and-session layer between the main core and each helper:
//! - Authenticated encryption (XChaCha20-Poly1305)
//! - Core identity and fingerprints (Ed25519 + SHA-256)
//! - Nonce replay protection
//! - Trust-on-first-contact store with epoch-versioned session keys
//! - Bootstrap key wrapping
//! - Handshake and key rotation state machines

pub mod aead;
pub mod bootstrap;
pub mod handshake;
pub mod identity;
pub mod replay;
pub mod trust;

pub use aead::*;
pub use bootstrap::*;
pub use handshake::*;
pub use identity::*;
pub use replay::*;
pub use trust::*;
