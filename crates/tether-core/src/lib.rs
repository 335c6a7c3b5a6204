//! Tether Core - Fundamental types shared by every layer
//!
//! This crate defines:
//! - Identifiers (CoreId, RequestId, Fingerprint, Nonce)
//! - Core and request status lifecycles
//! - Runtime configuration and the option surface
//! - The error taxonomy

pub mod config;
pub mod error;
pub mod id;
pub mod status;

pub use config::*;
pub use error::*;
pub use id::*;
pub use status::*;
