//! Tether Wire Protocol
//!
//! Frame = 4-byte big-endian length + payload. The payload is a JSON
//! [`Packet`]: a handshake message, an encrypted dispatch envelope, a
//! rejection, or a health probe.

pub mod frame;
pub mod packet;

pub use frame::*;
pub use packet::*;
