//! Tether Transport Layer
//!
//! This crate provides:
//! - The uniform `Transport` contract the dispatcher talks to
//! - Child process transport (length-prefixed frames over stdin/stdout)
//! - HTTP transport (reqwest client, axum helper server)
//! - In-process loopback transport
//! - Helper-side serving loops driven by a `FrameHandler`

pub mod http;
pub mod loopback;
pub mod process;
pub mod stream;
pub mod transport;

pub use http::*;
pub use loopback::*;
pub use process::*;
pub use stream::*;
pub use transport::*;
