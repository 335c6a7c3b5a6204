//! Tether Runtime - Main-core dispatch and helper-side execution
//!
//! Main core:
//! 1. Configure registry, trust store and transport
//! 2. Handshake every helper (trust on first contact)
//! 3. Dispatch encrypted requests to the least loaded trusted core
//! 4. Correlate responses, time out the rest
//! 5. Probe helpers and track unresponsive or overloaded cores
//!
//! Helper core: [`Worker`] answers handshakes and runs named operations.

pub mod dispatcher;
pub mod health;
pub mod logging;
pub mod operations;
pub mod registry;
pub mod runtime;
pub mod worker;

pub use dispatcher::*;
pub use health::*;
pub use operations::*;
pub use registry::*;
pub use runtime::*;
pub use worker::*;
