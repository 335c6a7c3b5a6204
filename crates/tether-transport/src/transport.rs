//! Transport contracts

use async_trait::async_trait;

use tether_core::{CoreId, TetherResult};

/// Byte-level channel from the main core to its helpers
///
/// Frames are whole packets; each variant handles its own boundaries.
/// Errors carry a retryability flag, but retrying is the caller's decision.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Variant name, for logs
    fn kind(&self) -> &'static str;

    /// Cores reachable through this transport, in ascending order
    fn cores(&self) -> Vec<CoreId>;

    /// Deliver one frame to a core
    async fn send(&self, core: CoreId, frame: Vec<u8>) -> TetherResult<()>;

    /// Next frame from a core; waits until one arrives
    ///
    /// There is a single consumer per core.
    async fn receive(&self, core: CoreId) -> TetherResult<Vec<u8>>;

    /// Cheap liveness check, no application traffic
    async fn is_alive(&self, core: CoreId) -> bool;

    /// Release every helper connection
    async fn shutdown(&self);
}

/// Helper-side frame processing
///
/// Returns the reply frame, if the input warrants one.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle_frame(&self, frame: Vec<u8>) -> Option<Vec<u8>>;
}
