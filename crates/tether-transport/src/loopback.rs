//! In-process loopback transport
//!
//! Each core is a `FrameHandler` living in the same process. Used by the
//! test harness and for embedding helpers without a process boundary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use tether_core::{CoreId, TetherError, TetherResult};

use crate::{FrameHandler, Transport};

struct LoopbackCore {
    handler: Arc<dyn FrameHandler>,
    alive: AtomicBool,
    replies: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// Transport to in-process helpers
#[derive(Default)]
pub struct LoopbackTransport {
    cores: BTreeMap<CoreId, LoopbackCore>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a helper as `core`
    pub fn with_core(mut self, core: CoreId, handler: Arc<dyn FrameHandler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cores.insert(
            core,
            LoopbackCore {
                handler,
                alive: AtomicBool::new(true),
                replies: Mutex::new(Some(tx)),
                inbound: AsyncMutex::new(rx),
            },
        );
        self
    }

    /// Simulate a helper going away or coming back
    ///
    /// A dead helper refuses frames and its replies are lost.
    pub fn set_alive(&self, core: CoreId, alive: bool) {
        if let Some(entry) = self.cores.get(&core) {
            entry.alive.store(alive, Ordering::Release);
            debug!(core = %core, alive, "loopback liveness changed");
        }
    }

    fn core(&self, core: CoreId) -> TetherResult<&LoopbackCore> {
        self.cores.get(&core).ok_or(TetherError::UnknownCore(core))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> &'static str {
        "loopback"
    }

    fn cores(&self) -> Vec<CoreId> {
        self.cores.keys().copied().collect()
    }

    async fn send(&self, core: CoreId, frame: Vec<u8>) -> TetherResult<()> {
        let entry = self.core(core)?;
        if !entry.alive.load(Ordering::Acquire) {
            return Err(TetherError::transport(core, "helper unreachable", true));
        }
        let Some(replies) = entry.replies.lock().clone() else {
            return Err(TetherError::transport(core, "transport shut down", false));
        };

        let handler = Arc::clone(&entry.handler);
        tokio::spawn(async move {
            if let Some(reply) = handler.handle_frame(frame).await {
                // Receiver gone means the transport shut down
                let _ = replies.send(reply);
            }
        });
        Ok(())
    }

    async fn receive(&self, core: CoreId) -> TetherResult<Vec<u8>> {
        let entry = self.core(core)?;
        loop {
            let frame = entry.inbound.lock().await.recv().await;
            let Some(frame) = frame else {
                return Err(TetherError::HelperCrash { core });
            };
            if entry.alive.load(Ordering::Acquire) {
                return Ok(frame);
            }
            debug!(core = %core, "dropping reply from dead helper");
        }
    }

    async fn is_alive(&self, core: CoreId) -> bool {
        self.cores
            .get(&core)
            .is_some_and(|entry| entry.alive.load(Ordering::Acquire))
    }

    async fn shutdown(&self) {
        for entry in self.cores.values() {
            entry.replies.lock().take();
        }
    }
}
