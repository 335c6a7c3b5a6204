//! Child process transport
//!
//! One long-lived child per core. Frames go down the child's stdin and come
//! back on its stdout; the child's stderr is inherited so helper logs land in
//! the parent's log stream.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use tether_core::{CoreConfig, CoreId, TetherError, TetherResult, TransportAddress};

use crate::{serve_stream, write_frame, FrameHandler, FrameReader, Transport};

/// Frames buffered from one child before its reader blocks
const INBOUND_BUFFER: usize = 256;

struct ChildCore {
    child: Mutex<Child>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    inbound: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

/// Transport over spawned helper processes
pub struct ProcessTransport {
    children: BTreeMap<CoreId, ChildCore>,
    closed: AtomicBool,
}

impl ProcessTransport {
    /// Spawn one child per configured core
    ///
    /// Must run inside a tokio runtime.
    pub fn spawn(cores: &[CoreConfig]) -> TetherResult<Self> {
        let mut children = BTreeMap::new();
        for core in cores {
            let TransportAddress::Process { program, args, env } = &core.address else {
                return Err(TetherError::Config(format!(
                    "{} is not configured for the Process transport",
                    core.id
                )));
            };
            children.insert(core.id, spawn_child(core.id, program, args, env)?);
        }

        Ok(ProcessTransport {
            children,
            closed: AtomicBool::new(false),
        })
    }

    fn child(&self, core: CoreId) -> TetherResult<&ChildCore> {
        self.children.get(&core).ok_or(TetherError::UnknownCore(core))
    }
}

fn spawn_child(
    core: CoreId,
    program: &str,
    args: &[String],
    env: &[(String, String)],
) -> TetherResult<ChildCore> {
    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TetherError::transport(core, format!("failed to spawn '{}': {}", program, e), false))?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TetherError::transport(core, "child stdout unavailable", false))?;

    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    start_reader(core, stdout, tx);
    info!(core = %core, program, pid = ?child.id(), "helper process started");

    Ok(ChildCore {
        child: Mutex::new(child),
        stdin: AsyncMutex::new(stdin),
        inbound: AsyncMutex::new(rx),
    })
}

/// Background loop moving frames from a child's stdout into a channel
fn start_reader(core: CoreId, stdout: ChildStdout, tx: mpsc::Sender<Vec<u8>>) {
    tokio::spawn(async move {
        let mut frames = FrameReader::new(stdout);
        loop {
            match frames.next_frame().await {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break; // Transport dropped
                    }
                }
                Ok(None) => {
                    debug!(core = %core, "helper closed its output");
                    break;
                }
                Err(e) => {
                    warn!(core = %core, error = %e, "unreadable output from helper");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> &'static str {
        "process"
    }

    fn cores(&self) -> Vec<CoreId> {
        self.children.keys().copied().collect()
    }

    async fn send(&self, core: CoreId, frame: Vec<u8>) -> TetherResult<()> {
        let child = self.child(core)?;
        let mut stdin = child.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(TetherError::transport(core, "helper input closed", false));
        };

        // A broken pipe means the child is gone; resending will not help
        write_frame(pipe, &frame)
            .await
            .map_err(|e| TetherError::transport(core, format!("write to helper failed: {}", e), false))
    }

    async fn receive(&self, core: CoreId) -> TetherResult<Vec<u8>> {
        let child = self.child(core)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(TetherError::transport(core, "transport shut down", false));
        }
        let frame = child.inbound.lock().await.recv().await;
        frame.ok_or(TetherError::HelperCrash { core })
    }

    async fn is_alive(&self, core: CoreId) -> bool {
        match self.children.get(&core) {
            Some(child) => matches!(child.child.lock().try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (core, child) in &self.children {
            // Closing stdin lets a well-behaved helper exit on its own
            child.stdin.lock().await.take();
            if let Err(e) = child.child.lock().start_kill() {
                debug!(core = %core, error = %e, "helper already exited");
            }
        }
        info!(helpers = self.children.len(), "helper processes stopped");
    }
}

/// Helper side: serve frames on this process's stdin/stdout until stdin closes
pub async fn serve_stdio<H: FrameHandler + ?Sized>(handler: Arc<H>) -> TetherResult<()> {
    serve_stream(tokio::io::stdin(), tokio::io::stdout(), handler).await
}
