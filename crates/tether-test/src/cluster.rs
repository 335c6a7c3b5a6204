//! In-process cluster harness
//!
//! A main-core [`Runtime`] wired to N [`Worker`]s over the loopback
//! transport, optionally behind a [`ChaosTransport`]. Workers sit behind a
//! swappable slot so a test can "restart" a helper with a fresh identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use tether_core::{
    BootstrapPolicy, CoreId, DispatchConfig, HealthConfig, ImplementationType, RuntimeConfig,
    TetherResult, TrustConfig,
};
use tether_runtime::{HealthMonitor, OperationTable, ProbeReport, Runtime, Worker};
use tether_transport::{FrameHandler, LoopbackTransport, Transport};

use crate::{ChaosConfig, ChaosTransport};

/// Cluster configuration
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub cores: u32,
    /// Policy of the main core
    pub bootstrap: BootstrapPolicy,
    /// Policy of the helpers; `None` means same as the main core
    pub worker_bootstrap: Option<BootstrapPolicy>,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub trust: TrustConfig,
    pub chaos: Option<ChaosConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            cores: 2,
            bootstrap: BootstrapPolicy::Cleartext,
            worker_bootstrap: None,
            dispatch: DispatchConfig {
                request_timeout: Duration::from_secs(2),
                handshake_timeout: Duration::from_secs(1),
                max_retries: 3,
                retry_backoff: Duration::from_millis(2),
                retention: Duration::from_secs(60),
            },
            // Probing is driven by tests through `probe_once`
            health: HealthConfig {
                interval: Duration::from_secs(3600),
                probe_timeout: Duration::from_millis(100),
                failure_threshold: 3,
                overload_ceiling: 8,
            },
            trust: TrustConfig::default(),
            chaos: None,
        }
    }
}

impl ClusterConfig {
    /// Default configuration with `n` cores
    pub fn with_cores(n: u32) -> Self {
        ClusterConfig {
            cores: n,
            ..Default::default()
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::new(ImplementationType::Process);
        config.number_of_cores = self.cores;
        config.bootstrap = self.bootstrap.clone();
        config.trust = self.trust;
        config.health = self.health;
        config.dispatch = self.dispatch;
        config
    }
}

/// Helper slot whose worker can be replaced in place
struct WorkerSlot {
    worker: RwLock<Arc<Worker>>,
}

#[async_trait]
impl FrameHandler for WorkerSlot {
    async fn handle_frame(&self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let worker = self.worker.read().clone();
        worker.handle_frame(frame).await
    }
}

/// Main core plus in-process helpers
pub struct Cluster {
    runtime: Runtime,
    slots: Vec<Arc<WorkerSlot>>,
    loopback: Arc<LoopbackTransport>,
    chaos: Option<Arc<ChaosTransport>>,
    config: ClusterConfig,
}

impl Cluster {
    /// Build without starting the runtime
    pub fn new(config: ClusterConfig) -> TetherResult<Self> {
        let slots: Vec<Arc<WorkerSlot>> = (1..=config.cores)
            .map(|n| {
                Arc::new(WorkerSlot {
                    worker: RwLock::new(Arc::new(new_worker(&config, CoreId::new(n)))),
                })
            })
            .collect();

        let loopback = Arc::new(slots.iter().enumerate().fold(
            LoopbackTransport::new(),
            |transport, (i, slot)| {
                transport.with_core(CoreId::new(i as u32 + 1), slot.clone() as Arc<dyn FrameHandler>)
            },
        ));

        let chaos = config
            .chaos
            .clone()
            .map(|chaos| Arc::new(ChaosTransport::new(loopback.clone(), chaos)));
        let transport: Arc<dyn Transport> = match &chaos {
            Some(chaos) => chaos.clone() as Arc<dyn Transport>,
            None => loopback.clone() as Arc<dyn Transport>,
        };

        let runtime = Runtime::with_transport(config.runtime_config(), transport)?;
        Ok(Cluster {
            runtime,
            slots,
            loopback,
            chaos,
            config,
        })
    }

    /// Build and start; returns once every reachable core is handshaken
    pub async fn start(config: ClusterConfig) -> TetherResult<Self> {
        let cluster = Self::new(config)?;
        cluster.runtime.start().await?;
        Ok(cluster)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn core_ids(&self) -> Vec<CoreId> {
        (1..=self.config.cores).map(CoreId::new).collect()
    }

    /// Current worker serving `core` (1-based)
    pub fn worker(&self, core: CoreId) -> Arc<Worker> {
        self.slots[core.number() as usize - 1].worker.read().clone()
    }

    /// Replace a helper with a fresh one, as after a restart
    pub fn restart_worker(&self, core: CoreId) -> Arc<Worker> {
        let worker = Arc::new(new_worker(&self.config, core));
        *self.slots[core.number() as usize - 1].worker.write() = Arc::clone(&worker);
        worker
    }

    /// Simulate a helper going away or coming back
    pub fn set_alive(&self, core: CoreId, alive: bool) {
        self.loopback.set_alive(core, alive);
    }

    /// One health probe round over every core
    pub async fn probe(&self) -> Vec<ProbeReport> {
        HealthMonitor::new(Arc::clone(self.runtime.dispatcher()), self.config.health)
            .probe_once()
            .await
    }

    pub fn chaos(&self) -> Option<&Arc<ChaosTransport>> {
        self.chaos.as_ref()
    }

    pub async fn shutdown(&self) {
        self.runtime.shutdown().await;
    }
}

fn new_worker(config: &ClusterConfig, core: CoreId) -> Worker {
    let bootstrap = config
        .worker_bootstrap
        .clone()
        .unwrap_or_else(|| config.bootstrap.clone());
    Worker::with_trust_config(core, bootstrap, OperationTable::builtin(), config.trust)
}
