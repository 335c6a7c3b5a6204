//! Runtime context of the main core
//!
//! Owns the transport, registry, trust store and dispatcher for one
//! configuration. Built by `configure`, torn down by `shutdown`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::{
    CoreId, Fingerprint, ImplementationType, RequestId, RuntimeConfig, TetherError, TetherResult,
};
use tether_crypto::{Identity, TrustStore};
use tether_transport::{HttpTransport, ProcessTransport, Transport};

use crate::{CoreRegistry, CoreState, Dispatcher, HealthMonitor, Response, Target};

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Main-core runtime
pub struct Runtime {
    config: RuntimeConfig,
    identity: Arc<Identity>,
    registry: Arc<CoreRegistry>,
    trust: Arc<TrustStore>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Runtime {
    /// Validate the configuration and bring up its transport
    ///
    /// Process helpers are spawned here, so this must run inside a tokio
    /// runtime.
    pub fn configure(config: RuntimeConfig) -> TetherResult<Self> {
        config.validate()?;
        let cores = config.cores();
        let transport: Arc<dyn Transport> = match config.implementation {
            ImplementationType::Process => Arc::new(ProcessTransport::spawn(&cores)?),
            ImplementationType::Httpd => Arc::new(HttpTransport::new(&cores)?),
        };
        Self::with_transport(config, transport)
    }

    /// Use an existing transport; it must serve exactly the configured cores
    pub fn with_transport(config: RuntimeConfig, transport: Arc<dyn Transport>) -> TetherResult<Self> {
        let registry = Arc::new(CoreRegistry::configure(&config)?);
        let served = transport.cores();
        if served != registry.ids() {
            return Err(TetherError::Config(format!(
                "{} transport serves {:?}, configuration expects {:?}",
                transport.kind(),
                served,
                registry.ids()
            )));
        }

        let identity = Arc::new(Identity::generate(CoreId::MAIN));
        let trust = Arc::new(TrustStore::new(config.trust));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&identity),
            config.bootstrap.clone(),
            config.dispatch,
            transport,
            Arc::clone(&registry),
            Arc::clone(&trust),
        ));
        let (shutdown, _) = watch::channel(false);

        info!(
            implementation = %config.implementation,
            cores = registry.len(),
            fingerprint = %identity.fingerprint(),
            "runtime configured"
        );

        Ok(Runtime {
            config,
            identity,
            registry,
            trust,
            dispatcher,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Start readers, handshake every core, then start background tasks
    ///
    /// A core whose handshake fails stays `Initialized`; the next request
    /// routed to it, or the next health check that finds it alive, retries.
    /// Returns the number of trusted cores.
    pub async fn start(&self) -> TetherResult<usize> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TetherError::Config("runtime already started".into()));
        }

        let mut tasks = self.dispatcher.start_readers();

        for core in self.registry.ids() {
            if let Err(e) = self.dispatcher.establish_trust(core).await {
                warn!(core = %core, error = %e, "core left untrusted at startup");
            }
        }

        let monitor = HealthMonitor::new(Arc::clone(&self.dispatcher), self.config.health);
        tasks.push(tokio::spawn(monitor.run(self.shutdown.subscribe())));

        let interval = (self.config.dispatch.retention / 2).max(MIN_REAP_INTERVAL);
        tasks.push(tokio::spawn(reap_loop(
            Arc::clone(&self.dispatcher),
            interval,
            self.shutdown.subscribe(),
        )));
        self.tasks.lock().extend(tasks);

        let trusted = self
            .registry
            .ids()
            .into_iter()
            .filter(|core| self.dispatcher.verify_trust(*core))
            .count();
        info!(trusted, cores = self.registry.len(), "runtime started");
        Ok(trusted)
    }

    pub async fn send(&self, target: Target, operation: &str, payload: Vec<u8>) -> TetherResult<RequestId> {
        self.dispatcher.send(target, operation, payload).await
    }

    pub async fn receive(&self, request: RequestId, timeout: Duration) -> TetherResult<Response> {
        self.dispatcher.receive(request, timeout).await
    }

    /// Send and wait up to the configured request timeout
    pub async fn call(&self, target: Target, operation: &str, payload: Vec<u8>) -> TetherResult<Response> {
        self.dispatcher
            .call(target, operation, payload, self.config.dispatch.request_timeout)
            .await
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<CoreRegistry> {
        &self.registry
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// State of every core, ascending by id
    pub fn cores(&self) -> Vec<CoreState> {
        self.registry.snapshot()
    }

    /// Stop background work, close every core and release the transport
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }

        self.dispatcher.shutdown();
        self.registry.close_all();
        self.trust.clear();
        self.dispatcher.transport().shutdown().await;
        info!("runtime shut down");
    }
}

async fn reap_loop(dispatcher: Arc<Dispatcher>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = dispatcher.reap(std::time::Instant::now());
                if removed > 0 {
                    debug!(removed, "reaped request records");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("implementation", &self.config.implementation)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
