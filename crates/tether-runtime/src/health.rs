//! Health monitor
//!
//! Probes every core on a fixed interval, independent of request traffic.
//! A probe is the transport's liveness check followed by an
//! application-level ping. Consecutive failures mark a core unresponsive;
//! one success makes it eligible again. A live core without a usable
//! session key is handshaken again before its status is settled. Load above
//! the ceiling marks a core overloaded without touching its in-flight work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tether_core::{CoreId, CoreStatus, HealthConfig};

use crate::{CoreState, Dispatcher};

/// Result of probing one core
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub core: CoreId,
    pub alive: bool,
    pub round_trip: Option<Duration>,
    pub status: CoreStatus,
}

/// Periodic liveness and overload tracking
#[derive(Debug)]
pub struct HealthMonitor {
    dispatcher: Arc<Dispatcher>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, config: HealthConfig) -> Self {
        HealthMonitor { dispatcher, config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe one core; `None` round trip means it failed
    pub async fn probe_core(&self, core: CoreId) -> Option<Duration> {
        probe(&self.dispatcher, core, self.config.probe_timeout).await
    }

    /// Probe all cores concurrently and apply the results
    pub async fn probe_once(&self) -> Vec<ProbeReport> {
        let registry = self.dispatcher.registry();
        let mut probes = JoinSet::new();
        for core in registry.ids() {
            if registry.status(core).is_ok_and(|s| s == CoreStatus::Closed) {
                continue;
            }
            let dispatcher = Arc::clone(&self.dispatcher);
            let timeout = self.config.probe_timeout;
            probes.spawn(async move {
                let round_trip = probe(&dispatcher, core, timeout).await;
                if round_trip.is_some() {
                    restore_trust(&dispatcher, core).await;
                }
                (core, round_trip)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((core, round_trip)) => {
                    if let Some(report) = self.record(core, round_trip) {
                        reports.push(report);
                    }
                }
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        reports.sort_by_key(|r| r.core);
        reports
    }

    /// Apply one probe result to the registry
    fn record(&self, core: CoreId, round_trip: Option<Duration>) -> Option<ProbeReport> {
        let alive = round_trip.is_some();
        let trusted = self.dispatcher.verify_trust(core);
        let config = self.config;

        let (previous, status) = self
            .dispatcher
            .registry()
            .update(core, |state| {
                let previous = state.status;
                apply_probe(state, alive, trusted, &config, Instant::now());
                (previous, state.status)
            })
            .ok()?;

        if previous != status {
            info!(core = %core, from = %previous, to = %status, "health status changed");
        } else if !alive {
            debug!(core = %core, %status, "probe failed");
        }

        Some(ProbeReport {
            core,
            alive,
            round_trip,
            status,
        })
    }

    /// Probe on every tick until `shutdown` flips to true or its sender drops
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // First probe one interval after start
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval = ?self.config.interval, "health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("health monitor stopped");
    }
}

async fn probe(dispatcher: &Dispatcher, core: CoreId, timeout: Duration) -> Option<Duration> {
    if !dispatcher.transport().is_alive(core).await {
        return None;
    }
    dispatcher.ping(core, timeout).await.ok()
}

/// Handshake again with a live core whose session lapsed or never formed
async fn restore_trust(dispatcher: &Dispatcher, core: CoreId) {
    if dispatcher.verify_trust(core) {
        return;
    }
    match dispatcher.ensure_trust(core).await {
        Ok(()) => info!(core = %core, "trust restored"),
        Err(e) => debug!(core = %core, error = %e, "trust not restored"),
    }
}

/// Status transition after one probe
///
/// `Closed` and `Handshaking` are left alone. Failures at or above the
/// threshold give `Unresponsive`. Otherwise the core settles on what its
/// trust and load say, or `Overloaded` above the ceiling.
pub fn apply_probe(
    state: &mut CoreState,
    alive: bool,
    trusted: bool,
    config: &HealthConfig,
    now: Instant,
) {
    state.last_health_check = Some(now);
    state.consecutive_failures = if alive {
        0
    } else {
        state.consecutive_failures.saturating_add(1)
    };

    if matches!(state.status, CoreStatus::Closed | CoreStatus::Handshaking) {
        return;
    }
    if state.consecutive_failures >= config.failure_threshold {
        state.status = CoreStatus::Unresponsive;
        return;
    }

    state.status = match (trusted, state.load) {
        (false, _) => CoreStatus::Initialized,
        (true, load) if load > config.overload_ceiling => CoreStatus::Overloaded,
        (true, 0) => CoreStatus::Trusted,
        (true, _) => CoreStatus::Busy,
    };
}
