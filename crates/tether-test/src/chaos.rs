//! Chaos transport
//!
//! Wraps any transport and injects hostile conditions on the send path:
//! - Latency with uniform jitter
//! - Transient send failures (retryable)
//!
//! Every delivered frame is also recorded per core so tests can replay it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use tether_core::{CoreId, TetherError, TetherResult};
use tether_transport::Transport;

/// Chaos configuration
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Base latency added to every send
    pub latency: Duration,
    /// Upper bound of extra uniform jitter
    pub jitter: Duration,
    /// Probability (0.0 - 1.0) that a send fails transiently
    pub failure_rate: f64,
    /// Deterministic runs
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            latency: Duration::from_millis(1),
            jitter: Duration::from_millis(4),
            failure_rate: 0.1,
            seed: 0x7e7e_7e7e,
        }
    }
}

impl ChaosConfig {
    /// No interference at all
    pub fn calm() -> Self {
        ChaosConfig {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            failure_rate: 0.0,
            ..Default::default()
        }
    }

    /// Frequent transient failures
    pub fn lossy(failure_rate: f64) -> Self {
        ChaosConfig {
            failure_rate,
            ..Default::default()
        }
    }
}

/// Counters of what the chaos layer did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChaosStats {
    pub delivered: u64,
    pub failed: u64,
}

/// Transport decorator injecting latency and transient failures
pub struct ChaosTransport {
    inner: Arc<dyn Transport>,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
    delivered: AtomicU64,
    failed: AtomicU64,
    sent: Mutex<HashMap<CoreId, Vec<Vec<u8>>>>,
}

impl ChaosTransport {
    pub fn new(inner: Arc<dyn Transport>, config: ChaosConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        ChaosTransport {
            inner,
            config,
            rng: Mutex::new(rng),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> ChaosStats {
        ChaosStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Frames delivered to `core`, oldest first
    pub fn sent_to(&self, core: CoreId) -> Vec<Vec<u8>> {
        self.sent.lock().get(&core).cloned().unwrap_or_default()
    }

    /// Roll the dice for one send: `None` means inject a failure
    fn sample(&self) -> Option<Duration> {
        let mut rng = self.rng.lock();
        if self.config.failure_rate > 0.0 && rng.gen_bool(self.config.failure_rate.min(1.0)) {
            return None;
        }
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        Some(self.config.latency + extra)
    }
}

#[async_trait]
impl Transport for ChaosTransport {
    fn kind(&self) -> &'static str {
        "chaos"
    }

    fn cores(&self) -> Vec<CoreId> {
        self.inner.cores()
    }

    async fn send(&self, core: CoreId, frame: Vec<u8>) -> TetherResult<()> {
        let Some(delay) = self.sample() else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            debug!(core = %core, "chaos: send dropped");
            return Err(TetherError::transport(core, "injected transient failure", true));
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.sent.lock().entry(core).or_default().push(frame.clone());
        self.inner.send(core, frame).await?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self, core: CoreId) -> TetherResult<Vec<u8>> {
        self.inner.receive(core).await
    }

    async fn is_alive(&self, core: CoreId) -> bool {
        self.inner.is_alive(core).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}
