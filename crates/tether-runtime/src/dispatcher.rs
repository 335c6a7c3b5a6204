//! Dispatcher: request lifecycle on the main core
//!
//! Outbound requests are sealed under the target core's session key and
//! tracked until a response settles them. One reader task per core routes
//! inbound frames: responses to waiting requests, handshake replies to the
//! handshake in progress, pongs to health probes.
//!
//! Every request settles exactly once. Settling releases the load slot
//! taken at send, whichever way it ends (response, failure, timeout or an
//! abandoned wait).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::{
    BootstrapPolicy, CoreId, CoreStatus, DispatchConfig, RequestId, RequestStatus, SecurityError,
    TetherError, TetherResult,
};
use tether_crypto::{begin_rotation, complete_rotation, CryptoProvider, Handshake, Identity, TrustStore};
use tether_transport::Transport;
use tether_wire::{
    Direction, Envelope, HandshakeMessage, Packet, RejectKind, Rejection, RequestBody, ResponseBody,
};

use crate::CoreRegistry;

/// Where a request should run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Target {
    /// Least loaded trusted core
    #[default]
    Auto,
    Core(CoreId),
}

impl From<CoreId> for Target {
    fn from(core: CoreId) -> Self {
        Target::Core(core)
    }
}

/// Settled request
///
/// `result` carries the operation outcome; an operation that failed on the
/// helper is still a successful dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub request_id: RequestId,
    pub core: CoreId,
    pub result: Result<Vec<u8>, String>,
}

type Outcome = TetherResult<Response>;

struct RequestRecord {
    core: CoreId,
    operation: String,
    status: RequestStatus,
    created_at: Instant,
    finished_at: Option<Instant>,
    /// Load slot still held on the core
    load_held: bool,
    /// The caller has seen the outcome or given up on it
    consumed: bool,
    slot: Option<oneshot::Sender<Outcome>>,
    waiter: Option<oneshot::Receiver<Outcome>>,
}

/// Settles a request if the owning future is dropped before disarming
struct SettleOnDrop<'a> {
    dispatcher: &'a Dispatcher,
    request: RequestId,
    status: RequestStatus,
    armed: bool,
}

impl SettleOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dispatcher.finish(self.request, self.status, None);
            self.dispatcher.mark_consumed(self.request);
        }
    }
}

/// Main-core request dispatcher
pub struct Dispatcher {
    identity: Arc<Identity>,
    bootstrap: BootstrapPolicy,
    config: DispatchConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<CoreRegistry>,
    trust: Arc<TrustStore>,
    next_request: AtomicU64,
    next_probe: AtomicU64,
    requests: Mutex<HashMap<RequestId, RequestRecord>>,
    /// Reply slot of the handshake or rotation in progress, per core
    handshakes: Mutex<HashMap<CoreId, oneshot::Sender<TetherResult<HandshakeMessage>>>>,
    probes: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    /// One handshake or rotation at a time per core
    handshake_locks: HashMap<CoreId, AsyncMutex<()>>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        identity: Arc<Identity>,
        bootstrap: BootstrapPolicy,
        config: DispatchConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<CoreRegistry>,
        trust: Arc<TrustStore>,
    ) -> Self {
        let handshake_locks = registry
            .ids()
            .into_iter()
            .map(|core| (core, AsyncMutex::new(())))
            .collect();

        if bootstrap.is_cleartext() {
            warn!("first session keys will travel in cleartext; configure a bootstrap secret to protect them");
        }

        Dispatcher {
            identity,
            bootstrap,
            config,
            transport,
            registry,
            trust,
            next_request: AtomicU64::new(1),
            next_probe: AtomicU64::new(1),
            requests: Mutex::new(HashMap::new()),
            handshakes: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            handshake_locks,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CoreRegistry> {
        &self.registry
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Spawn one reader task per core
    pub fn start_readers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        self.registry
            .ids()
            .into_iter()
            .map(|core| {
                let dispatcher = Arc::clone(self);
                tokio::spawn(async move { dispatcher.read_loop(core).await })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Seal and transmit a request, returning its id once it is in flight
    pub async fn send(
        &self,
        target: Target,
        operation: &str,
        payload: Vec<u8>,
    ) -> TetherResult<RequestId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TetherError::NoCoreAvailable);
        }
        let core = self.resolve(target)?;
        self.ensure_trust(core).await?;

        let body = RequestBody {
            operation: operation.to_string(),
            payload,
        }
        .to_bytes()?;

        let request = RequestId::new(self.next_request.fetch_add(1, Ordering::Relaxed));
        self.registry.increment_load(core)?;
        let (slot, waiter) = oneshot::channel();
        self.requests.lock().insert(
            request,
            RequestRecord {
                core,
                operation: operation.to_string(),
                status: RequestStatus::Pending,
                created_at: Instant::now(),
                finished_at: None,
                load_held: true,
                consumed: false,
                slot: Some(slot),
                waiter: Some(waiter),
            },
        );

        let guard = SettleOnDrop {
            dispatcher: self,
            request,
            status: RequestStatus::Failed,
            armed: true,
        };
        let sent = self
            .send_with_retry(core, || self.seal_request(core, request, &body))
            .await;
        if let Err(e) = sent {
            warn!(core = %core, request = %request, error = %e, "request could not be sent");
            return Err(e);
        }
        guard.disarm();

        self.advance(request, RequestStatus::InFlight);
        debug!(core = %core, request = %request, operation, "request in flight");
        Ok(request)
    }

    /// Wait for a request to settle
    ///
    /// Dropping the returned future counts as a timeout.
    pub async fn receive(&self, request: RequestId, timeout: Duration) -> TetherResult<Response> {
        let (core, mut waiter) = {
            let mut requests = self.requests.lock();
            let record = requests
                .get_mut(&request)
                .ok_or(TetherError::UnknownRequest(request))?;
            let waiter = record
                .waiter
                .take()
                .ok_or(TetherError::UnknownRequest(request))?;
            (record.core, waiter)
        };

        let guard = SettleOnDrop {
            dispatcher: self,
            request,
            status: RequestStatus::TimedOut,
            armed: true,
        };
        let waited = tokio::time::timeout(timeout, &mut waiter).await;
        guard.disarm();

        let outcome = match waited {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TetherError::HelperCrash { core }),
            Err(_) => {
                let timeout_error = || TetherError::Timeout { core, request };
                if self.finish(request, RequestStatus::TimedOut, None) {
                    info!(core = %core, request = %request, "request timed out");
                    Err(timeout_error())
                } else {
                    // Settled just as the deadline passed
                    waiter.try_recv().unwrap_or_else(|_| Err(timeout_error()))
                }
            }
        };
        self.mark_consumed(request);
        outcome
    }

    /// `send` followed by `receive`
    pub async fn call(
        &self,
        target: Target,
        operation: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> TetherResult<Response> {
        let request = self.send(target, operation, payload).await?;
        self.receive(request, timeout).await
    }

    pub fn request_status(&self, request: RequestId) -> TetherResult<RequestStatus> {
        self.requests
            .lock()
            .get(&request)
            .map(|r| r.status)
            .ok_or(TetherError::UnknownRequest(request))
    }

    /// Requests not yet settled
    pub fn in_flight(&self) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    /// Drop settled records and expire stuck ones
    ///
    /// Consumed records go at once; unconsumed settled records after the
    /// retention window. Unsettled requests older than the window time out.
    /// Returns the number of records removed.
    pub fn reap(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let mut expired = Vec::new();

        let removed = {
            let mut requests = self.requests.lock();
            let before = requests.len();
            requests.retain(|id, record| {
                if record.status.is_terminal() {
                    let aged = record
                        .finished_at
                        .map_or(true, |at| now.saturating_duration_since(at) >= retention);
                    !(record.consumed || aged)
                } else {
                    if now.saturating_duration_since(record.created_at) >= retention {
                        expired.push((*id, record.core));
                    }
                    true
                }
            });
            before - requests.len()
        };

        for (request, core) in expired {
            warn!(core = %core, request = %request, "expiring request past retention");
            self.finish(
                request,
                RequestStatus::TimedOut,
                Some(Err(TetherError::Timeout { core, request })),
            );
        }
        removed
    }

    fn resolve(&self, target: Target) -> TetherResult<CoreId> {
        match target {
            Target::Auto => match self.registry.least_loaded_core(|_| true) {
                // Nothing trusted: win back a core whose trust lapsed or never formed
                Err(TetherError::NoCoreAvailable) => {
                    let core = self
                        .registry
                        .first_with_status(CoreStatus::Initialized)
                        .ok_or(TetherError::NoCoreAvailable)?;
                    debug!(core = %core, "no trusted core, handshaking");
                    Ok(core)
                }
                selected => selected,
            },
            Target::Core(core) => {
                if self.registry.status(core)?.is_unavailable() {
                    return Err(TetherError::HelperCrash { core });
                }
                Ok(core)
            }
        }
    }

    /// Send with bounded retries for transient transport failures
    ///
    /// `frame` is called once per attempt so requests can be sealed afresh
    /// and no nonce goes out twice.
    async fn send_with_retry<F>(&self, core: CoreId, mut frame: F) -> TetherResult<()>
    where
        F: FnMut() -> TetherResult<Vec<u8>>,
    {
        let mut attempt = 0u32;
        loop {
            match self.transport.send(core, frame()?).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_backoff.saturating_mul(1 << attempt.min(16));
                    debug!(core = %core, attempt, ?delay, error = %e, "retrying send");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn seal_request(&self, core: CoreId, request: RequestId, body: &[u8]) -> TetherResult<Vec<u8>> {
        let me = self.identity.core_id();
        let nonce = CryptoProvider::generate_nonce()?;
        let (epoch, ciphertext) = self.trust.seal(core, body, |epoch| {
            Envelope::aad(Direction::Request, me, request, epoch, &nonce)
        })?;

        Packet::Request(Envelope {
            core_id: me,
            request_id: request,
            epoch,
            nonce,
            ciphertext,
        })
        .to_bytes()
    }

    /// Move a request forward without settling it
    fn advance(&self, request: RequestId, status: RequestStatus) {
        if let Some(record) = self.requests.lock().get_mut(&request) {
            if record.status.can_transition_to(status) {
                record.status = status;
            }
        }
    }

    /// Settle a request once; later attempts are ignored
    ///
    /// Returns whether this call settled it.
    fn finish(&self, request: RequestId, status: RequestStatus, outcome: Option<Outcome>) -> bool {
        let (core, release, slot) = {
            let mut requests = self.requests.lock();
            let Some(record) = requests.get_mut(&request) else {
                return false;
            };
            if !record.status.can_transition_to(status) {
                return false;
            }
            record.status = status;
            record.finished_at = Some(Instant::now());
            (
                record.core,
                std::mem::take(&mut record.load_held),
                record.slot.take(),
            )
        };

        if release {
            if let Err(e) = self.registry.decrement_load(core) {
                warn!(core = %core, error = %e, "cannot release load");
            }
        }
        if let (Some(slot), Some(outcome)) = (slot, outcome) {
            // Nobody waiting is fine
            let _ = slot.send(outcome);
        }
        debug!(core = %core, request = %request, %status, "request settled");
        true
    }

    fn mark_consumed(&self, request: RequestId) {
        if let Some(record) = self.requests.lock().get_mut(&request) {
            record.consumed = true;
        }
    }

    fn owned_by(&self, request: RequestId, core: CoreId) -> bool {
        self.requests
            .lock()
            .get(&request)
            .is_some_and(|r| r.core == core && !r.status.is_terminal())
    }

    /// Settle every unsettled request routed to `core`
    fn fail_core(&self, core: CoreId) {
        let pending: Vec<RequestId> = self
            .requests
            .lock()
            .iter()
            .filter(|(_, r)| r.core == core && !r.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for request in pending {
            self.finish(
                request,
                RequestStatus::Failed,
                Some(Err(TetherError::HelperCrash { core })),
            );
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn read_loop(&self, core: CoreId) {
        let mut failures = 0u32;
        loop {
            match self.transport.receive(core).await {
                Ok(frame) => {
                    failures = 0;
                    self.route(core, &frame);
                }
                Err(e) if self.closed.load(Ordering::Acquire) => {
                    debug!(core = %core, error = %e, "reader stopped at shutdown");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.config.retry_backoff.saturating_mul(1 << failures.min(6));
                    debug!(core = %core, error = %e, ?delay, "receive failed, backing off");
                    tokio::time::sleep(delay).await;
                    failures = failures.saturating_add(1);
                }
                Err(e) => {
                    warn!(core = %core, error = %e, "reader stopped");
                    self.fail_core(core);
                    return;
                }
            }
        }
    }

    fn route(&self, core: CoreId, frame: &[u8]) {
        let packet = match Packet::from_bytes(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(core = %core, error = %e, "undecodable frame from helper");
                return;
            }
        };

        match packet {
            Packet::Response(envelope) => self.on_response(core, envelope),
            Packet::Handshake(msg) => self.deliver_handshake(core, Ok(msg)),
            Packet::Reject(rejection) => self.on_reject(core, rejection),
            Packet::Pong { probe_id } => match self.probes.lock().remove(&probe_id) {
                Some(slot) => {
                    let _ = slot.send(());
                }
                None => debug!(core = %core, probe_id, "late pong"),
            },
            other => warn!(core = %core, packet = other.name(), "unexpected packet from helper"),
        }
    }

    fn on_response(&self, core: CoreId, envelope: Envelope) {
        let request = envelope.request_id;
        if envelope.core_id != core {
            warn!(core = %core, claimed = %envelope.core_id, request = %request, "response with mismatched sender");
            return;
        }
        if !self.owned_by(request, core) {
            debug!(core = %core, request = %request, "late or unknown response discarded");
            return;
        }

        let outcome = self.open_response(&envelope).map(|body| Response {
            request_id: request,
            core,
            result: body.into_result(),
        });
        let status = match &outcome {
            Ok(Response { result: Ok(_), .. }) => RequestStatus::Completed,
            Ok(_) => RequestStatus::Failed,
            Err(e) => {
                warn!(core = %core, request = %request, error = %e, "response refused");
                RequestStatus::Failed
            }
        };
        self.finish(request, status, Some(outcome));
    }

    fn open_response(&self, envelope: &Envelope) -> TetherResult<ResponseBody> {
        let core = envelope.core_id;
        let plaintext = self.trust.open(
            core,
            envelope.epoch,
            &envelope.header_aad(Direction::Response),
            &envelope.ciphertext,
        )?;
        self.trust.require_fresh_nonce(core, envelope.nonce)?;
        ResponseBody::from_bytes(&plaintext)
    }

    fn on_reject(&self, core: CoreId, rejection: Rejection) {
        let error = rejection_error(core, &rejection);
        match rejection.request_id {
            Some(request) if self.owned_by(request, core) => {
                warn!(core = %core, request = %request, kind = ?rejection.kind, reason = %rejection.reason, "request rejected by helper");
                self.finish(request, RequestStatus::Failed, Some(Err(error)));
            }
            Some(request) => {
                debug!(core = %core, request = %request, "rejection for settled request ignored");
            }
            None if rejection.kind == RejectKind::Handshake => self.deliver_handshake(core, Err(error)),
            None => {
                warn!(core = %core, kind = ?rejection.kind, reason = %rejection.reason, "helper rejected a frame");
            }
        }
    }

    fn deliver_handshake(&self, core: CoreId, reply: TetherResult<HandshakeMessage>) {
        match self.handshakes.lock().remove(&core) {
            Some(slot) => {
                let _ = slot.send(reply);
            }
            None => debug!(core = %core, "unsolicited handshake reply dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Trust
    // ------------------------------------------------------------------

    /// Pure read against the trust store
    pub fn verify_trust(&self, core: CoreId) -> bool {
        tether_crypto::verify_trust(&self.trust, core)
    }

    /// Handshake unless trust already exists
    pub async fn ensure_trust(&self, core: CoreId) -> TetherResult<()> {
        if self.verify_trust(core) {
            return Ok(());
        }
        self.handshake(core, false).await
    }

    /// Run a fresh handshake even if trust exists
    pub async fn establish_trust(&self, core: CoreId) -> TetherResult<()> {
        self.handshake(core, true).await
    }

    /// Delete what is known about a core so a new identity can be accepted
    pub fn forget_trust(&self, core: CoreId) -> TetherResult<()> {
        self.registry.set_status(core, CoreStatus::Initialized)?;
        self.trust.forget(core);
        Ok(())
    }

    async fn handshake(&self, core: CoreId, force: bool) -> TetherResult<()> {
        let lock = self
            .handshake_locks
            .get(&core)
            .ok_or(TetherError::UnknownCore(core))?;
        let _serial = lock.lock().await;
        if !force && self.verify_trust(core) {
            // Completed by a concurrent caller
            return Ok(());
        }

        let previous = self.registry.set_status(core, CoreStatus::Handshaking)?;
        let result = self.run_handshake(core).await;
        match &result {
            Ok(()) => {
                self.registry.set_status(core, CoreStatus::Trusted)?;
            }
            Err(e) => {
                warn!(core = %core, error = %e, "handshake failed");
                let fallback = if previous.is_selectable() && !self.verify_trust(core) {
                    CoreStatus::Initialized
                } else {
                    previous
                };
                self.registry.set_status(core, fallback)?;
            }
        }
        result
    }

    async fn run_handshake(&self, core: CoreId) -> TetherResult<()> {
        let mut handshake = Handshake::initiator(Arc::clone(&self.identity), core, self.bootstrap.clone());
        let hello = handshake.start()?;
        let ack = self.exchange(core, hello).await?;
        let key_exchange = handshake.on_hello_ack(&ack, &self.trust)?;
        let confirmation = self.exchange(core, key_exchange).await?;
        handshake.on_key_exchange_ack(&confirmation, &self.trust)
    }

    /// Replace the session key with `core`, returning the new epoch
    ///
    /// The new key is committed only after the helper confirms it.
    pub async fn rotate_keys(&self, core: CoreId) -> TetherResult<u32> {
        let lock = self
            .handshake_locks
            .get(&core)
            .ok_or(TetherError::UnknownCore(core))?;
        let _serial = lock.lock().await;

        let (offer, pending) = begin_rotation(&self.trust, self.identity.core_id(), core)?;
        let epoch = pending.epoch();
        let ack = self.exchange(core, offer).await?;
        complete_rotation(&self.trust, pending, &ack)?;
        Ok(epoch)
    }

    /// Send one handshake message and wait for the reply
    async fn exchange(&self, core: CoreId, msg: HandshakeMessage) -> TetherResult<HandshakeMessage> {
        let frame = Packet::Handshake(msg).to_bytes()?;
        let (slot, reply) = oneshot::channel();
        self.handshakes.lock().insert(core, slot);

        if let Err(e) = self.send_with_retry(core, || Ok(frame.clone())).await {
            self.handshakes.lock().remove(&core);
            return Err(e);
        }

        match tokio::time::timeout(self.config.handshake_timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(TetherError::handshake(core, "handshake abandoned")),
            Err(_) => {
                self.handshakes.lock().remove(&core);
                Err(TetherError::handshake(core, "no handshake reply"))
            }
        }
    }

    // ------------------------------------------------------------------
    // Probes and teardown
    // ------------------------------------------------------------------

    /// Application-level liveness probe, returning the round-trip time
    pub async fn ping(&self, core: CoreId, timeout: Duration) -> TetherResult<Duration> {
        let probe_id = self.next_probe.fetch_add(1, Ordering::Relaxed);
        let (slot, pong) = oneshot::channel();
        self.probes.lock().insert(probe_id, slot);

        let started = Instant::now();
        let result = async {
            self.transport
                .send(core, Packet::Ping { probe_id }.to_bytes()?)
                .await?;
            match tokio::time::timeout(timeout, pong).await {
                Ok(Ok(())) => Ok(started.elapsed()),
                Ok(Err(_)) => Err(TetherError::HelperCrash { core }),
                Err(_) => Err(TetherError::transport(core, "probe timed out", true)),
            }
        }
        .await;

        self.probes.lock().remove(&probe_id);
        result
    }

    /// Settle everything outstanding and refuse new work
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for core in self.registry.ids() {
            self.fail_core(core);
        }
        self.handshakes.lock().clear();
        self.probes.lock().clear();
        info!("dispatcher shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn rejection_error(core: CoreId, rejection: &Rejection) -> TetherError {
    let security = |kind| TetherError::Security {
        core: Some(core),
        kind,
    };
    match rejection.kind {
        RejectKind::Decryption => security(SecurityError::Decryption),
        RejectKind::Replay => security(SecurityError::Replay),
        RejectKind::Malformed => TetherError::Wire(format!("rejected by {}: {}", core, rejection.reason)),
        RejectKind::Handshake => TetherError::handshake(core, rejection.reason.clone()),
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &self.transport.kind())
            .field("cores", &self.registry.len())
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
