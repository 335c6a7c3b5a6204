//! HTTP transport
//!
//! Each helper runs a small server:
//!
//! | Route            | Meaning                                             |
//! |------------------|-----------------------------------------------------|
//! | `POST /dispatch` | accept one frame (202); any reply goes to the outbox |
//! | `GET /dispatch`  | long-poll the outbox: 200 + frame, or 204 on timeout |
//! | `GET /health`    | liveness probe                                      |
//!
//! The main core posts frames with `reqwest` and keeps one long-poll open
//! per helper to collect replies.
//!
//! `POST /dispatch` accepts bodies up to [`MAX_FRAME_SIZE`], the same
//! ceiling the stream transports enforce. Payloads are hex-encoded twice on
//! the way (once inside the sealed body, once as ciphertext), so an
//! operation payload should stay below roughly a quarter of that.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info};

use tether_core::{CoreConfig, CoreId, TetherError, TetherResult, TransportAddress};
use tether_wire::MAX_FRAME_SIZE;

use crate::{FrameHandler, Transport};

/// Default long-poll hold time on the helper
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Connect timeout for every client request
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for posting one frame
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a health probe
const HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames waiting for the main core to collect them
#[derive(Default)]
struct Outbox {
    frames: Mutex<VecDeque<Vec<u8>>>,
    ready: Notify,
}

impl Outbox {
    fn push(&self, frame: Vec<u8>) {
        self.frames.lock().push_back(frame);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.frames.lock().pop_front()
    }
}

/// Shared server state for axum handlers
#[derive(Clone)]
struct ServerState {
    handler: Arc<dyn FrameHandler>,
    outbox: Arc<Outbox>,
    poll_timeout: Duration,
}

/// Helper-side HTTP server
pub struct HttpServer {
    state: ServerState,
}

impl HttpServer {
    pub fn new(handler: Arc<dyn FrameHandler>) -> Self {
        HttpServer {
            state: ServerState {
                handler,
                outbox: Arc::new(Outbox::default()),
                poll_timeout: DEFAULT_POLL_TIMEOUT,
            },
        }
    }

    /// How long `GET /dispatch` waits for a frame before answering 204
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.state.poll_timeout = timeout;
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/dispatch", get(poll_dispatch).post(post_dispatch))
            .route("/health", get(health_check))
            .layer(DefaultBodyLimit::max(MAX_FRAME_SIZE))
            .with_state(self.state.clone())
    }

    /// Serve until the listener fails
    pub async fn serve(self, listener: TcpListener) -> TetherResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| TetherError::Config(format!("listener has no address: {}", e)))?;
        info!(%addr, "helper HTTP server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| TetherError::Config(format!("HTTP server failed: {}", e)))
    }
}

/// Helper side: serve frames over HTTP on `listener`
pub async fn serve_http(listener: TcpListener, handler: Arc<dyn FrameHandler>) -> TetherResult<()> {
    HttpServer::new(handler).serve(listener).await
}

async fn post_dispatch(State(state): State<ServerState>, body: Bytes) -> StatusCode {
    let frame = body.to_vec();
    tokio::spawn(async move {
        if let Some(reply) = state.handler.handle_frame(frame).await {
            state.outbox.push(reply);
        }
    });
    StatusCode::ACCEPTED
}

async fn poll_dispatch(State(state): State<ServerState>) -> Response {
    let deadline = tokio::time::Instant::now() + state.poll_timeout;
    loop {
        let ready = state.outbox.ready.notified();
        if let Some(frame) = state.outbox.pop() {
            return (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], frame).into_response();
        }
        if tokio::time::timeout_at(deadline, ready).await.is_err() {
            return StatusCode::NO_CONTENT.into_response();
        }
    }
}

async fn health_check() -> &'static str {
    "ok"
}

/// Main-core side of the HTTP transport
pub struct HttpTransport {
    client: Client,
    endpoints: BTreeMap<CoreId, String>,
    poll_timeout: Duration,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(cores: &[CoreConfig]) -> TetherResult<Self> {
        let mut endpoints = BTreeMap::new();
        for core in cores {
            let TransportAddress::Http { host, port } = &core.address else {
                return Err(TetherError::Config(format!(
                    "{} is not configured for the HTTP transport",
                    core.id
                )));
            };
            endpoints.insert(core.id, format!("http://{}:{}", host, port));
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TetherError::Config(format!("HTTP client: {}", e)))?;

        Ok(HttpTransport {
            client,
            endpoints,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            closed: AtomicBool::new(false),
        })
    }

    /// Expected helper long-poll hold time; the client waits a little longer
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    fn endpoint(&self, core: CoreId) -> TetherResult<&str> {
        self.endpoints
            .get(&core)
            .map(String::as_str)
            .ok_or(TetherError::UnknownCore(core))
    }

    fn check_open(&self, core: CoreId) -> TetherResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TetherError::transport(core, "transport shut down", false));
        }
        Ok(())
    }
}

/// Classify a client error: connection problems and timeouts may clear up
fn client_error(core: CoreId, e: reqwest::Error) -> TetherError {
    let retryable = e.is_connect() || e.is_timeout();
    TetherError::transport(core, e.to_string(), retryable)
}

/// Classify a non-success status: 5xx may clear up, 4xx will not
fn status_error(core: CoreId, status: reqwest::StatusCode) -> TetherError {
    TetherError::transport(core, format!("helper answered {}", status), status.is_server_error())
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn cores(&self) -> Vec<CoreId> {
        self.endpoints.keys().copied().collect()
    }

    async fn send(&self, core: CoreId, frame: Vec<u8>) -> TetherResult<()> {
        self.check_open(core)?;
        let url = format!("{}/dispatch", self.endpoint(core)?);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(SEND_TIMEOUT)
            .body(frame)
            .send()
            .await
            .map_err(|e| client_error(core, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(core, status));
        }
        Ok(())
    }

    async fn receive(&self, core: CoreId) -> TetherResult<Vec<u8>> {
        let url = format!("{}/dispatch", self.endpoint(core)?);
        loop {
            self.check_open(core)?;
            let response = self
                .client
                .get(&url)
                .timeout(self.poll_timeout + CONNECT_TIMEOUT)
                .send()
                .await
                .map_err(|e| client_error(core, e))?;

            match response.status() {
                reqwest::StatusCode::OK => {
                    let body = response.bytes().await.map_err(|e| client_error(core, e))?;
                    return Ok(body.to_vec());
                }
                reqwest::StatusCode::NO_CONTENT => {
                    debug!(core = %core, "long-poll expired, polling again");
                }
                status => return Err(status_error(core, status)),
            }
        }
    }

    async fn is_alive(&self, core: CoreId) -> bool {
        let Ok(base) = self.endpoint(core) else {
            return false;
        };
        match self
            .client
            .get(format!("{}/health", base))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(core = %core, error = %e, "health endpoint unreachable");
                false
            }
        }
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(helpers = self.endpoints.len(), "HTTP transport closed");
        }
    }
}
