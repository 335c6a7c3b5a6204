//! Helper core process
//!
//! Serves framed packets either on stdin/stdout (spawned by the process
//! transport) or over HTTP (for the HTTP transport).

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use tokio::net::TcpListener;
use tracing::{error, info};

use tether_core::{
    BootstrapPolicy, CoreId, SessionPolicy, TetherError, TetherResult, TrustConfig,
    BOOTSTRAP_SECRET_ENV,
};
use tether_runtime::logging::{self, LogFormat};
use tether_runtime::{OperationTable, Worker};
use tether_transport::{serve_http, serve_stdio};

#[derive(Parser, Debug)]
#[command(name = "tether-worker")]
#[command(about = "Tether helper core: runs operations dispatched by the main core", long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["stdio", "listen"])))]
struct Cli {
    /// Core number assigned by the main core (1..)
    #[arg(long)]
    core_id: u32,

    /// Serve frames on stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// Serve frames over HTTP on this address
    #[arg(long, value_name = "HOST:PORT")]
    listen: Option<SocketAddr>,

    /// Hex-encoded 32-byte secret protecting the first session key
    #[arg(long, env = BOOTSTRAP_SECRET_ENV, hide_env_values = true)]
    bootstrap_secret: Option<String>,

    /// How long the previous session key still decrypts after a rotation
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s")]
    rotation_grace: Duration,

    /// Expire session keys after this long
    #[arg(long, value_parser = humantime::parse_duration)]
    session_max_age: Option<Duration>,

    /// Expire session keys after this many seals
    #[arg(long)]
    session_max_uses: Option<u64>,

    /// Remembered nonces per peer
    #[arg(long, default_value_t = 4096, value_parser = clap::value_parser!(u64).range(1..))]
    nonce_capacity: u64,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn trust_config(&self) -> TetherResult<TrustConfig> {
        let nonce_capacity = usize::try_from(self.nonce_capacity)
            .map_err(|_| TetherError::Config("nonce capacity out of range".into()))?;
        Ok(TrustConfig {
            session: SessionPolicy {
                max_age: self.session_max_age,
                max_uses: self.session_max_uses,
            },
            rotation_grace: self.rotation_grace,
            nonce_capacity,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.log_format) {
        eprintln!("tether-worker: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> TetherResult<()> {
    if cli.core_id == 0 {
        return Err(TetherError::Config("core 0 is the main core".into()));
    }
    let core = CoreId::new(cli.core_id);
    let bootstrap = match cli.bootstrap_secret.as_deref() {
        Some(secret) => BootstrapPolicy::from_hex(secret)?,
        None => BootstrapPolicy::Cleartext,
    };

    let trust = cli.trust_config()?;

    let operations = OperationTable::builtin();
    info!(core = %core, ?operations, ?trust, "worker ready");
    let worker = Arc::new(Worker::with_trust_config(core, bootstrap, operations, trust));

    match cli.listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| TetherError::Config(format!("cannot listen on {}: {}", addr, e)))?;
            serve_http(listener, worker).await
        }
        None => serve_stdio(worker).await,
    }
}
