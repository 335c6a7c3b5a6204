//! Runtime configuration
//!
//! The option surface is a list of key/value pairs validated once, at the
//! configuration boundary. Everything past this point works with typed,
//! immutable values.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{CoreId, TetherError, TetherResult};

/// Default number of helper cores
pub const DEFAULT_NUMBER_OF_CORES: u32 = 2;

/// Upper bound on configured helper cores
pub const MAX_NUMBER_OF_CORES: u32 = 1024;

/// Default HTTP port of the first helper core
pub const DEFAULT_PORT: u16 = 8080;

/// Default HTTP host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default helper executable
pub const DEFAULT_WORKER_PROGRAM: &str = "tether-worker";

/// Environment variable carrying the bootstrap secret to helper processes
pub const BOOTSTRAP_SECRET_ENV: &str = "TETHER_BOOTSTRAP_SECRET";

/// Size of a bootstrap pre-shared secret
pub const BOOTSTRAP_SECRET_SIZE: usize = 32;

/// How helpers are reached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImplementationType {
    /// Spawned local processes over stdin/stdout
    Process,
    /// HTTP server per helper
    Httpd,
}

impl FromStr for ImplementationType {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(ImplementationType::Process),
            "httpd" => Ok(ImplementationType::Httpd),
            other => Err(TetherError::Config(format!(
                "unknown implementation type '{}', expected Process or HTTPD",
                other
            ))),
        }
    }
}

impl fmt::Display for ImplementationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImplementationType::Process => f.write_str("Process"),
            ImplementationType::Httpd => f.write_str("HTTPD"),
        }
    }
}

/// Transport-specific address of one helper core
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportAddress {
    Process {
        program: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
    },
    Http {
        host: String,
        port: u16,
    },
}

impl TransportAddress {
    pub fn kind(&self) -> ImplementationType {
        match self {
            TransportAddress::Process { .. } => ImplementationType::Process,
            TransportAddress::Http { .. } => ImplementationType::Httpd,
        }
    }
}

/// Immutable configuration of one helper core
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    pub id: CoreId,
    pub address: TransportAddress,
}

/// How the very first session key travels to a helper
#[derive(Clone, PartialEq, Eq, Default)]
pub enum BootstrapPolicy {
    /// Trust on first contact: the first key crosses the channel unprotected
    #[default]
    Cleartext,
    /// First key is wrapped under a key derived from an out-of-band secret
    PreSharedSecret([u8; BOOTSTRAP_SECRET_SIZE]),
}

impl BootstrapPolicy {
    /// Parse a hex-encoded 32-byte secret
    pub fn from_hex(secret: &str) -> TetherResult<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| TetherError::Config(format!("bootstrap secret is not hex: {}", e)))?;
        let secret: [u8; BOOTSTRAP_SECRET_SIZE] = bytes.try_into().map_err(|_| {
            TetherError::Config(format!(
                "bootstrap secret must be {} bytes",
                BOOTSTRAP_SECRET_SIZE
            ))
        })?;
        Ok(BootstrapPolicy::PreSharedSecret(secret))
    }

    pub fn is_cleartext(&self) -> bool {
        matches!(self, BootstrapPolicy::Cleartext)
    }
}

impl fmt::Debug for BootstrapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapPolicy::Cleartext => f.write_str("Cleartext"),
            BootstrapPolicy::PreSharedSecret(_) => f.write_str("PreSharedSecret(..)"),
        }
    }
}

/// Session key expiry policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    pub max_age: Option<Duration>,
    pub max_uses: Option<u64>,
}

/// Trust store tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrustConfig {
    pub session: SessionPolicy,
    /// How long the previous epoch's key still decrypts after a rotation
    pub rotation_grace: Duration,
    /// Bound on remembered nonces per core
    pub nonce_capacity: usize,
}

impl Default for TrustConfig {
    fn default() -> Self {
        TrustConfig {
            session: SessionPolicy::default(),
            rotation_grace: Duration::from_secs(30),
            nonce_capacity: 4096,
        }
    }
}

impl TrustConfig {
    /// Command-line flags handing this tuning to a helper process
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            "--rotation-grace".to_string(),
            humantime::format_duration(self.rotation_grace).to_string(),
            "--nonce-capacity".to_string(),
            self.nonce_capacity.to_string(),
        ];
        if let Some(max_age) = self.session.max_age {
            args.push("--session-max-age".to_string());
            args.push(humantime::format_duration(max_age).to_string());
        }
        if let Some(max_uses) = self.session.max_uses {
            args.push("--session-max-uses".to_string());
            args.push(max_uses.to_string());
        }
        args
    }
}

/// Health monitor tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a core is marked unresponsive
    pub failure_threshold: u32,
    /// Load above which a core is marked overloaded
    pub overload_ceiling: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(1),
            failure_threshold: 3,
            overload_ceiling: 64,
        }
    }
}

/// Dispatcher tuning
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Retries after the first attempt for transient transport errors
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// How long finished request records are kept
    pub retention: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            retention: Duration::from_secs(60),
        }
    }
}

/// Process-wide runtime configuration
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub implementation: ImplementationType,
    pub number_of_cores: u32,
    pub host: String,
    pub port: u16,
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub bootstrap: BootstrapPolicy,
    pub trust: TrustConfig,
    pub health: HealthConfig,
    pub dispatch: DispatchConfig,
}

impl RuntimeConfig {
    /// Defaults for an implementation type
    pub fn new(implementation: ImplementationType) -> Self {
        RuntimeConfig {
            implementation,
            number_of_cores: DEFAULT_NUMBER_OF_CORES,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            worker_program: DEFAULT_WORKER_PROGRAM.to_string(),
            worker_args: Vec::new(),
            bootstrap: BootstrapPolicy::default(),
            trust: TrustConfig::default(),
            health: HealthConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }

    /// Build from an implementation name and key/value options
    pub fn from_options<K, V>(implementation: &str, options: &[(K, V)]) -> TetherResult<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let implementation: ImplementationType = implementation.parse()?;
        let mut config = RuntimeConfig::new(implementation);
        let mut explicit_bootstrap = None;

        for (key, value) in options {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            match key.to_ascii_lowercase().as_str() {
                "numberofcores" => config.number_of_cores = parse_number(key, value)?,
                "port" => {
                    config.require(ImplementationType::Httpd, key)?;
                    config.port = parse_number(key, value)?;
                }
                "host" => {
                    config.require(ImplementationType::Httpd, key)?;
                    config.host = value.to_string();
                }
                "workerprogram" => {
                    config.require(ImplementationType::Process, key)?;
                    config.worker_program = value.to_string();
                }
                "workerargs" => {
                    config.require(ImplementationType::Process, key)?;
                    config.worker_args = value.split_whitespace().map(str::to_string).collect();
                }
                "requesttimeout" => config.dispatch.request_timeout = parse_duration(key, value)?,
                "handshaketimeout" => {
                    config.dispatch.handshake_timeout = parse_duration(key, value)?
                }
                "maxretries" => config.dispatch.max_retries = parse_number(key, value)?,
                "healthinterval" => config.health.interval = parse_duration(key, value)?,
                "probetimeout" => config.health.probe_timeout = parse_duration(key, value)?,
                "failurethreshold" => config.health.failure_threshold = parse_number(key, value)?,
                "overloadceiling" => config.health.overload_ceiling = parse_number(key, value)?,
                "rotationgrace" => config.trust.rotation_grace = parse_duration(key, value)?,
                "sessionmaxage" => {
                    config.trust.session.max_age = Some(parse_duration(key, value)?)
                }
                "sessionmaxuses" => config.trust.session.max_uses = Some(parse_number(key, value)?),
                "bootstrapsecret" => config.bootstrap = BootstrapPolicy::from_hex(value)?,
                "bootstrap" => explicit_bootstrap = Some(value.to_ascii_lowercase()),
                _ => {
                    return Err(TetherError::Config(format!("unknown option '{}'", key)));
                }
            }
        }

        match explicit_bootstrap.as_deref() {
            None => {}
            Some("cleartext") if config.bootstrap.is_cleartext() => {}
            Some("cleartext") => {
                return Err(TetherError::Config(
                    "Bootstrap=cleartext conflicts with BootstrapSecret".into(),
                ))
            }
            Some("secret") if !config.bootstrap.is_cleartext() => {}
            Some("secret") => {
                return Err(TetherError::Config(
                    "Bootstrap=secret requires BootstrapSecret".into(),
                ))
            }
            Some(other) => {
                return Err(TetherError::Config(format!(
                    "unknown bootstrap mode '{}', expected cleartext or secret",
                    other
                )))
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn require(&self, implementation: ImplementationType, key: &str) -> TetherResult<()> {
        if self.implementation == implementation {
            Ok(())
        } else {
            Err(TetherError::Config(format!(
                "option '{}' applies to {} only",
                key, implementation
            )))
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> TetherResult<()> {
        if self.number_of_cores == 0 {
            return Err(TetherError::Config("NumberOfCores must be at least 1".into()));
        }
        if self.number_of_cores > MAX_NUMBER_OF_CORES {
            return Err(TetherError::Config(format!(
                "NumberOfCores {} exceeds maximum {}",
                self.number_of_cores, MAX_NUMBER_OF_CORES
            )));
        }
        if self.implementation == ImplementationType::Httpd {
            let last = u16::try_from(self.number_of_cores - 1)
                .ok()
                .and_then(|offset| self.port.checked_add(offset));
            if self.port == 0 || last.is_none() {
                return Err(TetherError::Config(format!(
                    "{} ports from {} do not fit below {}",
                    self.number_of_cores,
                    self.port,
                    u16::MAX
                )));
            }
        }
        if self.implementation == ImplementationType::Process && self.worker_program.is_empty() {
            return Err(TetherError::Config("WorkerProgram must not be empty".into()));
        }
        if self.health.failure_threshold == 0 {
            return Err(TetherError::Config("FailureThreshold must be at least 1".into()));
        }
        if self.trust.nonce_capacity == 0 {
            return Err(TetherError::Config("nonce capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Per-core configuration, numbered 1..=NumberOfCores
    pub fn cores(&self) -> Vec<CoreConfig> {
        (1..=self.number_of_cores.min(MAX_NUMBER_OF_CORES))
            .map(|n| CoreConfig {
                id: CoreId::new(n),
                address: self.address_for(n),
            })
            .collect()
    }

    fn address_for(&self, n: u32) -> TransportAddress {
        match self.implementation {
            ImplementationType::Httpd => TransportAddress::Http {
                host: self.host.clone(),
                // In range once validated
                port: self
                    .port
                    .saturating_add(u16::try_from(n - 1).unwrap_or(u16::MAX)),
            },
            ImplementationType::Process => {
                let mut args = self.worker_args.clone();
                args.extend(["--stdio".to_string(), "--core-id".to_string(), n.to_string()]);
                args.extend(self.trust.worker_args());
                let mut env = Vec::new();
                if let BootstrapPolicy::PreSharedSecret(secret) = &self.bootstrap {
                    env.push((BOOTSTRAP_SECRET_ENV.to_string(), hex::encode(secret)));
                }
                TransportAddress::Process {
                    program: self.worker_program.clone(),
                    args,
                    env,
                }
            }
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> TetherResult<T>
where
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| TetherError::Config(format!("invalid value '{}' for {}: {}", value, key, e)))
}

fn parse_duration(key: &str, value: &str) -> TetherResult<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| TetherError::Config(format!("invalid duration '{}' for {}: {}", value, key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_OPTIONS: &[(&str, &str)] = &[];

    #[test]
    fn test_implementation_type_is_closed() {
        assert_eq!(
            "Process".parse::<ImplementationType>().unwrap(),
            ImplementationType::Process
        );
        assert_eq!(
            "HTTPD".parse::<ImplementationType>().unwrap(),
            ImplementationType::Httpd
        );
        assert!(matches!(
            "Thread".parse::<ImplementationType>(),
            Err(TetherError::Config(_))
        ));
    }

    #[test]
    fn test_defaults_applied() {
        let config = RuntimeConfig::from_options("HTTPD", NO_OPTIONS).unwrap();
        assert_eq!(config.number_of_cores, 2);
        assert_eq!(config.port, 8080);

        let cores = config.cores();
        assert_eq!(cores.len(), 2);
        assert_eq!(
            cores[1].address,
            TransportAddress::Http {
                host: "127.0.0.1".into(),
                port: 8081
            }
        );
    }

    #[test]
    fn test_options_parsed() {
        let config = RuntimeConfig::from_options(
            "Process",
            &[
                ("NumberOfCores", "4"),
                ("WorkerProgram", "/usr/bin/worker"),
                ("WorkerArgs", "--quiet"),
                ("RequestTimeout", "250ms"),
                ("FailureThreshold", "5"),
                ("SessionMaxUses", "1000"),
            ],
        )
        .unwrap();

        assert_eq!(config.number_of_cores, 4);
        assert_eq!(config.dispatch.request_timeout, Duration::from_millis(250));
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.trust.session.max_uses, Some(1000));

        let cores = config.cores();
        assert_eq!(cores[3].id, CoreId::new(4));
        match &cores[3].address {
            TransportAddress::Process { program, args, env } => {
                assert_eq!(program, "/usr/bin/worker");
                assert_eq!(
                    args,
                    &[
                        "--quiet",
                        "--stdio",
                        "--core-id",
                        "4",
                        "--rotation-grace",
                        "30s",
                        "--nonce-capacity",
                        "4096",
                        "--session-max-uses",
                        "1000",
                    ]
                );
                assert!(env.is_empty());
            }
            other => panic!("unexpected address {:?}", other),
        }
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(RuntimeConfig::from_options("HTTPD", &[("Colour", "blue")]).is_err());
        assert!(RuntimeConfig::from_options("HTTPD", &[("NumberOfCores", "0")]).is_err());
        assert!(RuntimeConfig::from_options("HTTPD", &[("NumberOfCores", "x")]).is_err());
        assert!(RuntimeConfig::from_options("Process", &[("Port", "9000")]).is_err());
        assert!(RuntimeConfig::from_options("HTTPD", &[("Port", "65535"), ("NumberOfCores", "2")]).is_err());
        assert!(RuntimeConfig::from_options("HTTPD", &[("HealthInterval", "soon")]).is_err());
    }

    #[test]
    fn test_core_count_bounded() {
        for implementation in ["HTTPD", "Process"] {
            let result =
                RuntimeConfig::from_options(implementation, &[("NumberOfCores", "4294967295")]);
            assert!(matches!(result, Err(TetherError::Config(_))));
        }

        let limit = MAX_NUMBER_OF_CORES.to_string();
        let config =
            RuntimeConfig::from_options("Process", &[("NumberOfCores", limit.as_str())]).unwrap();
        assert_eq!(config.cores().len(), MAX_NUMBER_OF_CORES as usize);
        assert!(RuntimeConfig::from_options(
            "Process",
            &[("NumberOfCores", (MAX_NUMBER_OF_CORES + 1).to_string().as_str())]
        )
        .is_err());

        // Last port lands exactly on the top of the range
        let config = RuntimeConfig::from_options(
            "HTTPD",
            &[("Port", "65534"), ("NumberOfCores", "2")],
        )
        .unwrap();
        assert_eq!(
            config.cores()[1].address,
            TransportAddress::Http {
                host: DEFAULT_HOST.into(),
                port: u16::MAX
            }
        );
    }

    #[test]
    fn test_trust_tuning_reaches_workers() {
        let config = RuntimeConfig::from_options(
            "Process",
            &[
                ("RotationGrace", "250ms"),
                ("SessionMaxAge", "1h"),
            ],
        )
        .unwrap();

        match &config.cores()[0].address {
            TransportAddress::Process { args, .. } => {
                assert_eq!(
                    &args[3..],
                    &[
                        "--rotation-grace",
                        "250ms",
                        "--nonce-capacity",
                        "4096",
                        "--session-max-age",
                        "1h",
                    ]
                );
            }
            other => panic!("unexpected address {:?}", other),
        }
    }

    #[test]
    fn test_bootstrap_secret() {
        let secret = "11".repeat(BOOTSTRAP_SECRET_SIZE);
        let config =
            RuntimeConfig::from_options("Process", &[("BootstrapSecret", secret.as_str())]).unwrap();
        assert_eq!(
            config.bootstrap,
            BootstrapPolicy::PreSharedSecret([0x11; BOOTSTRAP_SECRET_SIZE])
        );
        assert_eq!(format!("{:?}", config.bootstrap), "PreSharedSecret(..)");

        // Secret is handed to helper processes through the environment
        match &config.cores()[0].address {
            TransportAddress::Process { env, .. } => {
                assert_eq!(env, &[(BOOTSTRAP_SECRET_ENV.to_string(), secret.clone())]);
            }
            other => panic!("unexpected address {:?}", other),
        }

        assert!(RuntimeConfig::from_options("Process", &[("BootstrapSecret", "abcd")]).is_err());
        assert!(RuntimeConfig::from_options("Process", &[("Bootstrap", "secret")]).is_err());
        assert!(RuntimeConfig::from_options(
            "Process",
            &[("BootstrapSecret", secret.as_str()), ("Bootstrap", "cleartext")]
        )
        .is_err());
    }
}
