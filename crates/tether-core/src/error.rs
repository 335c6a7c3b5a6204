//! Error types for Tether

use thiserror::Error;

use crate::{CoreId, Fingerprint, RequestId};

/// Security violations. Never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("trust conflict: expected fingerprint {expected}, presented {presented}")]
    TrustConflict {
        expected: Fingerprint,
        presented: Fingerprint,
    },

    #[error("decryption failed")]
    Decryption,

    #[error("replayed nonce")]
    Replay,
}

/// Core Tether errors
#[derive(Error, Debug)]
pub enum TetherError {
    // Setup errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Transport errors
    #[error("Transport error on {core}: {message} (retryable: {retryable})")]
    Transport {
        core: CoreId,
        message: String,
        retryable: bool,
    },

    #[error("Helper {core} crashed or is unreachable")]
    HelperCrash { core: CoreId },

    // Security errors
    #[error("Security error on {}: {kind}", fmt_core(.core))]
    Security {
        core: Option<CoreId>,
        kind: SecurityError,
    },

    #[error("Handshake with {core} failed: {reason}")]
    Handshake { core: CoreId, reason: String },

    #[error("Secure random source unavailable")]
    Entropy,

    // Dispatch errors
    #[error("Request {request} to {core} timed out")]
    Timeout { core: CoreId, request: RequestId },

    #[error("No core available")]
    NoCoreAvailable,

    #[error("Unknown core: {0}")]
    UnknownCore(CoreId),

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    // Wire errors
    #[error("Invalid wire format: {0}")]
    Wire(String),
}

fn fmt_core(core: &Option<CoreId>) -> String {
    match core {
        Some(core) => core.to_string(),
        None => "unknown core".to_string(),
    }
}

impl TetherError {
    pub fn transport(core: CoreId, message: impl Into<String>, retryable: bool) -> Self {
        TetherError::Transport {
            core,
            message: message.into(),
            retryable,
        }
    }

    pub fn security(kind: SecurityError) -> Self {
        TetherError::Security { core: None, kind }
    }

    pub fn handshake(core: CoreId, reason: impl Into<String>) -> Self {
        TetherError::Handshake {
            core,
            reason: reason.into(),
        }
    }

    /// Only transient transport failures qualify for automatic retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, TetherError::Transport { retryable: true, .. })
    }

    pub fn is_security(&self) -> bool {
        matches!(self, TetherError::Security { .. })
    }

    /// Security error kind, if this is one
    pub fn security_kind(&self) -> Option<&SecurityError> {
        match self {
            TetherError::Security { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Core this error relates to, if known
    pub fn core(&self) -> Option<CoreId> {
        match self {
            TetherError::Transport { core, .. }
            | TetherError::HelperCrash { core }
            | TetherError::Handshake { core, .. }
            | TetherError::Timeout { core, .. }
            | TetherError::UnknownCore(core) => Some(*core),
            TetherError::Security { core, .. } => *core,
            _ => None,
        }
    }

    /// Attach core context to errors raised below the dispatch layer
    pub fn with_core(self, core: CoreId) -> Self {
        match self {
            TetherError::Security { core: None, kind } => TetherError::Security {
                core: Some(core),
                kind,
            },
            other => other,
        }
    }
}

impl From<SecurityError> for TetherError {
    fn from(kind: SecurityError) -> Self {
        TetherError::security(kind)
    }
}

/// Result type for Tether operations
pub type TetherResult<T> = Result<T, TetherError>;
