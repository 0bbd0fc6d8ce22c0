//! Error types for the balancer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration loading and validation errors.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested config file does not exist.
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The config file exists but could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The config file is not valid TOML or has the wrong shape.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A duration value could not be parsed.
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    /// An address is not of the form `host:port`.
    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The backend list is empty.
    #[error("no backends defined")]
    NoBackends,
}

/// Per-session outcomes that end a relay early.
///
/// These never escape the session task; the listener logs them.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every backend in the pool is currently marked down.
    #[error("no healthy backend available")]
    NoHealthyBackend,

    /// Dialing the selected backend failed or timed out.
    #[error("backend dial failed {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Short machine-readable reason, used as a log field.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::NoHealthyBackend => "no_healthy_backend",
            SessionError::Dial { .. } => "backend_dial_failed",
        }
    }
}
