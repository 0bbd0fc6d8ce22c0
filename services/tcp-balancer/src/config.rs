//! Balancer configuration.
//!
//! Configuration comes from a TOML file with `[server]`, `[timeouts]` and
//! `[backends]` tables. The listen address and backend list can be overridden
//! from the command line, in which case the file becomes optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Config file used when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Default listen address (all interfaces).
pub const DEFAULT_LISTEN_ADDR: &str = ":25565";

/// Default timeout for dialing a backend on behalf of a client.
pub const DEFAULT_BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for a single health probe.
pub const DEFAULT_HEALTHCHECK_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default interval between health check passes.
pub const DEFAULT_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Default time to wait for in-flight sessions on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest duration accepted for any timeout or interval.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Default maximum concurrent client sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Validated balancer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address to listen on, normalized to `host:port`.
    pub listen_addr: String,

    /// Maximum concurrent client sessions.
    pub max_connections: usize,

    /// Timeout for dialing the selected backend.
    pub backend_dial_timeout: Duration,

    /// Timeout for each health probe connect.
    pub healthcheck_dial_timeout: Duration,

    /// Interval between health check passes.
    pub healthcheck_interval: Duration,

    /// How long shutdown waits for in-flight sessions.
    pub drain_timeout: Duration,

    /// Backend addresses in selection order.
    pub backends: Vec<String>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub backends: Option<Vec<String>>,
}

impl Overrides {
    /// Parse a comma-separated backend list, trimming blanks.
    pub fn parse_backend_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    backends: RawBackends,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    listen: Option<String>,
    max_connections: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTimeouts {
    backend_dial: Option<RawDuration>,
    healthcheck_dial: Option<RawDuration>,
    healthcheck_interval: Option<RawDuration>,
    drain: Option<RawDuration>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBackends {
    #[serde(default)]
    servers: Vec<String>,
}

/// A duration as written in the file: `"5s"` or a bare number of seconds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn resolve(&self) -> Result<Duration, ConfigError> {
        match self {
            RawDuration::Seconds(secs) => {
                check_ceiling(&secs.to_string(), Duration::from_secs(*secs))
            }
            RawDuration::Text(text) => parse_duration(text),
        }
    }
}

impl Config {
    /// Build a config with default timeouts.
    pub fn new(listen_addr: impl Into<String>, backends: Vec<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backend_dial_timeout: DEFAULT_BACKEND_DIAL_TIMEOUT,
            healthcheck_dial_timeout: DEFAULT_HEALTHCHECK_DIAL_TIMEOUT,
            healthcheck_interval: DEFAULT_HEALTHCHECK_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            backends,
        }
    }

    /// Load configuration from a file, applying overrides and defaults.
    ///
    /// With `path == None`, `config.toml` in the working directory is used if
    /// present. A missing file is only tolerated when the overrides supply
    /// the backend list.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) => read_raw(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    read_raw(default_path)?
                } else if overrides.backends.is_some() {
                    RawConfig::default()
                } else {
                    return Err(ConfigError::NotFound(default_path.to_path_buf()));
                }
            }
        };

        Self::from_raw(raw, overrides)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(contents: &str, overrides: Overrides) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(contents)?;
        Self::from_raw(raw, overrides)
    }

    fn from_raw(raw: RawConfig, overrides: Overrides) -> Result<Self, ConfigError> {
        let listen = overrides
            .listen
            .or(raw.server.listen)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = normalize_listen_addr(&listen)?;

        let max_connections = raw
            .server
            .max_connections
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let timeouts = &raw.timeouts;
        let backend_dial_timeout =
            duration_or_default(&timeouts.backend_dial, DEFAULT_BACKEND_DIAL_TIMEOUT)?;
        let healthcheck_dial_timeout =
            duration_or_default(&timeouts.healthcheck_dial, DEFAULT_HEALTHCHECK_DIAL_TIMEOUT)?;
        let healthcheck_interval =
            duration_or_default(&timeouts.healthcheck_interval, DEFAULT_HEALTHCHECK_INTERVAL)?;
        let drain_timeout = duration_or_default(&timeouts.drain, DEFAULT_DRAIN_TIMEOUT)?;

        let backends: Vec<String> = overrides
            .backends
            .unwrap_or(raw.backends.servers)
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        for backend in &backends {
            validate_backend_addr(backend)?;
        }

        Ok(Self {
            listen_addr,
            max_connections,
            backend_dial_timeout,
            healthcheck_dial_timeout,
            healthcheck_interval,
            drain_timeout,
            backends,
        })
    }
}

fn read_raw(path: &Path) -> Result<RawConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: PathBuf::from(path),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

// Zero means "not set", matching how omitted values behave.
fn duration_or_default(
    value: &Option<RawDuration>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        Some(raw) => {
            let parsed = raw.resolve()?;
            Ok(if parsed.is_zero() { default } else { parsed })
        }
        None => Ok(default),
    }
}

/// Parse a duration such as `"5s"`, `"250ms"`, `"1m30s"` or `"10"` (seconds).
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let text = value.trim();
    if text.is_empty() {
        return Err(invalid("empty"));
    }
    if let Ok(secs) = text.parse::<u64>() {
        return check_ceiling(value, Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(invalid("expected a number"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("number out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit (use ms, s, m or h)")),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| invalid("too large"))?;
    }

    check_ceiling(value, total)
}

fn check_ceiling(value: &str, duration: Duration) -> Result<Duration, ConfigError> {
    if duration > MAX_DURATION {
        return Err(ConfigError::InvalidDuration {
            value: value.to_string(),
            reason: "exceeds 365 days".to_string(),
        });
    }
    Ok(duration)
}

/// Normalize a listen address. A bare `:port` binds all IPv4 interfaces.
pub fn normalize_listen_addr(addr: &str) -> Result<String, ConfigError> {
    let addr = addr.trim();
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    split_host_port(&normalized)?;
    Ok(normalized)
}

/// Check that a backend address is `host:port` with a non-empty host.
pub fn validate_backend_addr(addr: &str) -> Result<(), ConfigError> {
    let (host, _) = split_host_port(addr)?;
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress {
            addr: addr.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

fn split_host_port(addr: &str) -> Result<(&str, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("port must be a number"))?;
    Ok((host, port))
}
