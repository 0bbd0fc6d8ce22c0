//! L4 TCP load balancing.
//!
//! This module provides:
//! - The backend pool and first-healthy selection
//! - Active TCP health checking
//! - The accept loop and per-connection dispatch
//! - Bidirectional relaying with half-close
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> BackendPool::select -> dial -> relay <-> Backend
//!                            ^
//!                      HealthMonitor (every interval, all backends at once)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let proxy = Proxy::new(config);
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! proxy.run(shutdown_rx).await?;
//! ```

mod backend;
mod health;
mod listener;
mod relay;

use std::io;

use tokio::sync::watch;
use tracing::{info, warn};

pub use backend::{Backend, BackendPool};
pub use health::{HealthCheckConfig, HealthMonitor, HealthState, Transition};
pub use listener::{Listener, ListenerConfig, ListenerStats, SessionTracker};
pub use relay::{handle_session, relay, RelayStats};

use crate::config::Config;

/// A configured balancer: one listener, one pool, one health monitor.
#[derive(Debug, Clone)]
pub struct Proxy {
    config: Config,
    pool: BackendPool,
}

impl Proxy {
    /// Build the pool from a validated configuration.
    pub fn new(config: Config) -> Self {
        let pool = BackendPool::new(config.backends.iter().cloned());
        Self { config, pool }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared backend pool.
    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    /// Health monitor timing derived from the configuration.
    pub fn health_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: self.config.healthcheck_interval,
            dial_timeout: self.config.healthcheck_dial_timeout,
        }
    }

    /// Bind the listen socket without starting to accept.
    pub async fn bind(&self) -> io::Result<Listener> {
        Listener::bind(
            ListenerConfig::from(&self.config),
            self.pool.clone(),
            self.health_check_config(),
        )
        .await
    }

    /// Bind, serve until `shutdown` fires, then wait for in-flight sessions
    /// up to the configured drain timeout.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let listener = self.bind().await?;
        let sessions = listener.sessions();

        listener.run(shutdown).await?;

        if sessions.drain(self.config.drain_timeout).await {
            info!("All sessions drained");
        } else {
            warn!(
                active_sessions = sessions.active(),
                "Drain timeout elapsed with sessions still open"
            );
        }

        Ok(())
    }
}
