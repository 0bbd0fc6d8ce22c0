//! Active health checking.
//!
//! A probe is a plain TCP connect under a timeout; the socket is dropped as
//! soon as it opens. Every pass probes all backends concurrently and waits
//! for all of them, so one pass takes at most one probe timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backend::{Backend, BackendPool};

/// Direction of a liveness flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Up,
    Down,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Up => f.write_str("UP"),
            HealthState::Down => f.write_str("DOWN"),
        }
    }
}

/// A backend changed state during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub address: String,
    pub state: HealthState,
}

/// Timing for the health monitor.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Connect timeout for one probe.
    pub dial_timeout: Duration,
}

/// Periodically probes every backend in a pool.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    pool: BackendPool,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(pool: BackendPool, config: HealthCheckConfig) -> Self {
        Self { pool, config }
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// The first pass runs immediately. Shutdown is only observed between
    /// passes; a pass in progress always completes.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        self.schedule(Instant::now(), shutdown).await
    }

    /// Like [`run`](Self::run), for a caller that has already completed the
    /// first pass: the next pass runs one interval from now.
    pub async fn run_after_first_pass(self, shutdown: watch::Receiver<bool>) {
        let start = Instant::now() + self.config.interval;
        self.schedule(start, shutdown).await
    }

    async fn schedule(self, start: Instant, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            dial_timeout_ms = self.config.dial_timeout.as_millis() as u64,
            backends = self.pool.len(),
            "Starting health monitor"
        );

        let mut ticker = interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Health monitor shutting down");
    }

    /// Probe every backend once, concurrently, and return the flips.
    pub async fn check_all(&self) -> Vec<Transition> {
        let mut probes = JoinSet::new();

        for backend in self.pool.backends() {
            let backend = Arc::clone(backend);
            let dial_timeout = self.config.dial_timeout;
            probes.spawn(async move { probe(&backend, dial_timeout).await });
        }

        let mut transitions = Vec::new();
        while let Some(result) = probes.join_next().await {
            match result {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Health probe task failed"),
            }
        }

        debug!(
            backends = self.pool.len(),
            transitions = transitions.len(),
            "Health check pass complete"
        );

        transitions
    }
}

/// Probe one backend and update its flag.
async fn probe(backend: &Backend, dial_timeout: Duration) -> Option<Transition> {
    let reachable = match backend.connect(dial_timeout).await {
        Ok(stream) => {
            drop(stream);
            true
        }
        Err(e) => {
            debug!(backend = %backend, error = %e, "Health probe failed");
            false
        }
    };

    let was_healthy = backend.set_healthy(reachable).await;
    if was_healthy == reachable {
        return None;
    }

    let state = if reachable {
        info!(backend = %backend, "Backend UP");
        HealthState::Up
    } else {
        warn!(backend = %backend, "Backend DOWN");
        HealthState::Down
    };

    Some(Transition {
        address: backend.address().to_string(),
        state,
    })
}
