//! TCP listener and connection dispatch.
//!
//! The listener owns the accept socket. It completes one health check pass
//! and starts the health monitor before accepting. Every connection gets its
//! own task, and accepting stops when the shutdown signal fires. Sessions
//! already running are left to finish on their own; [`SessionTracker`] lets
//! the caller wait for them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::backend::BackendPool;
use super::health::{HealthCheckConfig, HealthMonitor};
use super::relay::handle_session;
use crate::config::{Config, DEFAULT_BACKEND_DIAL_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
use crate::error::SessionError;

/// Pause after an accept error so a persistent failure does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to (`host:port`).
    pub bind_addr: String,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Timeout for dialing the selected backend.
    pub backend_dial_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            backend_dial_timeout: DEFAULT_BACKEND_DIAL_TIMEOUT,
        }
    }
}

impl From<&Config> for ListenerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.listen_addr.clone(),
            max_connections: config.max_connections,
            backend_dial_timeout: config.backend_dial_timeout,
        }
    }
}

/// Counters for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished, successfully or not.
    pub connections_closed: AtomicU64,
    /// Connections refused because the session limit was reached.
    pub connections_rejected: AtomicU64,
    /// Sessions closed because no backend was healthy.
    pub no_healthy_backend: AtomicU64,
    /// Backend dials that failed.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

/// Handle for observing and draining in-flight sessions.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    permits: Arc<Semaphore>,
    capacity: u32,
    stats: Arc<ListenerStats>,
}

impl SessionTracker {
    /// Number of sessions currently running.
    pub fn active(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.permits.available_permits())
    }

    /// Listener counters.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Wait until no session is running.
    pub async fn wait_idle(&self) {
        // Holding every permit means no session holds one.
        if let Ok(all) = self.permits.acquire_many(self.capacity).await {
            drop(all);
        }
    }

    /// Wait for in-flight sessions, giving up after `limit`.
    ///
    /// Returns `true` if all sessions finished in time.
    pub async fn drain(&self, limit: Duration) -> bool {
        let active = self.active();
        if active == 0 {
            return true;
        }

        info!(active, timeout_ms = limit.as_millis() as u64, "Draining sessions");
        tokio::time::timeout(limit, self.wait_idle()).await.is_ok()
    }
}

/// The accept loop for the balancer.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    pool: BackendPool,
    monitor: HealthMonitor,
    sessions: SessionTracker,
}

impl Listener {
    /// Bind the listen socket. Failure here is fatal for the process.
    pub async fn bind(
        config: ListenerConfig,
        pool: BackendPool,
        health: HealthCheckConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr.as_str()).await?;
        let local_addr = listener.local_addr()?;

        let capacity = config
            .max_connections
            .clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));

        info!(
            bind_addr = %local_addr,
            max_connections = capacity,
            "Listener bound"
        );

        Ok(Self {
            sessions: SessionTracker {
                permits: Arc::new(Semaphore::new(capacity)),
                capacity: capacity as u32,
                stats: Arc::new(ListenerStats::default()),
            },
            monitor: HealthMonitor::new(pool.clone(), health),
            listener,
            pool,
            config,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for the sessions this listener spawns.
    pub fn sessions(&self) -> SessionTracker {
        self.sessions.clone()
    }

    /// Run one health check pass, start the monitor, then accept until
    /// `shutdown` fires.
    ///
    /// The first pass is bounded by one probe timeout; connections that
    /// arrive meanwhile wait in the accept backlog.
    ///
    /// On shutdown the socket is closed and this returns `Ok(())` once the
    /// monitor has stopped. Running sessions are not interrupted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");
        for (index, backend) in self.pool.backends().iter().enumerate() {
            info!(position = index + 1, backend = %backend, "Backend configured");
        }

        // Accepting starts only after one completed pass.
        self.monitor.check_all().await;
        let healthy = self.pool.healthy_count().await;
        info!(
            healthy = healthy,
            backends = self.pool.len(),
            "Initial health check complete"
        );

        let monitor = tokio::spawn(
            self.monitor
                .clone()
                .run_after_first_pass(shutdown.clone()),
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => self.dispatch(stream, peer_addr),
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(self.listener);
        info!(
            bind_addr = %local_addr,
            active_sessions = self.sessions.active(),
            "Listener stopped accepting"
        );

        if let Err(e) = monitor.await {
            error!(error = %e, "Health monitor task failed");
        }

        Ok(())
    }

    /// Spawn a session task for an accepted connection.
    fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match Arc::clone(&self.sessions.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.sessions
                    .stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        let stats = Arc::clone(&self.sessions.stats);
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let pool = self.pool.clone();
        let dial_timeout = self.config.backend_dial_timeout;

        tokio::spawn(
            async move {
                match handle_session(stream, peer_addr, &pool, dial_timeout).await {
                    Ok(relayed) => {
                        stats
                            .bytes_to_backend
                            .fetch_add(relayed.bytes_to_backend, Ordering::Relaxed);
                        stats
                            .bytes_from_backend
                            .fetch_add(relayed.bytes_from_backend, Ordering::Relaxed);
                    }
                    Err(e) => {
                        match e {
                            SessionError::NoHealthyBackend => {
                                stats.no_healthy_backend.fetch_add(1, Ordering::Relaxed);
                            }
                            SessionError::Dial { .. } => {
                                stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        debug!(reason = e.reason_code(), error = %e, "Session ended early");
                    }
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }
}
