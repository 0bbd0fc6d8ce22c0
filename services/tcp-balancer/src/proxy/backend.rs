//! Backend records and the backend pool.
//!
//! The pool is built once from configuration and never changes shape.
//! Each backend carries its own liveness flag behind an independent
//! reader/writer lock, so the health monitor and the session tasks can
//! touch different backends without contending.
//!
//! Selection is "first healthy backend in configured order".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A single upstream server.
#[derive(Debug)]
pub struct Backend {
    address: String,
    healthy: RwLock<bool>,
}

impl Backend {
    /// Create a backend. Backends start unhealthy until the first probe.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            healthy: RwLock::new(false),
        }
    }

    /// The `host:port` this backend is dialed at.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current liveness.
    pub async fn is_healthy(&self) -> bool {
        *self.healthy.read().await
    }

    /// Set liveness and return the previous value.
    ///
    /// The swap happens under one write lock, so concurrent writers each see
    /// a distinct previous value and a flip is observed exactly once.
    pub async fn set_healthy(&self, healthy: bool) -> bool {
        let mut state = self.healthy.write().await;
        std::mem::replace(&mut *state, healthy)
    }

    /// Dial this backend, bounded by `connect_timeout`.
    pub async fn connect(&self, connect_timeout: Duration) -> std::io::Result<TcpStream> {
        debug!(backend = %self.address, "Connecting to backend");

        match timeout(connect_timeout, TcpStream::connect(self.address.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timeout",
            )),
        }
    }

    /// Mark the backend down after a failed dial.
    ///
    /// Returns `true` if this call flipped it from healthy.
    pub async fn mark_unhealthy(&self) -> bool {
        let was_healthy = self.set_healthy(false).await;
        if was_healthy {
            warn!(backend = %self.address, "Backend DOWN");
        }
        was_healthy
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Fixed, ordered set of backends.
#[derive(Debug, Clone)]
pub struct BackendPool {
    backends: Arc<[Arc<Backend>]>,
}

impl BackendPool {
    /// Build a pool from addresses in selection order.
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: addresses
                .into_iter()
                .map(|addr| Arc::new(Backend::new(addr)))
                .collect(),
        }
    }

    /// Number of backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the pool has no backends.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// All backends in configured order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Return the first healthy backend in configured order.
    ///
    /// The flag may flip right after this returns; callers handle a failed
    /// dial instead of relying on the snapshot.
    pub async fn select(&self) -> Option<Arc<Backend>> {
        for backend in self.backends.iter() {
            if backend.is_healthy().await {
                return Some(Arc::clone(backend));
            }
        }
        None
    }

    /// Number of backends currently marked healthy.
    pub async fn healthy_count(&self) -> usize {
        let mut count = 0;
        for backend in self.backends.iter() {
            if backend.is_healthy().await {
                count += 1;
            }
        }
        count
    }
}
