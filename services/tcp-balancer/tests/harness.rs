//! Test harness for balancer integration tests.
//!
//! Provides helpers to spawn TCP echo backends, a running balancer, and
//! addresses that are guaranteed to refuse connections.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use tcp_balancer::{BackendPool, Config, HealthCheckConfig, Proxy, SessionTracker};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Connections accepted so far. Health probes count too.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running balancer bound to an ephemeral loopback port.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub pool: BackendPool,
    pub sessions: SessionTracker,
    shutdown_tx: watch::Sender<bool>,
    run: JoinHandle<io::Result<()>>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(backends: &[SocketAddr], health: HealthCheckConfig) -> io::Result<Self> {
        let mut config = Config::new(
            "127.0.0.1:0",
            backends.iter().map(ToString::to_string).collect(),
        );
        config.healthcheck_interval = health.interval;
        config.healthcheck_dial_timeout = health.dial_timeout;
        config.backend_dial_timeout = Duration::from_secs(1);

        let proxy = Proxy::new(config);
        let listener = proxy.bind().await?;
        let listen_addr = listener.local_addr()?;
        let sessions = listener.sessions();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(listener.run(shutdown_rx));

        Ok(Self {
            listen_addr,
            pool: proxy.pool().clone(),
            sessions,
            shutdown_tx,
            run,
        })
    }

    /// Signal shutdown and wait for the accept loop to return.
    pub async fn shutdown(self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.run.await.map_err(io::Error::other)?
    }
}

/// Health timing for tests: fast probes, configurable interval.
#[allow(dead_code)]
pub fn health(interval: Duration) -> HealthCheckConfig {
    HealthCheckConfig {
        interval,
        dial_timeout: Duration::from_millis(200),
    }
}

/// An address nothing is listening on.
#[allow(dead_code)]
pub fn dead_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// A loopback address whose connects hang until the caller's timeout.
///
/// The listener never accepts and its queue is filled, so the kernel drops
/// further SYNs. Keep the value alive for as long as the address is used.
#[allow(dead_code)]
pub struct Blackhole {
    pub addr: SocketAddr,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

#[allow(dead_code)]
impl Blackhole {
    pub async fn spawn() -> io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::from(([127, 0, 0, 1], 0)))?;
        let listener = socket.listen(1)?;
        let addr = listener.local_addr()?;

        let mut queued = Vec::new();
        for _ in 0..64 {
            match tokio::time::timeout(Duration::from_millis(100), TcpStream::connect(addr)).await
            {
                Ok(stream) => queued.push(stream?),
                // Queue full: this connect never completed.
                Err(_) => {
                    return Ok(Self {
                        addr,
                        _listener: listener,
                        _queued: queued,
                    })
                }
            }
        }

        Err(io::Error::other("accept queue never filled"))
    }
}

/// Poll until backend `index` reaches `healthy`, or panic after TEST_TIMEOUT.
#[allow(dead_code)]
pub async fn wait_for_health(pool: &BackendPool, index: usize, healthy: bool) {
    let backend = Arc::clone(&pool.backends()[index]);
    tokio::time::timeout(TEST_TIMEOUT, async {
        while backend.is_healthy().await != healthy {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("backend {} never became healthy={}", backend, healthy));
}
