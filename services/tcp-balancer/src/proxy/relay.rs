//! Per-connection relay.
//!
//! A session picks the first healthy backend, dials it, then pumps bytes in
//! both directions until both sides have finished. Each direction runs as
//! its own task and half-closes its destination when its source hits EOF,
//! so a client that finishes sending can still receive the full response.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn, Instrument};

use super::backend::BackendPool;
use crate::error::SessionError;

/// Read buffer size for each copy direction.
const COPY_BUFFER_SIZE: usize = 8192;

/// Bytes moved during one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Serve one accepted client connection end to end.
///
/// Returns early, closing the client, when no backend is healthy or the
/// dial fails. A failed dial marks that backend down immediately instead
/// of waiting for the next health check.
pub async fn handle_session(
    client: TcpStream,
    peer_addr: SocketAddr,
    pool: &BackendPool,
    dial_timeout: Duration,
) -> Result<RelayStats, SessionError> {
    let Some(backend) = pool.select().await else {
        warn!(peer_addr = %peer_addr, "No healthy backend");
        return Err(SessionError::NoHealthyBackend);
    };

    let upstream = match backend.connect(dial_timeout).await {
        Ok(stream) => stream,
        Err(source) => {
            warn!(
                peer_addr = %peer_addr,
                backend = %backend,
                error = %source,
                "Backend connect failed"
            );
            backend.mark_unhealthy().await;
            return Err(SessionError::Dial {
                addr: backend.address().to_string(),
                source,
            });
        }
    };

    info!(peer_addr = %peer_addr, backend = %backend, "Connection opened");

    let stats = relay(client, upstream).await;

    info!(
        peer_addr = %peer_addr,
        backend = %backend,
        bytes_to_backend = stats.bytes_to_backend,
        bytes_from_backend = stats.bytes_from_backend,
        "Connection closed"
    );

    Ok(stats)
}

/// Copy bytes both ways until both directions finish.
///
/// Both sockets are closed when this returns.
pub async fn relay(client: TcpStream, backend: TcpStream) -> RelayStats {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let to_backend = tokio::spawn(
        copy_half(client_read, backend_write, "client_to_backend").in_current_span(),
    );
    let from_backend = tokio::spawn(
        copy_half(backend_read, client_write, "backend_to_client").in_current_span(),
    );

    let (to_backend, from_backend) = tokio::join!(to_backend, from_backend);

    RelayStats {
        bytes_to_backend: to_backend.unwrap_or_else(|e| {
            warn!(error = %e, "client_to_backend task failed");
            0
        }),
        bytes_from_backend: from_backend.unwrap_or_else(|e| {
            warn!(error = %e, "backend_to_client task failed");
            0
        }),
    }
}

/// Copy one direction until EOF or error, then shut down the writer.
///
/// Errors end this direction only.
async fn copy_half<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!(direction, error = %e, "Write failed");
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                debug!(direction, error = %e, "Read failed");
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(direction, error = %e, "Shutdown failed");
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn copy_half_moves_all_bytes_and_half_closes() {
        let (mut src_peer, src) = duplex(64);
        let (dst, mut dst_peer) = duplex(64);

        let payload: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            src_peer.write_all(&payload).await.unwrap();
            src_peer.shutdown().await.unwrap();
        });
        let copier = tokio::spawn(copy_half(src, dst, "test"));

        let mut received = Vec::new();
        dst_peer.read_to_end(&mut received).await.unwrap();

        writer.await.unwrap();
        assert_eq!(copier.await.unwrap(), expected.len() as u64);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn copy_half_stops_when_destination_is_gone() {
        let (mut src_peer, src) = duplex(64);
        let (dst, dst_peer) = duplex(64);
        drop(dst_peer);

        src_peer.write_all(b"hello").await.unwrap();
        drop(src_peer);

        let copied = copy_half(src, dst, "test").await;
        assert_eq!(copied, 0);
    }

    #[tokio::test]
    async fn handle_session_without_healthy_backend_closes_client() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(TcpStream::connect(addr));
        let (accepted, peer) = listener.accept().await.unwrap();
        let mut client = client.await.unwrap().unwrap();

        let pool = BackendPool::new(["127.0.0.1:1"]);
        let result = handle_session(accepted, peer, &pool, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SessionError::NoHealthyBackend)));

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
