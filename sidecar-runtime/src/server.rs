//! Loopback listener for the credential API.
//!
//! The server runs on its own task and owns every connection task in a
//! `JoinSet`. Shutdown is a single-use broadcast: once sent, the listener
//! stops accepting and open connections are asked to finish their current
//! request. If the grace period elapses first the serving task is aborted,
//! which drops the set and closes every remaining connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Result, SidecarError};

/// How a shutdown finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight request completed within the grace period.
    Drained,
    /// The grace period elapsed and remaining connections were closed.
    Abandoned,
}

pub struct TokenServer {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    /// `None` once the serving task has been observed to finish.
    handle: Option<JoinHandle<io::Result<()>>>,
}

impl TokenServer {
    /// Bind `127.0.0.1:{port}` and start serving `router`.
    pub async fn start(port: u16, router: Router) -> Result<Self> {
        Self::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), router).await
    }

    /// Bind `addr` and start serving. Only loopback addresses are accepted;
    /// the function in this sandbox is the only intended caller.
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self> {
        if !addr.ip().is_loopback() {
            return Err(SidecarError::Bind(format!(
                "Refusing to bind non-loopback address {addr}"
            )));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| SidecarError::Bind(format!("Failed to bind {addr}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| SidecarError::Bind(format!("Failed to read bound address: {err}")))?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(serve(listener, router, shutdown_rx));

        info!(%local_addr, "Credential service listening");
        Ok(Self {
            local_addr,
            shutdown_tx,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves only if the serving task exits without being asked to, and
    /// returns a description of why. Cancel-safe.
    pub async fn stopped(&mut self) -> String {
        let Some(handle) = self.handle.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        self.handle = None;
        match result {
            Ok(Ok(())) => "listener exited".to_string(),
            Ok(Err(err)) => format!("listener failed: {err}"),
            Err(err) => format!("listener task failed: {err}"),
        }
    }

    /// Stop accepting connections and wait up to `grace` for in-flight
    /// requests. After `grace` the serving task is aborted and every
    /// connection still open is closed before this returns.
    pub async fn shutdown(mut self, grace: Duration) -> DrainOutcome {
        let _ = self.shutdown_tx.send(());
        let Some(mut handle) = self.handle.take() else {
            return DrainOutcome::Drained;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(Ok(()))) => {
                info!("Credential service drained");
                DrainOutcome::Drained
            }
            Ok(Ok(Err(err))) => {
                warn!("Credential service exited with error during drain: {err}");
                DrainOutcome::Drained
            }
            Ok(Err(err)) => {
                warn!("Credential service task failed during drain: {err}");
                DrainOutcome::Drained
            }
            Err(_) => {
                // The connection set lives inside the serving task; once the
                // aborted task is joined the set has been dropped.
                handle.abort();
                let _ = handle.await;
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Grace period elapsed, abandoning in-flight requests"
                );
                DrainOutcome::Abandoned
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn abort_handle(&self) -> Option<tokio::task::AbortHandle> {
        self.handle.as_ref().map(JoinHandle::abort_handle)
    }
}

/// Accept loop. Returns once shutdown was requested and every connection
/// has finished, or with an error if the listener itself fails.
async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> io::Result<()> {
    let (drain_tx, drain_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        router.clone(),
                        drain_rx.clone(),
                    ));
                }
                Err(err) if is_connection_error(&err) => {
                    debug!("Dropped incoming connection: {err}");
                }
                Err(err) => return Err(err),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    let _ = drain_tx.send(true);
    while connections.join_next().await.is_some() {}
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    mut drain_rx: watch::Receiver<bool>,
) {
    let service = TowerToHyperService::new(router);
    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(err) = result {
                debug!(%peer, "Connection ended with error: {err}");
            }
        }
        _ = drain_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            if let Err(err) = conn.await {
                debug!(%peer, "Connection ended with error while draining: {err}");
            }
        }
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::net::IpAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn slow_router(delay: Duration) -> Router {
        Router::new().route(
            "/slow",
            get(move || async move {
                tokio::time::sleep(delay).await;
                "done"
            }),
        )
    }

    #[tokio::test]
    async fn binds_loopback_only() {
        let server = TokenServer::start(0, Router::new()).await.unwrap();
        assert!(server.local_addr().ip().is_loopback());
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.shutdown(Duration::from_secs(1)).await, DrainOutcome::Drained);

        let public = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0);
        let err = TokenServer::bind(public, Router::new()).await.err().unwrap();
        assert!(matches!(err, SidecarError::Bind(_)));
    }

    #[tokio::test]
    async fn port_in_use_is_bind_error() {
        let first = TokenServer::start(0, Router::new()).await.unwrap();
        let port = first.local_addr().port();

        let err = TokenServer::start(port, Router::new()).await.err().unwrap();
        assert!(matches!(err, SidecarError::Bind(_)));
        assert!(err.is_fatal());
        first.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn idle_server_drains_immediately() {
        let server = TokenServer::start(0, slow_router(Duration::from_millis(10)))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        assert_eq!(server.shutdown(Duration::from_secs(5)).await, DrainOutcome::Drained);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn idle_keep_alive_connection_does_not_block_drain() {
        let server = TokenServer::start(0, slow_router(Duration::from_millis(10)))
            .await
            .unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

        let started = std::time::Instant::now();
        assert_eq!(server.shutdown(Duration::from_secs(5)).await, DrainOutcome::Drained);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn abandoned_connection_is_closed() {
        let server = TokenServer::start(0, slow_router(Duration::from_secs(30)))
            .await
            .unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            server.shutdown(Duration::from_millis(100)).await,
            DrainOutcome::Abandoned
        );

        // The peer sees EOF or a reset, never a response.
        let mut buf = [0u8; 256];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("connection should be closed promptly");
        match read {
            Ok(n) => assert_eq!(n, 0, "unexpected response after abandon"),
            Err(_) => {}
        }
    }
}
