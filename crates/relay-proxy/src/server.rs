//! The relay's gRPC listener.
//!
//! Plain TCP accept loop serving each connection over h2c, which is all gRPC
//! needs. Every connection is registered with a graceful-shutdown watcher:
//! on cancellation the listener stops accepting, in-flight RPCs drain, and
//! new connections are refused.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proxy::Proxy;

/// Ping an idle client every 5s; drop the connection after 1s without an ack.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {addr}: {source}")]
    Addr {
        addr: String,
        source: std::net::AddrParseError,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// gRPC listener that hands every request to the proxy.
pub struct GrpcServer {
    addr: String,
    proxy: Arc<Proxy>,
}

impl GrpcServer {
    pub fn new(host: &str, port: u16, proxy: Arc<Proxy>) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            proxy,
        }
    }

    /// Serve until `shutdown` is cancelled, then drain in-flight RPCs.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let addr: SocketAddr = self.addr.parse().map_err(|source| ServerError::Addr {
            addr: self.addr.clone(),
            source,
        })?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(%addr, "starting grpc server");

        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(%remote, "accepted connection");

                    let proxy = Arc::clone(&self.proxy);
                    let service = service_fn(move |request| {
                        let proxy = Arc::clone(&proxy);
                        async move { proxy.handle(request).await }
                    });

                    let mut builder = http2::Builder::new(TokioExecutor::new());
                    builder
                        .timer(TokioTimer::new())
                        .keep_alive_interval(Some(KEEPALIVE_INTERVAL))
                        .keep_alive_timeout(KEEPALIVE_TIMEOUT);

                    let connection = builder.serve_connection(TokioIo::new(stream), service);
                    let watched = graceful.watch(connection);
                    tokio::spawn(async move {
                        if let Err(err) = watched.await {
                            debug!(error = %err, "connection closed with error");
                        }
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }

        info!("stopping grpc server");
        drop(listener);
        graceful.shutdown().await;
        info!("grpc server stopped");
        Ok(())
    }
}
