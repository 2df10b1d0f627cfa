//! Per-connection HTTP handler.
//!
//! Serves HTTP/1.1 on a single accepted client socket, handing each request
//! to the [`ForwardingExecutor`] and writing one access-log line per
//! request. A shutdown signal lets in-flight requests finish before the
//! connection closes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, Request, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, instrument};

use crate::error::{ProxyError, Result};
use crate::forward::ForwardingExecutor;

/// Handles requests for a single client connection.
pub struct ConnectionHandler {
    executor: Arc<ForwardingExecutor>,
    peer: SocketAddr,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ConnectionHandler {
    #[must_use]
    pub fn new(
        executor: Arc<ForwardingExecutor>,
        peer: SocketAddr,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            executor,
            peer,
            shutdown_rx,
        }
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Serve the connection until the client closes it or shutdown is
    /// signalled.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP connection fails at the protocol level.
    #[instrument(skip(self, stream), fields(peer = %self.peer))]
    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        debug!("client connected");

        let executor = self.executor;
        let peer = self.peer;
        let service = service_fn(move |request: Request<Incoming>| {
            let executor = Arc::clone(&executor);
            async move {
                let method = request.method().clone();
                let path = request.uri().path().to_string();
                let query = request.uri().query().map(str::to_string);
                let started = Instant::now();

                let response = executor.handle(request, Some(peer)).await;

                access_log(&AccessEntry {
                    method: &method,
                    path: &path,
                    query: query.as_deref(),
                    status: response.status(),
                    latency: started.elapsed(),
                    peer,
                });
                Ok::<_, Infallible>(response)
            }
        });

        let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
        tokio::pin!(conn);

        let mut draining = false;
        let result = loop {
            tokio::select! {
                result = conn.as_mut() => break result,
                _ = self.shutdown_rx.recv(), if !draining => {
                    debug!("shutdown signal received, draining connection");
                    conn.as_mut().graceful_shutdown();
                    draining = true;
                }
            }
        };

        result.map_err(|e| ProxyError::Connection(std::io::Error::other(e)))?;
        debug!("client disconnected");
        Ok(())
    }
}

struct AccessEntry<'a> {
    method: &'a Method,
    path: &'a str,
    query: Option<&'a str>,
    status: StatusCode,
    latency: Duration,
    peer: SocketAddr,
}

/// One line per request. Error statuses are logged at error level so they
/// survive the default filter.
fn access_log(entry: &AccessEntry<'_>) {
    let latency_ms = entry.latency.as_secs_f64() * 1000.0;
    let query = entry.query.unwrap_or("");

    if entry.status.as_u16() >= 400 {
        error!(
            method = %entry.method,
            path = entry.path,
            query,
            status = entry.status.as_u16(),
            latency_ms,
            client_ip = %entry.peer.ip(),
            "request"
        );
    } else {
        debug!(
            method = %entry.method,
            path = entry.path,
            query,
            status = entry.status.as_u16(),
            latency_ms,
            client_ip = %entry.peer.ip(),
            "request"
        );
    }
}
