//! TCP listener for inbound HTTP clients.
//!
//! The listener accepts connections and spawns a task for each one,
//! delegating to the connection handler for request processing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ListenConfig;
use crate::error::{ProxyError, Result};
use crate::forward::ForwardingExecutor;
use crate::metrics::ProxyMetrics;

use super::connection::ConnectionHandler;

/// How long `run` waits for in-flight connections after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Accepts client connections and serves them through the executor.
pub struct ProxyListener {
    listener: TcpListener,
    executor: Arc<ForwardingExecutor>,
    metrics: Option<Arc<ProxyMetrics>>,
    max_connections: usize,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
}

impl ProxyListener {
    /// Bind the listen address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(config: &ListenConfig, executor: Arc<ForwardingExecutor>) -> Result<Self> {
        let listener = TcpListener::bind(&config.address).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            executor,
            metrics: None,
            max_connections: config.max_connections,
            shutdown_tx,
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Track open client connections in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The bound address; useful when binding port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get a shutdown handle to signal the listener to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Run the listener, accepting connections until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the bound socket has no local address.
    #[instrument(skip(self), fields(address = %self.local_addr()?))]
    pub async fn run(&self) -> Result<()> {
        info!("proxy listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let current = self.active_connections.load(Ordering::Relaxed);

                            if current >= self.max_connections {
                                warn!(
                                    peer = %addr,
                                    active = current,
                                    max = self.max_connections,
                                    "connection rejected: limit reached"
                                );
                                continue;
                            }

                            self.active_connections.fetch_add(1, Ordering::Relaxed);
                            debug!(peer = %addr, active = current + 1, "accepted connection");

                            let handler = ConnectionHandler::new(
                                Arc::clone(&self.executor),
                                addr,
                                self.shutdown_tx.subscribe(),
                            );
                            let active_connections = Arc::clone(&self.active_connections);
                            let metrics = self.metrics.clone();
                            if let Some(m) = &metrics {
                                m.inc_client_connections();
                            }

                            tokio::spawn(async move {
                                if let Err(e) = handler.handle(socket).await {
                                    match &e {
                                        ProxyError::Connection(io_err)
                                            if io_err.kind() == std::io::ErrorKind::UnexpectedEof =>
                                        {
                                            debug!(peer = %addr, "client disconnected");
                                        }
                                        _ => {
                                            debug!(peer = %addr, error = %e, "connection error");
                                        }
                                    }
                                }
                                active_connections.fetch_sub(1, Ordering::Relaxed);
                                if let Some(m) = &metrics {
                                    m.dec_client_connections();
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&self) {
        let active = self.active_connections();
        if active == 0 {
            return;
        }

        info!(active, "waiting for connections to close");
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.active_connections() > 0 {
            if Instant::now() >= deadline {
                warn!(
                    active = self.active_connections(),
                    "drain timeout elapsed, abandoning connections"
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        debug!("all connections closed");
    }
}
