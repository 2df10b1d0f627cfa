//! Test harness for integration testing of the SPNEGO proxy.
//!
//! Provides a complete test environment with:
//! - Mock Kerberos-protected backend
//! - Scripted Kerberos library
//! - A running proxy listener wired to both
//! - Helper methods for sending requests through the proxy

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{AuthConfig, ListenConfig, ProxyConfig, TargetConfig};
use crate::context::ContextCache;
use crate::error::Result;
use crate::forward::ForwardingExecutor;
use crate::identity::{IdentityStore, RenewalPolicy};
use crate::metrics::ProxyMetrics;
use crate::network::ProxyListener;
use crate::spn::{Spn, SpnResolver};

use super::mock_backend::{MockBackend, ResponseGenerator};
use super::mock_kerberos::MockKerberos;

/// A response received through the proxy, body fully read.
#[derive(Debug, Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Test harness for integration testing.
pub struct ProxyTestHarness {
    /// The mock backend
    pub backend: MockBackend,
    /// The scripted Kerberos library
    pub kerberos: Arc<MockKerberos>,
    /// The identity store (logged in against the mock)
    pub identity: Arc<IdentityStore>,
    /// The executor behind the listener
    pub executor: Arc<ForwardingExecutor>,
    pub metrics: Arc<ProxyMetrics>,
    /// Test configuration
    pub config: ProxyConfig,
    proxy_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    listener_task: JoinHandle<Result<()>>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl ProxyTestHarness {
    /// Create a new test harness with default configuration.
    pub async fn new() -> Self {
        TestHarnessBuilder::new().build().await
    }

    /// Address the proxy listens on.
    #[must_use]
    pub fn proxy_address(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Absolute proxy URL for `path_and_query`.
    #[must_use]
    pub fn proxy_url(&self, path_and_query: &str) -> String {
        format!("http://{}{path_and_query}", self.proxy_addr)
    }

    /// The SPN the proxy uses for the backend.
    #[must_use]
    pub fn backend_spn(&self) -> Spn {
        let base = self
            .config
            .target
            .base_uri()
            .expect("harness target url is valid");
        SpnResolver::new(&self.config.auth).resolve(base.host().unwrap_or_default())
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ContextCache> {
        self.executor.cache()
    }

    /// Replace the backend's response generator.
    pub async fn set_backend_handler(&self, handler: ResponseGenerator) {
        self.backend.set_handler(handler).await;
    }

    /// GET `path_and_query` through the proxy.
    pub async fn get(&self, path_and_query: &str) -> TestResponse {
        self.send(Method::GET, path_and_query, Bytes::new()).await
    }

    /// Send a request with `body` through the proxy.
    pub async fn send(&self, method: Method, path_and_query: &str, body: Bytes) -> TestResponse {
        let request = Request::builder()
            .method(method)
            .uri(self.proxy_url(path_and_query))
            .body(Full::new(body))
            .expect("valid test request");
        self.request(request).await
    }

    /// Send a prepared request through the proxy.
    pub async fn request(&self, request: Request<Full<Bytes>>) -> TestResponse {
        let response = self
            .client
            .request(request)
            .await
            .expect("proxy reachable");
        let (parts, body) = response.into_parts();
        let body = body.collect().await.expect("proxy body readable").to_bytes();

        TestResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }

    /// Stop the proxy and wait for the listener to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.listener_task.await;
        self.backend.stop();
    }
}

/// Builder for creating test harness with specific configuration.
pub struct TestHarnessBuilder {
    kerberos: MockKerberos,
    backend_handler: Option<ResponseGenerator>,
    target_url: Option<String>,
    max_body_bytes: Option<usize>,
    request_timeout_ms: Option<u64>,
    exchange_timeout_ms: Option<u64>,
    spn_mappings: Vec<(String, String)>,
}

impl TestHarnessBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kerberos: MockKerberos::new(),
            backend_handler: None,
            target_url: None,
            max_body_bytes: None,
            request_timeout_ms: None,
            exchange_timeout_ms: None,
            spn_mappings: Vec::new(),
        }
    }

    #[must_use]
    pub fn kerberos(mut self, kerberos: MockKerberos) -> Self {
        self.kerberos = kerberos;
        self
    }

    /// Initial backend response generator.
    #[must_use]
    pub fn backend_handler(mut self, handler: ResponseGenerator) -> Self {
        self.backend_handler = Some(handler);
        self
    }

    /// Point the proxy somewhere other than the mock backend.
    #[must_use]
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = Some(limit);
        self
    }

    /// Per-call and whole-exchange timeouts, in milliseconds.
    #[must_use]
    pub fn timeouts(mut self, request_ms: u64, exchange_ms: u64) -> Self {
        self.request_timeout_ms = Some(request_ms);
        self.exchange_timeout_ms = Some(exchange_ms);
        self
    }

    #[must_use]
    pub fn spn_mapping(mut self, host: impl Into<String>, spn: impl Into<String>) -> Self {
        self.spn_mappings.push((host.into(), spn.into()));
        self
    }

    /// Build the test harness.
    pub async fn build(self) -> ProxyTestHarness {
        let backend = match self.backend_handler {
            Some(handler) => MockBackend::start_with(handler).await,
            None => MockBackend::start().await,
        }
        .expect("Failed to start mock backend");

        let mut target = TargetConfig::new(self.target_url.unwrap_or_else(|| backend.url()));
        if let Some(limit) = self.max_body_bytes {
            target.max_body_bytes = limit;
        }
        if let Some(ms) = self.request_timeout_ms {
            target.request_timeout_ms = ms;
        }
        if let Some(ms) = self.exchange_timeout_ms {
            target.exchange_timeout_ms = ms;
        }

        let mut auth = AuthConfig::new("/etc/proxy.keytab", "EXAMPLE.COM");
        auth.renewal_backoff_ms = 10;
        auth.spn_hosts_mapping.extend(self.spn_mappings);

        let mut config = ProxyConfig::new(target, auth);
        config.listen = ListenConfig {
            address: "127.0.0.1:0".to_string(),
            max_connections: 100,
        };
        let config = config.finalize().expect("valid harness config");

        let kerberos = Arc::new(self.kerberos);
        let identity = Arc::new(
            IdentityStore::initialize(
                config.auth.identity(),
                kerberos.clone(),
                RenewalPolicy::from_config(&config.auth),
            )
            .await
            .expect("mock login succeeds"),
        );

        let metrics = Arc::new(ProxyMetrics::new());
        let cache = Arc::new(ContextCache::new(config.auth.renewal_margin()));
        let executor = Arc::new(
            ForwardingExecutor::new(&config, kerberos.clone(), Arc::clone(&identity), cache)
                .expect("valid executor config")
                .with_metrics(Arc::clone(&metrics)),
        );

        let listener = ProxyListener::bind(&config.listen, Arc::clone(&executor))
            .await
            .expect("Failed to bind proxy listener")
            .with_metrics(Arc::clone(&metrics));
        let proxy_addr = listener.local_addr().expect("bound listener has an address");
        let shutdown_tx = listener.shutdown_handle();
        let listener_task = tokio::spawn(async move { listener.run().await });

        ProxyTestHarness {
            backend,
            kerberos,
            identity,
            executor,
            metrics,
            config,
            proxy_addr,
            shutdown_tx,
            listener_task,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_creation() {
        let harness = ProxyTestHarness::new().await;

        assert_eq!(harness.kerberos.login_count(), 1);
        assert_eq!(harness.backend_spn().as_str(), "HTTP/127.0.0.1@EXAMPLE.COM");
        assert!(harness.cache().is_empty());

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_harness_builder_spn_mapping() {
        let harness = TestHarnessBuilder::new()
            .spn_mapping("127.0.0.1", "HTTP/backend.internal@EXAMPLE.COM")
            .build()
            .await;

        assert_eq!(harness.backend_spn().as_str(), "HTTP/backend.internal@EXAMPLE.COM");
        harness.shutdown().await;
    }
}
