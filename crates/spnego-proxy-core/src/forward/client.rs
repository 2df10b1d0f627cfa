//! HTTP client for the backend.

use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::Instant;
use tracing::trace;

use crate::config::TargetConfig;
use crate::error::{BackendError, TlsResult};
use crate::tls::build_client_config;

/// Pooled HTTP/1.1 client for `http` and `https` targets.
#[derive(Clone)]
pub struct BackendClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    host: String,
    request_timeout: Duration,
}

impl BackendClient {
    /// Build a client for `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured TLS material cannot be loaded.
    pub fn new(target: &TargetConfig, host: impl Into<String>) -> TlsResult<Self> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(target.connect_timeout()));
        http.set_nodelay(true);
        http.enforce_http(false);

        let tls = build_client_config(target.tls.as_ref())?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            client,
            host: host.into(),
            request_timeout: target.request_timeout(),
        })
    }

    /// Send one request, bounded by the per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when no response head arrives in time and
    /// `Unreachable` for connect or I/O failures.
    pub async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, BackendError> {
        let started = Instant::now();
        trace!(method = %request.method(), uri = %request.uri(), "sending backend request");

        match tokio::time::timeout(self.request_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(BackendError::Unreachable {
                host: self.host.clone(),
                message: error_chain(&e),
            }),
            Err(_) => Err(BackendError::Timeout {
                host: self.host.clone(),
                elapsed_ms: elapsed_ms(started),
            }),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Flatten an error and its sources into one line.
fn error_chain(e: &(dyn std::error::Error + 'static)) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_backend() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = TargetConfig::new(format!("http://{addr}"));
        let client = BackendClient::new(&target, addr.to_string()).unwrap();

        let request = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = client.send(request).await.unwrap_err();
        assert!(matches!(err, BackendError::Unreachable { .. }), "{err:?}");
        assert_eq!(client.host(), addr.to_string());
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = std::io::Error::new(std::io::ErrorKind::Other, inner);
        assert!(error_chain(&outer).contains("refused"));
    }
}
