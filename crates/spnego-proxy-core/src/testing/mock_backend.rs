//! Mock Kerberos-protected HTTP backend for integration testing.
//!
//! A lightweight HTTP/1.1 server that:
//! - Records every request it receives
//! - Answers through a swappable response generator
//! - Can hold requests unanswered until released

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch, RwLock};

/// A request as the backend saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RecordedRequest {
    /// The `Authorization` header, if present.
    #[must_use]
    pub fn authorization(&self) -> Option<&str> {
        self.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
    }

    /// The decoded `Negotiate` token, if present and valid.
    #[must_use]
    pub fn negotiate_token(&self) -> Option<Vec<u8>> {
        let encoded = self.authorization()?.strip_prefix("Negotiate ")?;
        STANDARD.decode(encoded.trim()).ok()
    }

    /// The decoded token as text, for the scripted mock tokens.
    #[must_use]
    pub fn negotiate_text(&self) -> Option<String> {
        self.negotiate_token()
            .map(|t| String::from_utf8_lossy(&t).into_owned())
    }
}

/// Response generator function type.
pub type ResponseGenerator = Arc<dyn Fn(&RecordedRequest) -> Response<Full<Bytes>> + Send + Sync>;

/// Mock backend bound to an ephemeral loopback port.
pub struct MockBackend {
    address: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    call_log: Arc<RwLock<Vec<RecordedRequest>>>,
    handler: Arc<RwLock<ResponseGenerator>>,
    hold_tx: watch::Sender<bool>,
}

impl MockBackend {
    /// Start a backend that accepts any `Negotiate` request.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(responses::require_negotiate("ok")).await
    }

    /// Start a backend answering through `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn start_with(handler: ResponseGenerator) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let call_log = Arc::new(RwLock::new(Vec::new()));
        let handler = Arc::new(RwLock::new(handler));
        let (hold_tx, hold_rx) = watch::channel(false);

        let mut shutdown_rx = shutdown_tx.subscribe();
        let log = Arc::clone(&call_log);
        let generator = Arc::clone(&handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        let log = Arc::clone(&log);
                        let generator = Arc::clone(&generator);
                        let hold_rx = hold_rx.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |request: Request<Incoming>| {
                                let log = Arc::clone(&log);
                                let generator = Arc::clone(&generator);
                                let hold_rx = hold_rx.clone();
                                async move {
                                    Ok::<_, Infallible>(
                                        Self::respond(request, log, generator, hold_rx).await,
                                    )
                                }
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                }
            }
        });

        Ok(Self {
            address,
            shutdown_tx,
            call_log,
            handler,
            hold_tx,
        })
    }

    async fn respond(
        request: Request<Incoming>,
        log: Arc<RwLock<Vec<RecordedRequest>>>,
        generator: Arc<RwLock<ResponseGenerator>>,
        mut hold_rx: watch::Receiver<bool>,
    ) -> Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        let Ok(body) = body.collect().await else {
            return responses::status(StatusCode::BAD_REQUEST);
        };

        let recorded = RecordedRequest {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body: body.to_bytes(),
        };
        log.write().await.push(recorded.clone());

        // Recorded first, so tests can see a held request arrive.
        let _ = hold_rx.wait_for(|held| !*held).await;

        let handler = Arc::clone(&*generator.read().await);
        handler(&recorded)
    }

    /// Replace the response generator.
    pub async fn set_handler(&self, handler: ResponseGenerator) {
        *self.handler.write().await = handler;
    }

    /// While held, requests are recorded but not answered.
    pub fn hold_requests(&self, hold: bool) {
        self.hold_tx.send_replace(hold);
    }

    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Base URL for a `TargetConfig`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Get all recorded calls.
    pub async fn calls(&self) -> Vec<RecordedRequest> {
        self.call_log.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.call_log.read().await.len()
    }

    /// Clear the call log.
    pub async fn clear_calls(&self) {
        self.call_log.write().await.clear();
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Response builders for common backend behaviors.
pub mod responses {
    use super::*;

    fn negotiate_header(token: &[u8]) -> String {
        if token.is_empty() {
            "Negotiate".to_string()
        } else {
            format!("Negotiate {}", STANDARD.encode(token))
        }
    }

    /// Empty response with `status`.
    #[must_use]
    pub fn status(status: StatusCode) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = status;
        response
    }

    /// 200 with `body`.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        Response::new(Full::new(body.into()))
    }

    /// 401 carrying a continuation token.
    #[must_use]
    pub fn challenge(token: &[u8]) -> Response<Full<Bytes>> {
        let mut response = status(StatusCode::UNAUTHORIZED);
        if let Ok(value) = negotiate_header(token).parse() {
            response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
        response
    }

    /// 401 with a bare `WWW-Authenticate: Negotiate`.
    #[must_use]
    pub fn unauthorized() -> Response<Full<Bytes>> {
        challenge(b"")
    }

    /// 200 carrying a final mutual-authentication token.
    #[must_use]
    pub fn accept_with_token(token: &[u8], body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = ok(body);
        if let Ok(value) = negotiate_header(token).parse() {
            response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
        response
    }

    /// 200 with `body` for any request carrying a Negotiate token,
    /// a bare 401 otherwise.
    #[must_use]
    pub fn require_negotiate(body: &'static str) -> ResponseGenerator {
        Arc::new(move |request: &RecordedRequest| {
            if request.negotiate_token().is_some() {
                ok(body)
            } else {
                unauthorized()
            }
        })
    }

    /// Every request gets the same status.
    #[must_use]
    pub fn always(code: StatusCode) -> ResponseGenerator {
        Arc::new(move |_: &RecordedRequest| status(code))
    }
}
