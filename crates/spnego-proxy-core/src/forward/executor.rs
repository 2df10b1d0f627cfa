//! The forwarding executor: one inbound request in, one response out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

use super::client::{elapsed_ms, BackendClient};
use super::headers::{outbound_headers, strip_hop_by_hop};
use super::{join_target, ProxyExchange};
use crate::config::ProxyConfig;
use crate::context::{ContextCache, ContextLease};
use crate::error::{BackendError, ConfigResult, NegotiationError, ProxyError};
use crate::identity::IdentityStore;
use crate::kerberos::KerberosClient;
use crate::metrics::ProxyMetrics;
use crate::negotiation::{NegotiationEngine, Verdict};
use crate::spn::SpnResolver;

/// Response body handed back to the listener.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Established contexts tried before an exchange stops reusing.
const REUSE_ATTEMPTS: usize = 2;

/// Runs exchanges against the configured target.
pub struct ForwardingExecutor {
    base_url: String,
    target_host: String,
    resolver: SpnResolver,
    cache: Arc<ContextCache>,
    engine: NegotiationEngine,
    client: BackendClient,
    metrics: Option<Arc<ProxyMetrics>>,
    exchange_timeout: Duration,
    max_body_bytes: usize,
}

impl ForwardingExecutor {
    /// Wire an executor for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target URL is invalid or its TLS material
    /// cannot be loaded.
    pub fn new(
        config: &ProxyConfig,
        kerberos: Arc<dyn KerberosClient>,
        identity: Arc<IdentityStore>,
        cache: Arc<ContextCache>,
    ) -> ConfigResult<Self> {
        let base = config.target.base_uri()?;
        let target_host = base.host().unwrap_or_default().to_string();
        let client_label = base
            .authority()
            .map_or_else(|| target_host.clone(), |a| a.to_string());

        Ok(Self {
            base_url: config.target.url.trim_end_matches('/').to_string(),
            resolver: SpnResolver::new(&config.auth),
            cache,
            engine: NegotiationEngine::new(kerberos, identity),
            client: BackendClient::new(&config.target, client_label)?,
            metrics: None,
            exchange_timeout: config.target.exchange_timeout(),
            max_body_bytes: config.target.max_body_bytes,
            target_host,
        })
    }

    /// Record exchange outcomes into `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ProxyMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    /// Proxy one request. Every failure becomes an HTTP error response.
    #[instrument(
        name = "exchange",
        skip_all,
        fields(method = %request.method(), path = %request.uri().path())
    )]
    pub async fn handle<B>(&self, request: Request<B>, client_addr: Option<SocketAddr>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let started = Instant::now();

        let outcome = match tokio::time::timeout(self.exchange_timeout, self.execute(request, client_addr)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Timeout {
                host: self.client.host().to_string(),
                elapsed_ms: elapsed_ms(started),
            }
            .into()),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok((response, rounds)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_accepted(rounds, elapsed);
                    metrics.set_cached_contexts(self.cache.established_count());
                }
                response
            }
            Err(e) => {
                let status = e.status_code();
                match &e {
                    ProxyError::Negotiation(n) => warn!(kind = n.kind(), error = %n, "negotiation rejected"),
                    ProxyError::TicketExpired(t) => error!(error = %t, "no usable credential"),
                    other => warn!(kind = other.kind(), error = %other, "exchange failed"),
                }
                if let Some(metrics) = &self.metrics {
                    if let ProxyError::Backend(b) = &e {
                        metrics.record_backend_error(b.kind());
                    }
                    metrics.record_failed(e.kind(), elapsed);
                    metrics.set_cached_contexts(self.cache.established_count());
                }
                error_response(status)
            }
        }
    }

    async fn execute<B>(
        &self,
        request: Request<B>,
        client_addr: Option<SocketAddr>,
    ) -> Result<(Response<ProxyBody>, u32), ProxyError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let mut exchange = self.prepare(request, client_addr).await?;
        let mut lease = self.cache.acquire(&exchange.spn).await;

        for _ in 0..REUSE_ATTEMPTS {
            if !lease.is_reused() {
                return self.negotiate(&mut exchange, lease).await;
            }

            let generation = lease.generation();
            if let Some(response) = self.send_reused(&exchange, lease).await? {
                return Ok((response, 0));
            }

            debug!(spn = %exchange.spn, generation, "established context refused, renegotiating");
            self.cache.invalidate(&exchange.spn, generation).await;
            // Another exchange may have re-established the SPN meanwhile.
            lease = self.cache.acquire(&exchange.spn).await;
        }

        if lease.is_reused() {
            return Err(NegotiationError::Rejected {
                spn: exchange.spn.to_string(),
                round: 0,
            }
            .into());
        }
        self.negotiate(&mut exchange, lease).await
    }

    /// Buffer the body, build the outbound template and resolve the SPN.
    async fn prepare<B>(
        &self,
        request: Request<B>,
        client_addr: Option<SocketAddr>,
    ) -> Result<ProxyExchange, ProxyError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = request.into_parts();

        let body = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    BackendError::BodyTooLarge {
                        limit: self.max_body_bytes,
                    }
                } else {
                    BackendError::Body(e.to_string())
                }
            })?
            .to_bytes();

        let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());

        Ok(ProxyExchange {
            method: parts.method,
            uri: join_target(&self.base_url, path_and_query)?,
            headers: outbound_headers(&parts.headers, client_addr.map(|a| a.ip())),
            body,
            spn: self.resolver.resolve(&self.target_host),
            round: 0,
            started: Instant::now(),
        })
    }

    /// Send with a token minted from an established context.
    ///
    /// The lease is released before the backend call so concurrent requests
    /// for the SPN are not serialized behind it. `None` means the backend
    /// refused the token.
    async fn send_reused(
        &self,
        exchange: &ProxyExchange,
        mut lease: ContextLease,
    ) -> Result<Option<Response<ProxyBody>>, ProxyError> {
        let mut minted = match self.engine.mint(&mut lease).await {
            Ok(minted) => minted,
            Err(ProxyError::Negotiation(e)) => {
                warn!(spn = %exchange.spn, error = %e, "established context could not mint a token");
                lease.invalidate();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        drop(lease);

        let response = self.client.send(exchange.outbound_request(&minted.token)?).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }

        if let Err(e) = self.engine.verify_minted(&mut minted, response.headers()).await {
            self.cache.invalidate(&exchange.spn, minted.generation).await;
            return Err(e.into());
        }
        Ok(Some(relay(response)))
    }

    /// The bounded handshake loop, holding the lease throughout.
    async fn negotiate(
        &self,
        exchange: &mut ProxyExchange,
        mut lease: ContextLease,
    ) -> Result<(Response<ProxyBody>, u32), ProxyError> {
        let mut token = match self.engine.begin(&mut lease).await {
            Ok(token) => token,
            Err(e) => {
                if matches!(e, ProxyError::Negotiation(_)) {
                    lease.invalidate();
                }
                return Err(e);
            }
        };
        exchange.round = 0;

        loop {
            self.engine.mark_sent(&mut lease);
            // A backend failure is not a negotiation failure: dropping the
            // lease leaves the committed state as it was.
            let response = self.client.send(exchange.outbound_request(&token)?).await?;

            match self
                .engine
                .conclude(&mut lease, response.status(), response.headers(), exchange.round)
                .await
            {
                Verdict::Accepted => {
                    debug!(spn = %exchange.spn, rounds = exchange.round, "exchange accepted");
                    lease.commit();
                    return Ok((relay(response), exchange.round));
                }
                Verdict::Continue(challenge) => {
                    exchange.round += 1;
                    token = match self.engine.step(&mut lease, &challenge, exchange.round).await {
                        Ok(token) => token,
                        Err(e) => {
                            lease.invalidate();
                            return Err(e.into());
                        }
                    };
                }
                Verdict::Rejected(e) => {
                    lease.invalidate();
                    return Err(e.into());
                }
            }
        }
    }
}

/// Pass the backend response through minus hop-by-hop headers.
fn relay(response: Response<Incoming>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

/// A proxy-generated error response.
#[must_use]
pub fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let reason = status.canonical_reason().unwrap_or("error");
    let body = Full::new(Bytes::from(format!("{} {reason}\n", status.as_u16())))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_response() {
        let response = error_response(StatusCode::BAD_GATEWAY);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"502 Bad Gateway\n");
    }
}
