//! Request forwarding to the Kerberos-protected backend.
//!
//! - [`executor`] runs one exchange: SPN resolution, context lease,
//!   negotiation rounds and backend calls
//! - [`client`] is the pooled backend HTTP client
//! - [`headers`] filters hop-by-hop headers in both directions

pub mod client;
pub mod executor;
pub mod headers;

use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::Full;
use tokio::time::Instant;

use crate::error::BackendError;
use crate::spn::Spn;

pub use client::BackendClient;
pub use executor::{ForwardingExecutor, ProxyBody};

/// Per-request state owned by the forwarding executor.
///
/// The inbound body is buffered once here so every negotiation round can
/// replay it.
#[derive(Debug, Clone)]
pub struct ProxyExchange {
    pub method: Method,
    /// Target base URL joined with the inbound path and query.
    pub uri: Uri,
    /// Outbound header template, without `Authorization`.
    pub headers: HeaderMap,
    pub body: Bytes,
    pub spn: Spn,
    /// Continuation rounds taken so far; 0 while the initial token is in flight.
    pub round: u32,
    pub started: Instant,
}

impl ProxyExchange {
    /// Outbound request for the current round.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be carried in a header.
    pub fn outbound_request(&self, token: &str) -> Result<Request<Full<Bytes>>, BackendError> {
        let mut request = Request::new(Full::new(self.body.clone()));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
            .headers_mut()
            .insert(AUTHORIZATION, headers::negotiate_authorization(token)?);
        Ok(request)
    }
}

/// Join the target base URL with an inbound path and query.
///
/// The base carries no trailing slash, so this is plain concatenation.
///
/// # Errors
///
/// Returns an error if the result is not a valid URI.
pub fn join_target(base: &str, path_and_query: &str) -> Result<Uri, BackendError> {
    format!("{base}{path_and_query}")
        .parse()
        .map_err(|e| BackendError::InvalidRequest(format!("target uri: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_target() {
        let uri = join_target("http://backend:8080", "/webhdfs/v1/tmp?op=LISTSTATUS").unwrap();
        assert_eq!(uri.to_string(), "http://backend:8080/webhdfs/v1/tmp?op=LISTSTATUS");

        let uri = join_target("https://backend/api", "/v2/items").unwrap();
        assert_eq!(uri.path(), "/api/v2/items");
    }

    #[test]
    fn test_outbound_request_sets_negotiate() {
        let exchange = ProxyExchange {
            method: Method::PUT,
            uri: join_target("http://backend", "/a?b=c").unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"payload"),
            spn: Spn::new("HTTP/backend@EXAMPLE.COM"),
            round: 0,
            started: Instant::now(),
        };

        let request = exchange.outbound_request("dG9r").unwrap();
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.uri().query(), Some("b=c"));
        assert_eq!(request.headers()[AUTHORIZATION], "Negotiate dG9r");
    }
}
