//! Header handling between client, proxy and backend.

use std::net::IpAddr;

use http::header::{
    HeaderName, AUTHORIZATION, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, HeaderValue};

use crate::error::BackendError;

const KEEP_ALIVE: &str = "keep-alive";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that only describe a single transport hop (RFC 9110 §7.6.1).
const HOP_BY_HOP: [HeaderName; 7] = [
    CONNECTION,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);
}

/// Headers for the outbound request template.
///
/// The client's `Host` and `Authorization` never reach the backend: the
/// connector sets the target's host and every round sets its own
/// `Authorization: Negotiate`.
#[must_use]
pub fn outbound_headers(inbound: &HeaderMap, client_ip: Option<IpAddr>) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);
    headers.remove(AUTHORIZATION);

    if let Some(ip) = client_ip {
        let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{prior}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    headers
}

/// `Negotiate <token>` for the `Authorization` header.
///
/// # Errors
///
/// Returns an error if the token is not a valid header value, which cannot
/// happen for base64.
pub fn negotiate_authorization(token: &str) -> Result<HeaderValue, BackendError> {
    HeaderValue::from_str(&format!("Negotiate {token}"))
        .map_err(|e| BackendError::InvalidRequest(format!("authorization header: {e}")))
}
