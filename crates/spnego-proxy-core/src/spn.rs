//! Backend host to Service Principal Name resolution.

use std::collections::HashMap;
use std::fmt;

use crate::config::AuthConfig;

/// A Kerberos service principal name, e.g. `HTTP/web.example.com@EXAMPLE.COM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Spn(String);

impl Spn {
    pub fn new(spn: impl Into<String>) -> Self {
        Self(spn.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Spn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps backend hosts to SPNs.
///
/// Explicit overrides win; every other host gets `service/host@REALM`.
/// The table is fixed at construction.
#[derive(Debug, Clone)]
pub struct SpnResolver {
    service: String,
    realm: String,
    overrides: HashMap<String, Spn>,
}

impl SpnResolver {
    #[must_use]
    pub fn new(auth: &AuthConfig) -> Self {
        let overrides = auth
            .spn_hosts_mapping
            .iter()
            .map(|(host, spn)| (normalize_host(host), Spn::new(spn.trim())))
            .collect();

        Self {
            service: auth.service_name.clone(),
            realm: auth.realm.clone(),
            overrides,
        }
    }

    /// Resolve the SPN for `host`. Ports are ignored and matching is
    /// case-insensitive.
    #[must_use]
    pub fn resolve(&self, host: &str) -> Spn {
        let host = normalize_host(host);
        match self.overrides.get(&host) {
            Some(spn) => spn.clone(),
            None => Spn(format!("{}/{}@{}", self.service, host, self.realm)),
        }
    }

    /// Number of explicit overrides.
    #[must_use]
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

/// Lowercase, strip any port and a trailing root dot.
fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let bare = if let Some(rest) = host.strip_prefix('[') {
        // [v6addr] or [v6addr]:port
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            // a single colon separates the port; more than one is a bare v6 address
            Some((name, port))
                if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
            {
                name
            }
            _ => host,
        }
    };

    bare.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SpnResolver {
        let mut auth = AuthConfig::new("/etc/proxy.keytab", "EXAMPLE.COM");
        auth.spn_hosts_mapping.insert(
            "Web01.Example.com".to_string(),
            "HTTP/web-vip.example.com@EXAMPLE.COM".to_string(),
        );
        SpnResolver::new(&auth)
    }

    #[test]
    fn test_override_wins() {
        let spn = resolver().resolve("web01.example.com");
        assert_eq!(spn.as_str(), "HTTP/web-vip.example.com@EXAMPLE.COM");
    }

    #[test]
    fn test_override_ignores_case_and_port() {
        let r = resolver();
        assert_eq!(
            r.resolve("WEB01.EXAMPLE.COM:8443").as_str(),
            "HTTP/web-vip.example.com@EXAMPLE.COM"
        );
        assert_eq!(
            r.resolve("web01.example.com.").as_str(),
            "HTTP/web-vip.example.com@EXAMPLE.COM"
        );
    }

    #[test]
    fn test_default_derivation() {
        let spn = resolver().resolve("Hadoop-NN.example.com:9871");
        assert_eq!(spn.as_str(), "HTTP/hadoop-nn.example.com@EXAMPLE.COM");
    }

    #[test]
    fn test_custom_service_name() {
        let mut auth = AuthConfig::new("/etc/proxy.keytab", "CORP.LOCAL");
        auth.service_name = "host".to_string();
        let spn = SpnResolver::new(&auth).resolve("db.corp.local");
        assert_eq!(spn.to_string(), "host/db.corp.local@CORP.LOCAL");
    }

    #[test]
    fn test_normalize_ipv6() {
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("[fe80::1]"), "fe80::1");
        assert_eq!(normalize_host("fe80::1"), "fe80::1");
        assert_eq!(normalize_host("10.0.0.1:80"), "10.0.0.1");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let r = resolver();
        assert_eq!(r.resolve("a.example.com"), r.resolve("A.example.com:80"));
        assert_eq!(r.override_count(), 1);
    }
}
