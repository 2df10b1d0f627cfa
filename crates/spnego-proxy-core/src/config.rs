//! Configuration types for the SPNEGO reverse proxy.
//!
//! Configuration is loaded from YAML files (or assembled from CLI flags) and
//! validated once. The resulting [`ProxyConfig`] is immutable and handed
//! explicitly to every component that needs it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Uri;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::kerberos::Identity;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// HTTP listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Backend the proxy forwards to.
    pub target: TargetConfig,

    /// Kerberos identity and SPN settings.
    pub auth: AuthConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address to bind to, e.g., "0.0.0.0:8080".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Maximum number of concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Backend target configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Base URL every inbound path and query is appended to.
    pub url: String,

    /// TCP connect timeout for a single backend call, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Response timeout for a single backend call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Bound over a whole exchange: SPN resolution, every negotiation round
    /// and every backend call.
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,

    /// Largest inbound body buffered for replay across negotiation rounds.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// TLS settings for an `https` target.
    #[serde(default)]
    pub tls: Option<TargetTlsConfig>,
}

/// TLS configuration for backend connections.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetTlsConfig {
    /// Path to CA certificate file (PEM format) for verifying the backend.
    /// If not set, uses the bundled webpki roots.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to client certificate file (PEM format) for mTLS.
    pub cert_path: Option<PathBuf>,

    /// Path to client private key file (PEM format) for mTLS.
    pub key_path: Option<PathBuf>,
}

/// Kerberos identity and SPN configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Keytab holding the proxy's long-term key.
    /// Supports environment variable expansion: "${KEYTAB_DIR}/proxy.keytab"
    pub keytab_path: String,

    /// krb5.conf used by the Kerberos library.
    #[serde(default = "default_kerberos_config_path")]
    pub kerberos_config_path: String,

    /// Service part of default SPNs (`<service>/<host>@<realm>`).
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Principal the proxy logs in as.
    #[serde(default = "default_user_name")]
    pub user_name: String,

    /// Kerberos realm of the proxy and of default SPNs.
    pub realm: String,

    /// Disable FAST armoring (PA-FX-FAST) in the AS exchange.
    #[serde(default)]
    pub disable_pa_fx_fast: bool,

    /// Explicit host to SPN overrides.
    #[serde(default)]
    pub spn_hosts_mapping: BTreeMap<String, String>,

    /// Minimum remaining credential lifetime before it must be renewed.
    #[serde(default = "default_renewal_margin_secs")]
    pub renewal_margin_secs: u64,

    /// Renewal attempts before the credential is declared expired.
    #[serde(default = "default_renewal_retry_attempts")]
    pub renewal_retry_attempts: u32,

    /// Initial backoff between renewal attempts, doubled after each failure.
    #[serde(default = "default_renewal_backoff_ms")]
    pub renewal_backoff_ms: u64,
}

impl AuthConfig {
    /// Keytab path with environment variables expanded.
    #[must_use]
    pub fn keytab_path(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.keytab_path))
    }

    /// krb5.conf path with environment variables expanded.
    #[must_use]
    pub fn kerberos_config_path(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.kerberos_config_path))
    }

    /// Build the immutable identity handed to the identity store.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            principal: self.user_name.clone(),
            realm: self.realm.clone(),
            keytab_path: self.keytab_path(),
            kerberos_config_path: self.kerberos_config_path(),
            disable_pa_fx_fast: self.disable_pa_fx_fast,
        }
    }

    /// Safety margin applied to credential and context lifetimes.
    #[must_use]
    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.renewal_margin_secs)
    }

    /// Initial renewal retry backoff.
    #[must_use]
    pub fn renewal_backoff(&self) -> Duration {
        Duration::from_millis(self.renewal_backoff_ms)
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

/// Parse one `host=SPN` override as given on the command line.
///
/// # Errors
///
/// Returns an error if either side is empty or the separator is missing.
pub fn parse_spn_mapping_entry(entry: &str) -> ConfigResult<(String, String)> {
    match entry.split_once('=') {
        Some((host, spn)) if !host.trim().is_empty() && !spn.trim().is_empty() => {
            Ok((host.trim().to_string(), spn.trim().to_string()))
        }
        _ => Err(ConfigError::InvalidSpnMapping(entry.to_string())),
    }
}

// Default value functions

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_exchange_timeout_ms() -> u64 {
    60_000
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_kerberos_config_path() -> String {
    "/etc/krb5.conf".to_string()
}

fn default_service_name() -> String {
    "HTTP".to_string()
}

fn default_user_name() -> String {
    "HTTP".to_string()
}

fn default_renewal_margin_secs() -> u64 {
    300
}

fn default_renewal_retry_attempts() -> u32 {
    5
}

fn default_renewal_backoff_ms() -> u64 {
    1_000
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            max_connections: default_max_connections(),
        }
    }
}

impl TargetConfig {
    /// Create a target config with default timeouts.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            exchange_timeout_ms: default_exchange_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            tls: None,
        }
    }

    /// Parse the base URL.
    ///
    /// # Errors
    ///
    /// Returns an error unless the URL is absolute `http`/`https` with a host.
    pub fn base_uri(&self) -> ConfigResult<Uri> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|_| ConfigError::InvalidTargetUrl(self.url.clone()))?;
        let scheme_ok = matches!(uri.scheme_str(), Some("http") | Some("https"));
        if !scheme_ok || uri.host().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidTargetUrl(self.url.clone()));
        }
        Ok(uri)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

impl AuthConfig {
    /// Create an auth config with the usual defaults.
    #[must_use]
    pub fn new(keytab_path: impl Into<String>, realm: impl Into<String>) -> Self {
        Self {
            keytab_path: keytab_path.into(),
            kerberos_config_path: default_kerberos_config_path(),
            service_name: default_service_name(),
            user_name: default_user_name(),
            realm: realm.into(),
            disable_pa_fx_fast: false,
            spn_hosts_mapping: BTreeMap::new(),
            renewal_margin_secs: default_renewal_margin_secs(),
            renewal_retry_attempts: default_renewal_retry_attempts(),
            renewal_backoff_ms: default_renewal_backoff_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl ProxyConfig {
    /// Assemble a configuration from a target URL and auth settings.
    #[must_use]
    pub fn new(target: TargetConfig, auth: AuthConfig) -> Self {
        Self {
            listen: ListenConfig::default(),
            target,
            auth,
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.finalize()
    }

    /// Normalize and validate a configuration assembled by hand or by the CLI.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn finalize(mut self) -> ConfigResult<Self> {
        self.target.url = self.target.url.trim().trim_end_matches('/').to_string();
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.target.base_uri()?;

        if self.target.request_timeout_ms >= self.target.exchange_timeout_ms {
            return Err(ConfigError::TimeoutOrdering {
                request_ms: self.target.request_timeout_ms,
                exchange_ms: self.target.exchange_timeout_ms,
            });
        }

        if self.auth.keytab_path.trim().is_empty() {
            return Err(ConfigError::MissingField("auth.keytab_path"));
        }
        if self.auth.realm.trim().is_empty() {
            return Err(ConfigError::MissingField("auth.realm"));
        }
        if self.auth.user_name.trim().is_empty() {
            return Err(ConfigError::MissingField("auth.user_name"));
        }
        if self.auth.service_name.trim().is_empty() {
            return Err(ConfigError::MissingField("auth.service_name"));
        }
        if self.auth.renewal_margin_secs == 0 {
            return Err(ConfigError::ZeroRenewalMargin);
        }

        validate_address(&self.listen.address)?;
        if self.metrics.enabled {
            validate_address(&self.metrics.address)?;
        }

        Ok(())
    }
}

/// Check that an address is `host:port` with a numeric port.
fn validate_address(address: &str) -> ConfigResult<()> {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ConfigError::InvalidAddress(address.to_string())),
    }
}
