//! Domain error types for the SPNEGO reverse proxy.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Nothing in here ever carries token bytes or keytab material; variants hold
//! only the SPN, host, round count and a library message.

use http::StatusCode;
use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// The target URL is not an absolute http(s) URL.
    #[error("invalid target url '{0}': expected http:// or https:// with a host")]
    InvalidTargetUrl(String),

    /// A required setting is empty.
    #[error("missing required setting: {0}")]
    MissingField(&'static str),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// A host to SPN override could not be parsed.
    #[error("invalid spn mapping entry '{0}' (expected 'host=service/host@REALM')")]
    InvalidSpnMapping(String),

    /// Timeout settings are inconsistent.
    #[error("request timeout ({request_ms}ms) must be shorter than exchange timeout ({exchange_ms}ms)")]
    TimeoutOrdering { request_ms: u64, exchange_ms: u64 },

    /// Renewal margin must be non-zero.
    #[error("renewal_margin_secs must be greater than zero")]
    ZeroRenewalMargin,

    /// Outbound TLS settings could not be loaded.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// Failure to establish the proxy's own Kerberos identity at startup.
///
/// Always fatal: the proxy cannot authenticate to anything without it.
#[derive(Error, Debug)]
pub enum CredentialInitError {
    /// The keytab file is missing or unreadable.
    #[error("keytab '{path}' is not readable: {message}")]
    Keytab { path: String, message: String },

    /// The krb5 configuration is missing or malformed.
    #[error("kerberos config '{path}' is invalid: {message}")]
    KerberosConfig { path: String, message: String },

    /// The KDC refused the principal or could not be reached.
    #[error("failed to obtain ticket for {principal}: {message}")]
    Login { principal: String, message: String },

    /// The binary was built without a Kerberos backend.
    #[error("no kerberos backend available: {0}")]
    NoBackend(String),
}

/// The credential could not be renewed and no valid credential remains.
#[derive(Error, Debug, Clone)]
#[error("ticket for {principal} expired or unrenewable after {attempts} attempts: {message}")]
pub struct TicketExpiredError {
    pub principal: String,
    pub attempts: u32,
    pub message: String,
}

/// Why a negotiation ended in `Rejected`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The Kerberos library refused to produce a token (unknown principal,
    /// clock skew, bad credential).
    #[error("token generation for {spn} failed in round {round}: {message}")]
    TokenGeneration {
        spn: String,
        round: u32,
        message: String,
    },

    /// The backend's final mutual-authentication token did not verify.
    #[error("mutual authentication with {spn} failed: {message}")]
    MutualAuth { spn: String, message: String },

    /// The backend answered 401 without a continuation token.
    #[error("{spn} rejected the negotiation in round {round}")]
    Rejected { spn: String, round: u32 },

    /// The backend kept challenging past the round limit.
    #[error("{spn} still challenging after {rounds} continuation rounds")]
    RoundsExhausted { spn: String, rounds: u32 },

    /// The backend sent a challenge token that is not valid base64.
    #[error("{spn} sent a malformed challenge in round {round}")]
    MalformedChallenge { spn: String, round: u32 },
}

impl NegotiationError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TokenGeneration { .. } => "token_generation",
            Self::MutualAuth { .. } => "mutual_auth",
            Self::Rejected { .. } => "rejected",
            Self::RoundsExhausted { .. } => "rounds_exhausted",
            Self::MalformedChallenge { .. } => "malformed_challenge",
        }
    }
}

/// Failures talking to the target backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connecting or sending failed.
    #[error("backend {host} unreachable: {message}")]
    Unreachable { host: String, message: String },

    /// The backend call or the whole exchange ran out of time.
    #[error("backend {host} timed out after {elapsed_ms}ms")]
    Timeout { host: String, elapsed_ms: u64 },

    /// The inbound body exceeded the replay buffer limit.
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The inbound body could not be read.
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The outbound request could not be built.
    #[error("invalid outbound request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "unreachable",
            Self::Timeout { .. } => "timeout",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::Body(_) => "body",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

/// Errors related to TLS configuration for the backend connection.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Failed to load certificate file.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Failed to load private key file.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// No certificates found in file.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// No private key found in file.
    #[error("no private key found in '{0}'")]
    NoPrivateKey(String),

    /// TLS configuration error.
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Errors that end a single proxied exchange.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Negotiation with the backend was rejected.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    /// The backend could not be reached.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The proxy's own credential is gone.
    #[error(transparent)]
    TicketExpired(#[from] TicketExpiredError),

    /// TCP/IO error on the listener side.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status returned to the client when this error ends an exchange.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Negotiation(_) => StatusCode::UNAUTHORIZED,
            Self::Backend(BackendError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Backend(BackendError::BodyTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Backend(BackendError::Body(_)) => StatusCode::BAD_REQUEST,
            Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::TicketExpired(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Connection(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Negotiation(e) => e.kind(),
            Self::Backend(e) => e.kind(),
            Self::TicketExpired(_) => "ticket_expired",
            Self::Connection(_) => "connection",
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
