//! SPNEGO Reverse Proxy Core Library
//!
//! This library provides the core of an HTTP reverse proxy that authenticates
//! to a Kerberos-protected backend on behalf of its clients. Clients speak
//! plain HTTP to the proxy; the proxy holds a keytab-based Kerberos identity,
//! negotiates `Authorization: Negotiate` with the backend, and relays the
//! backend's response.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`kerberos`] - The Kerberos library seam and its GSSAPI backend
//! - [`identity`] - The proxy's credential and its renewal
//! - [`spn`] - Host to service principal resolution
//! - [`context`] - Per-SPN security context cache
//! - [`negotiation`] - The SPNEGO handshake state machine
//! - [`forward`] - Backend client and the per-request forwarding executor
//! - [`network`] - TCP listener and HTTP connection handling
//! - [`metrics`] - Prometheus metrics collection
//! - [`tls`] - TLS configuration for HTTPS backends
//!
//! # Example
//!
//! ```rust,ignore
//! use spnego_proxy_core::config::ProxyConfig;
//!
//! // Load configuration
//! let config = ProxyConfig::from_file("config.yaml")?;
//!
//! // Log in, build the executor, bind the listener
//! // ...
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod forward;
pub mod identity;
pub mod kerberos;
pub mod metrics;
pub mod negotiation;
pub mod network;
pub mod spn;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use config::{AuthConfig, ProxyConfig, TargetConfig};
pub use context::{ContextCache, NegotiationState};
pub use error::{
    BackendError, ConfigError, CredentialInitError, NegotiationError, ProxyError, Result,
    TicketExpiredError, TlsError,
};
pub use forward::ForwardingExecutor;
pub use identity::{CredentialEvent, CredentialRenewer, IdentityStore, RenewalPolicy};
pub use kerberos::{Credential, Identity, KerberosClient};
pub use network::ProxyListener;
pub use spn::{Spn, SpnResolver};
