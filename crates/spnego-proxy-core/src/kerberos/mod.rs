//! Kerberos capability seam.
//!
//! The proxy never touches Kerberos cryptography itself. Everything it needs
//! from the Kerberos library is expressed by two traits:
//!
//! - [`KerberosClient`] obtains and renews the proxy's ticket-granting
//!   credential and opens security contexts against a service principal.
//! - [`ContextHandle`] is one client-side security context: it produces wire
//!   tokens and consumes the backend's challenge tokens.
//!
//! The production backend lives in [`gssapi`] (behind the `gssapi` feature);
//! tests use the scripted mock in `crate::testing`.

#[cfg(feature = "gssapi")]
pub mod gssapi;

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::spn::Spn;

/// The proxy's own Kerberos identity. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Principal the proxy logs in as, without the realm.
    pub principal: String,
    /// Realm of the principal.
    pub realm: String,
    /// Keytab holding the principal's long-term key.
    pub keytab_path: PathBuf,
    /// krb5.conf handed to the Kerberos library.
    pub kerberos_config_path: PathBuf,
    /// Disable FAST armoring in the AS exchange.
    pub disable_pa_fx_fast: bool,
}

impl Identity {
    /// Fully qualified `principal@REALM`.
    ///
    /// A principal that already names its realm is returned unchanged.
    #[must_use]
    pub fn principal_name(&self) -> String {
        if self.principal.contains('@') {
            self.principal.clone()
        } else {
            format!("{}@{}", self.principal, self.realm)
        }
    }
}

/// Opaque ticket material owned by a Kerberos backend.
///
/// The core only moves it around; the backend that produced it downcasts it
/// back when it opens a context.
#[derive(Clone)]
pub struct TicketMaterial(Arc<dyn Any + Send + Sync>);

impl TicketMaterial {
    pub fn new<T: Any + Send + Sync>(material: T) -> Self {
        Self(Arc::new(material))
    }

    /// Borrow the material as the backend's concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for TicketMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TicketMaterial(<redacted>)")
    }
}

/// A ticket-granting credential with a known lifetime.
#[derive(Debug, Clone)]
pub struct Credential {
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub ticket: TicketMaterial,
}

impl Credential {
    /// Credential issued now and valid for `lifetime`.
    #[must_use]
    pub fn new(lifetime: Duration, ticket: TicketMaterial) -> Self {
        let issued_at = Instant::now();
        Self {
            issued_at,
            expires_at: issued_at + lifetime,
            ticket,
        }
    }

    /// Lifetime left at `now`, zero once expired.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Whether more than `margin` of lifetime is left at `now`.
    #[must_use]
    pub fn is_usable(&self, margin: Duration, now: Instant) -> bool {
        self.remaining(now) > margin
    }
}

/// Errors reported by a Kerberos backend.
///
/// Messages come from the library and never include key or token bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KerberosError {
    #[error("keytab {path} unreadable: {message}")]
    KeytabUnreadable { path: String, message: String },

    #[error("invalid kerberos configuration {path}: {message}")]
    InvalidConfig { path: String, message: String },

    #[error("kdc exchange failed: {0}")]
    Kdc(String),

    #[error("gssapi: {0}")]
    Gss(String),
}

/// The Kerberos library as seen by the proxy.
#[async_trait]
pub trait KerberosClient: Send + Sync {
    /// Obtain a fresh ticket-granting credential for `identity` from its keytab.
    async fn login(&self, identity: &Identity) -> Result<Credential, KerberosError>;

    /// Replace `current` with a credential that has a full lifetime again.
    ///
    /// Keytab-based identities simply log in again.
    async fn renew(
        &self,
        identity: &Identity,
        _current: &Credential,
    ) -> Result<Credential, KerberosError> {
        self.login(identity).await
    }

    /// Open a client security context for `spn` backed by `credential`.
    async fn new_context(
        &self,
        credential: &Credential,
        spn: &Spn,
    ) -> Result<Box<dyn ContextHandle>, KerberosError>;
}

/// One client-side security context.
///
/// Token calls may block inside the Kerberos library (a TGS exchange on the
/// first `initiate`), so implementations run them off the async workers.
#[async_trait]
pub trait ContextHandle: Send {
    /// Produce an initial token.
    async fn initiate(&mut self) -> Result<Vec<u8>, KerberosError>;

    /// Feed a token from the backend. Returns the next token to send, if any.
    async fn continue_with(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>, KerberosError>;

    /// A new context for one more exchange with the same service, served from
    /// the service ticket this one already obtained.
    fn fork(&self) -> Box<dyn ContextHandle>;

    /// Whether the library considers the context complete.
    fn is_established(&self) -> bool;

    /// When the context stops being valid, if the library knows.
    fn expiry(&self) -> Option<Instant>;
}
