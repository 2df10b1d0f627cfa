//! The proxy's Kerberos identity and its ticket-granting credential.
//!
//! The credential sits behind a `tokio::sync::RwLock`: many readers, and a
//! single writer that swaps in a renewed credential. Renewals themselves are
//! serialized by a separate mutex so the KDC round trip never holds the
//! write lock. A [`CredentialRenewer`] renews proactively at
//! `expiry - margin`; callers that still find a credential inside the margin
//! renew inline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AuthConfig;
use crate::error::{CredentialInitError, TicketExpiredError};
use crate::kerberos::{Credential, Identity, KerberosClient, KerberosError};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How credentials are renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    /// No credential with this much lifetime or less is handed out.
    pub margin: Duration,
    /// Attempts per renewal before giving up.
    pub attempts: u32,
    /// Delay after the first failed attempt, doubled after each further one.
    pub backoff: Duration,
}

impl RenewalPolicy {
    #[must_use]
    pub fn from_config(auth: &AuthConfig) -> Self {
        Self {
            margin: auth.renewal_margin(),
            attempts: auth.renewal_retry_attempts.max(1),
            backoff: auth.renewal_backoff(),
        }
    }
}

/// Credential lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialEvent {
    Renewed {
        principal: String,
        expires_in: Duration,
    },
    RenewalFailed {
        principal: String,
        attempt: u32,
        fatal: bool,
        message: String,
    },
}

/// Holds the identity and the one live credential of the process.
pub struct IdentityStore {
    identity: Identity,
    kerberos: Arc<dyn KerberosClient>,
    credential: RwLock<Arc<Credential>>,
    renewal: Mutex<()>,
    policy: RenewalPolicy,
    events: broadcast::Sender<CredentialEvent>,
}

impl IdentityStore {
    /// Log in from the keytab and build the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the keytab or krb5 configuration is unusable, the
    /// KDC refuses the principal, or the issued ticket does not outlive the
    /// renewal margin.
    #[instrument(skip_all, fields(principal = %identity.principal_name()))]
    pub async fn initialize(
        identity: Identity,
        kerberos: Arc<dyn KerberosClient>,
        policy: RenewalPolicy,
    ) -> Result<Self, CredentialInitError> {
        let principal = identity.principal_name();

        let credential = kerberos
            .login(&identity)
            .await
            .map_err(|e| init_error(&principal, e))?;

        let lifetime = credential.remaining(Instant::now());
        if lifetime <= policy.margin {
            return Err(CredentialInitError::Login {
                principal,
                message: format!(
                    "ticket lifetime {}s does not exceed renewal margin {}s",
                    lifetime.as_secs(),
                    policy.margin.as_secs()
                ),
            });
        }

        info!(lifetime_secs = lifetime.as_secs(), "obtained initial credential");

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            identity,
            kerberos,
            credential: RwLock::new(Arc::new(credential)),
            renewal: Mutex::new(()),
            policy,
            events,
        })
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn policy(&self) -> RenewalPolicy {
        self.policy
    }

    /// Receive credential lifecycle events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.events.subscribe()
    }

    /// A credential with more than the renewal margin of lifetime left.
    ///
    /// Renews inline when the cached credential has fallen inside the
    /// margin.
    ///
    /// # Errors
    ///
    /// Returns an error if that renewal exhausts its attempts.
    pub async fn current_credential(&self) -> Result<Arc<Credential>, TicketExpiredError> {
        if let Some(cred) = self.usable().await {
            return Ok(cred);
        }
        self.refresh().await
    }

    /// Renew the credential unless another caller already has.
    ///
    /// # Errors
    ///
    /// Returns an error if renewal exhausts its attempts.
    pub async fn refresh(&self) -> Result<Arc<Credential>, TicketExpiredError> {
        let _renewal = self.renewal.lock().await;

        // Whoever held the renewal lock before us may have renewed already.
        if let Some(cred) = self.usable().await {
            return Ok(cred);
        }

        self.renew_locked().await
    }

    /// When the current credential should be renewed.
    pub async fn renewal_deadline(&self) -> Instant {
        let cred = self.credential.read().await;
        cred.expires_at
            .checked_sub(self.policy.margin)
            .unwrap_or(cred.issued_at)
    }

    /// Expiry of the current credential.
    pub async fn expires_at(&self) -> Instant {
        self.credential.read().await.expires_at
    }

    async fn usable(&self) -> Option<Arc<Credential>> {
        let cred = self.credential.read().await;
        cred.is_usable(self.policy.margin, Instant::now())
            .then(|| Arc::clone(&*cred))
    }

    async fn renew_locked(&self) -> Result<Arc<Credential>, TicketExpiredError> {
        let principal = self.identity.principal_name();
        let current = Arc::clone(&*self.credential.read().await);
        let mut backoff = self.policy.backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.policy.attempts {
            debug!(principal = %principal, attempt, "renewing credential");

            match self.kerberos.renew(&self.identity, &current).await {
                Ok(fresh) if fresh.is_usable(self.policy.margin, Instant::now()) => {
                    let expires_in = fresh.remaining(Instant::now());
                    let fresh = Arc::new(fresh);
                    *self.credential.write().await = Arc::clone(&fresh);

                    info!(
                        principal = %principal,
                        attempt,
                        expires_in_secs = expires_in.as_secs(),
                        "credential renewed"
                    );
                    self.emit(CredentialEvent::Renewed {
                        principal,
                        expires_in,
                    });
                    return Ok(fresh);
                }
                Ok(fresh) => {
                    last_error = format!(
                        "renewed ticket lifetime {}s does not exceed renewal margin",
                        fresh.remaining(Instant::now()).as_secs()
                    );
                }
                Err(e) => last_error = e.to_string(),
            }

            let fatal = attempt == self.policy.attempts;
            if fatal {
                error!(principal = %principal, attempt, error = %last_error, "credential renewal exhausted");
            } else {
                warn!(
                    principal = %principal,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "credential renewal failed, retrying"
                );
            }
            self.emit(CredentialEvent::RenewalFailed {
                principal: principal.clone(),
                attempt,
                fatal,
                message: last_error.clone(),
            });

            if !fatal {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(TicketExpiredError {
            principal,
            attempts: self.policy.attempts,
            message: last_error,
        })
    }

    fn emit(&self, event: CredentialEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn init_error(principal: &str, e: KerberosError) -> CredentialInitError {
    match e {
        KerberosError::KeytabUnreadable { path, message } => {
            CredentialInitError::Keytab { path, message }
        }
        KerberosError::InvalidConfig { path, message } => {
            CredentialInitError::KerberosConfig { path, message }
        }
        KerberosError::Kdc(message) | KerberosError::Gss(message) => CredentialInitError::Login {
            principal: principal.to_string(),
            message,
        },
    }
}

/// Background task that renews the credential at `expiry - margin`.
pub struct CredentialRenewer {
    store: Arc<IdentityStore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CredentialRenewer {
    #[must_use]
    pub fn new(store: Arc<IdentityStore>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self { store, shutdown_rx }
    }

    /// Run until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error when a renewal exhausts its attempts; the process
    /// has no usable credential left at that point.
    pub async fn run(mut self) -> Result<(), TicketExpiredError> {
        info!(
            principal = %self.store.identity().principal_name(),
            margin_secs = self.store.policy().margin.as_secs(),
            "starting credential renewer"
        );

        loop {
            let deadline = self.store.renewal_deadline().await;
            debug!(
                renew_in_secs = deadline.saturating_duration_since(Instant::now()).as_secs(),
                "next credential renewal scheduled"
            );

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    self.store.refresh().await?;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("credential renewer shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}
