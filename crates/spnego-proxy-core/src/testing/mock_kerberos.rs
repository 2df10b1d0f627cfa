//! Scripted Kerberos backend for tests.
//!
//! Tokens are readable byte strings so tests can assert on what reached
//! the backend:
//!
//! - `initiate` produces `init:<spn>`
//! - `continue_with(c)` produces `cont:<c>`
//! - a challenge starting with `reject` fails the context
//! - a challenge starting with `mutual` or `final` completes it with no
//!   further token

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::kerberos::{
    ContextHandle, Credential, Identity, KerberosClient, KerberosError, TicketMaterial,
};
use crate::spn::Spn;

const DEFAULT_TICKET_LIFETIME: Duration = Duration::from_secs(10 * 60 * 60);

/// Ticket material produced by [`MockKerberos`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockTicket {
    /// Which login issued it, starting at 1.
    pub serial: usize,
}

#[derive(Debug, Default)]
struct Counters {
    contexts: AtomicUsize,
    tokens: AtomicUsize,
    continuations: AtomicUsize,
}

/// A [`KerberosClient`] that never talks to a KDC.
#[derive(Debug)]
pub struct MockKerberos {
    ticket_lifetime: Duration,
    context_lifetime: Option<Duration>,
    login_delay: Duration,
    fail_all_logins: AtomicBool,
    fail_next_logins: AtomicUsize,
    fail_token_generation: Arc<AtomicBool>,
    logins: AtomicUsize,
    counters: Arc<Counters>,
}

impl MockKerberos {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticket_lifetime: DEFAULT_TICKET_LIFETIME,
            context_lifetime: None,
            login_delay: Duration::ZERO,
            fail_all_logins: AtomicBool::new(false),
            fail_next_logins: AtomicUsize::new(0),
            fail_token_generation: Arc::new(AtomicBool::new(false)),
            logins: AtomicUsize::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Lifetime of every issued ticket.
    #[must_use]
    pub fn with_ticket_lifetime(mut self, lifetime: Duration) -> Self {
        self.ticket_lifetime = lifetime;
        self
    }

    /// Give contexts their own expiry instead of inheriting the ticket's.
    #[must_use]
    pub fn with_context_lifetime(mut self, lifetime: Duration) -> Self {
        self.context_lifetime = Some(lifetime);
        self
    }

    /// Simulate KDC latency on every login.
    #[must_use]
    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn fail_all_logins(&self, fail: bool) {
        self.fail_all_logins.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` logins, then succeed again.
    pub fn fail_next_logins(&self, count: usize) {
        self.fail_next_logins.store(count, Ordering::SeqCst);
    }

    /// Make every token generation fail, including on live contexts.
    pub fn fail_token_generation(&self, fail: bool) {
        self.fail_token_generation.store(fail, Ordering::SeqCst);
    }

    /// Login attempts so far, failed ones included.
    #[must_use]
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Security contexts opened so far.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.counters.contexts.load(Ordering::SeqCst)
    }

    /// Initial tokens produced so far, minted ones included.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.counters.tokens.load(Ordering::SeqCst)
    }

    /// Challenges consumed so far.
    #[must_use]
    pub fn continuation_count(&self) -> usize {
        self.counters.continuations.load(Ordering::SeqCst)
    }

    fn take_scheduled_failure(&self) -> bool {
        self.fail_next_logins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockKerberos {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KerberosClient for MockKerberos {
    async fn login(&self, identity: &Identity) -> Result<Credential, KerberosError> {
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }

        let serial = self.logins.fetch_add(1, Ordering::SeqCst) + 1;

        if self.fail_all_logins.load(Ordering::SeqCst) || self.take_scheduled_failure() {
            return Err(KerberosError::Kdc(format!(
                "KDC unreachable for {}",
                identity.principal_name()
            )));
        }

        Ok(Credential::new(
            self.ticket_lifetime,
            TicketMaterial::new(MockTicket { serial }),
        ))
    }

    async fn new_context(
        &self,
        credential: &Credential,
        spn: &Spn,
    ) -> Result<Box<dyn ContextHandle>, KerberosError> {
        if credential.ticket.downcast_ref::<MockTicket>().is_none() {
            return Err(KerberosError::Gss("ticket not issued by this backend".to_string()));
        }

        let now = Instant::now();
        if credential.expires_at <= now {
            return Err(KerberosError::Kdc("credential expired".to_string()));
        }

        self.counters.contexts.fetch_add(1, Ordering::SeqCst);
        let expires_at = match self.context_lifetime {
            Some(lifetime) => (now + lifetime).min(credential.expires_at),
            None => credential.expires_at,
        };

        Ok(Box::new(MockContext {
            spn: spn.clone(),
            expires_at,
            established: false,
            fail_token_generation: Arc::clone(&self.fail_token_generation),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MockContext {
    spn: Spn,
    expires_at: Instant,
    established: bool,
    fail_token_generation: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

#[async_trait]
impl ContextHandle for MockContext {
    async fn initiate(&mut self) -> Result<Vec<u8>, KerberosError> {
        if self.fail_token_generation.load(Ordering::SeqCst) {
            return Err(KerberosError::Gss("token generation failed".to_string()));
        }
        self.counters.tokens.fetch_add(1, Ordering::SeqCst);
        Ok(format!("init:{}", self.spn).into_bytes())
    }

    async fn continue_with(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>, KerberosError> {
        self.counters.continuations.fetch_add(1, Ordering::SeqCst);

        if challenge.starts_with(b"reject") {
            return Err(KerberosError::Gss("defective token".to_string()));
        }
        if challenge.starts_with(b"mutual") || challenge.starts_with(b"final") {
            self.established = true;
            return Ok(None);
        }
        if self.fail_token_generation.load(Ordering::SeqCst) {
            return Err(KerberosError::Gss("token generation failed".to_string()));
        }

        let mut token = b"cont:".to_vec();
        token.extend_from_slice(challenge);
        Ok(Some(token))
    }

    fn fork(&self) -> Box<dyn ContextHandle> {
        Box::new(MockContext {
            spn: self.spn.clone(),
            expires_at: self.expires_at,
            established: false,
            fail_token_generation: Arc::clone(&self.fail_token_generation),
            counters: Arc::clone(&self.counters),
        })
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn expiry(&self) -> Option<Instant> {
        Some(self.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn identity() -> Identity {
        Identity {
            principal: "HTTP".to_string(),
            realm: "EXAMPLE.COM".to_string(),
            keytab_path: PathBuf::from("/etc/proxy.keytab"),
            kerberos_config_path: PathBuf::from("/etc/krb5.conf"),
            disable_pa_fx_fast: false,
        }
    }

    #[tokio::test]
    async fn test_scripted_tokens() {
        let kerberos = MockKerberos::new();
        let cred = kerberos.login(&identity()).await.unwrap();
        let spn = Spn::new("HTTP/backend@EXAMPLE.COM");

        let mut ctx = kerberos.new_context(&cred, &spn).await.unwrap();
        assert_eq!(ctx.initiate().await.unwrap(), b"init:HTTP/backend@EXAMPLE.COM");
        assert_eq!(ctx.continue_with(b"abc").await.unwrap(), Some(b"cont:abc".to_vec()));
        assert_eq!(ctx.continue_with(b"mutual").await.unwrap(), None);
        assert!(ctx.is_established());
        assert!(ctx.continue_with(b"reject").await.is_err());

        assert_eq!(kerberos.context_count(), 1);
        assert_eq!(kerberos.token_count(), 1);
        assert_eq!(kerberos.continuation_count(), 3);
    }

    #[tokio::test]
    async fn test_fork_starts_unestablished_without_new_context() {
        let kerberos = MockKerberos::new();
        let cred = kerberos.login(&identity()).await.unwrap();
        let mut ctx = kerberos
            .new_context(&cred, &Spn::new("HTTP/backend@EXAMPLE.COM"))
            .await
            .unwrap();
        ctx.initiate().await.unwrap();
        ctx.continue_with(b"mutual").await.unwrap();

        let mut forked = ctx.fork();
        assert!(!forked.is_established());
        assert_eq!(forked.expiry(), ctx.expiry());
        assert_eq!(forked.initiate().await.unwrap(), b"init:HTTP/backend@EXAMPLE.COM");
        assert!(forked.continue_with(b"reject-mutual").await.is_err());
        assert!(ctx.is_established());

        assert_eq!(kerberos.context_count(), 1);
        assert_eq!(kerberos.token_count(), 2);
    }

    #[tokio::test]
    async fn test_scheduled_login_failures() {
        let kerberos = MockKerberos::new();
        kerberos.fail_next_logins(2);

        assert!(kerberos.login(&identity()).await.is_err());
        assert!(kerberos.login(&identity()).await.is_err());
        let cred = kerberos.login(&identity()).await.unwrap();

        assert_eq!(cred.ticket.downcast_ref::<MockTicket>(), Some(&MockTicket { serial: 3 }));
        assert_eq!(kerberos.login_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credential_cannot_open_context() {
        let kerberos = MockKerberos::new().with_ticket_lifetime(Duration::from_secs(60));
        let cred = kerberos.login(&identity()).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        let result = kerberos.new_context(&cred, &Spn::new("HTTP/a@R")).await;
        assert!(matches!(result, Err(KerberosError::Kdc(_))));
    }
}
