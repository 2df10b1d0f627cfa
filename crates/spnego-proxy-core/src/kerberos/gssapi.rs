//! Production Kerberos backend over the system GSSAPI library.
//!
//! The library is driven entirely through its environment:
//!
//! - `KRB5_CONFIG` points at the configured krb5.conf
//! - `KRB5_CLIENT_KTNAME` lets initiator credentials be obtained from the keytab
//! - `KRB5CCNAME` keeps every ticket in a process-local `MEMORY:` cache
//!
//! [`GssapiKerberos::configure_environment`] sets these once, before the
//! async runtime starts any threads.

use std::fs::File;
use std::time::Duration;

use async_trait::async_trait;
use libgssapi::context::{ClientCtx, CtxFlags, SecurityContext};
use libgssapi::credential::{Cred, CredUsage};
use libgssapi::name::Name;
use libgssapi::oid::{OidSet, GSS_MECH_SPNEGO, GSS_NT_KRB5_PRINCIPAL};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ContextHandle, Credential, Identity, KerberosClient, KerberosError, TicketMaterial};
use crate::error::CredentialInitError;
use crate::spn::Spn;

const MEMORY_CCACHE: &str = "MEMORY:spnego-proxy";

/// Ticket material of the GSSAPI backend: the tickets themselves stay in the
/// library's memory cache, so only the principal is carried around.
#[derive(Debug, Clone)]
struct GssTicket {
    principal: String,
}

/// [`KerberosClient`] backed by `libgssapi`.
#[derive(Debug, Default)]
pub struct GssapiKerberos;

impl GssapiKerberos {
    /// Check the identity's files and point the Kerberos library at them.
    ///
    /// Must run before the tokio runtime is built: it mutates the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the keytab or the krb5 configuration cannot be read.
    pub fn configure_environment(identity: &Identity) -> Result<Self, CredentialInitError> {
        File::open(&identity.keytab_path).map_err(|e| CredentialInitError::Keytab {
            path: identity.keytab_path.display().to_string(),
            message: e.to_string(),
        })?;
        File::open(&identity.kerberos_config_path).map_err(|e| {
            CredentialInitError::KerberosConfig {
                path: identity.kerberos_config_path.display().to_string(),
                message: e.to_string(),
            }
        })?;

        std::env::set_var("KRB5_CONFIG", &identity.kerberos_config_path);
        std::env::set_var(
            "KRB5_CLIENT_KTNAME",
            format!("FILE:{}", identity.keytab_path.display()),
        );
        std::env::set_var("KRB5CCNAME", MEMORY_CCACHE);

        if identity.disable_pa_fx_fast {
            // MIT krb5 only offers FAST when an armor ccache is configured, which
            // this backend never does.
            warn!("disable_pa_fx_fast has no effect with the system GSSAPI library");
        }

        info!(
            principal = %identity.principal_name(),
            keytab = %identity.keytab_path.display(),
            krb5_config = %identity.kerberos_config_path.display(),
            "configured gssapi environment"
        );
        Ok(Self)
    }
}

fn gss_err(e: libgssapi::error::Error) -> KerberosError {
    KerberosError::Gss(e.to_string())
}

fn spnego_mechs() -> Result<OidSet, KerberosError> {
    let mut mechs = OidSet::new().map_err(gss_err)?;
    mechs.add(&GSS_MECH_SPNEGO).map_err(gss_err)?;
    Ok(mechs)
}

fn acquire_initiator(principal: &str) -> Result<Cred, KerberosError> {
    let name = Name::new(principal.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL)).map_err(gss_err)?;
    let mechs = spnego_mechs()?;
    Cred::acquire(Some(&name), None, CredUsage::Initiate, Some(&mechs))
        .map_err(|e| KerberosError::Kdc(e.to_string()))
}

#[async_trait]
impl KerberosClient for GssapiKerberos {
    async fn login(&self, identity: &Identity) -> Result<Credential, KerberosError> {
        let principal = identity.principal_name();
        let lifetime = blocking({
            let principal = principal.clone();
            move || -> Result<Duration, KerberosError> {
                let cred = acquire_initiator(&principal)?;
                Ok(cred.info().map_err(gss_err)?.lifetime)
            }
        })
        .await?;

        debug!(principal = %principal, lifetime_secs = lifetime.as_secs(), "acquired initiator credential");
        Ok(Credential::new(lifetime, TicketMaterial::new(GssTicket { principal })))
    }

    async fn new_context(
        &self,
        credential: &Credential,
        spn: &Spn,
    ) -> Result<Box<dyn ContextHandle>, KerberosError> {
        let ticket = credential
            .ticket
            .downcast_ref::<GssTicket>()
            .ok_or_else(|| KerberosError::Gss("credential not issued by gssapi backend".into()))?;

        Ok(Box::new(GssContext {
            principal: ticket.principal.clone(),
            target: spn.as_str().to_string(),
            ctx: None,
            expires_at: None,
        }))
    }
}

/// Run a blocking library call on the blocking pool.
async fn blocking<T, F>(call: F) -> Result<T, KerberosError>
where
    F: FnOnce() -> Result<T, KerberosError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| KerberosError::Gss(format!("gssapi task failed: {e}")))?
}

fn context_expiry(ctx: &mut ClientCtx) -> Option<Instant> {
    ctx.lifetime().ok().map(|lifetime| Instant::now() + lifetime)
}

/// A SPNEGO client context. Every `initiate` starts a new library context;
/// once the first one has obtained the service ticket, later ones are served
/// from the memory cache.
struct GssContext {
    principal: String,
    target: String,
    ctx: Option<ClientCtx>,
    expires_at: Option<Instant>,
}

#[async_trait]
impl ContextHandle for GssContext {
    async fn initiate(&mut self) -> Result<Vec<u8>, KerberosError> {
        let principal = self.principal.clone();
        let target = self.target.clone();

        let (ctx, token, expires_at) = blocking(move || {
            let cred = acquire_initiator(&principal)?;
            let target =
                Name::new(target.as_bytes(), Some(&GSS_NT_KRB5_PRINCIPAL)).map_err(gss_err)?;
            let mut ctx = ClientCtx::new(
                Some(cred),
                target,
                CtxFlags::GSS_C_MUTUAL_FLAG,
                Some(&GSS_MECH_SPNEGO),
            );

            let token = ctx
                .step(None, None)
                .map_err(gss_err)?
                .ok_or_else(|| KerberosError::Gss("no initial token produced".into()))?
                .to_vec();
            let expires_at = context_expiry(&mut ctx);
            Ok((ctx, token, expires_at))
        })
        .await?;

        self.ctx = Some(ctx);
        self.expires_at = expires_at.or(self.expires_at);
        Ok(token)
    }

    async fn continue_with(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>, KerberosError> {
        let mut ctx = self
            .ctx
            .take()
            .ok_or_else(|| KerberosError::Gss("context was never initiated".into()))?;
        let challenge = challenge.to_vec();

        let (ctx, next, expires_at) = blocking(move || {
            let next = ctx
                .step(Some(&challenge), None)
                .map_err(gss_err)?
                .map(|buf| buf.to_vec());
            let expires_at = context_expiry(&mut ctx);
            Ok((ctx, next, expires_at))
        })
        .await?;

        self.ctx = Some(ctx);
        self.expires_at = expires_at.or(self.expires_at);
        Ok(next)
    }

    fn fork(&self) -> Box<dyn ContextHandle> {
        Box::new(GssContext {
            principal: self.principal.clone(),
            target: self.target.clone(),
            ctx: None,
            expires_at: self.expires_at,
        })
    }

    fn is_established(&self) -> bool {
        self.ctx.as_ref().is_some_and(ClientCtx::is_complete)
    }

    fn expiry(&self) -> Option<Instant> {
        self.expires_at
    }
}
