//! SPNEGO handshake state machine.
//!
//! The engine works on a leased [`SecurityContext`](crate::context::SecurityContext)
//! and never talks to the backend itself: the forwarding executor sends each
//! token and hands the response back through [`NegotiationEngine::conclude`].

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::header::WWW_AUTHENTICATE;
use http::{HeaderMap, StatusCode};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::context::{ContextLease, NegotiationState};
use crate::error::{NegotiationError, ProxyError};
use crate::identity::IdentityStore;
use crate::kerberos::{ContextHandle, KerberosClient, KerberosError};
use crate::spn::Spn;

/// Continuation rounds allowed after the initial token.
pub const MAX_CONTINUATION_ROUNDS: u32 = 3;

const SCHEME: &str = "negotiate";

/// What a response's `WWW-Authenticate` headers say about Negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// No Negotiate challenge at all.
    Absent,
    /// `Negotiate` without a token.
    Bare,
    /// `Negotiate <base64>`, decoded.
    Token(Vec<u8>),
    /// `Negotiate <garbage>`.
    Malformed,
}

/// Extract the Negotiate challenge from response headers.
///
/// Every `WWW-Authenticate` value is split into its comma-separated
/// challenges; the scheme name is matched case-insensitively. A token wins
/// over a bare or malformed challenge.
#[must_use]
pub fn parse_challenge(headers: &HeaderMap) -> Challenge {
    let mut found = Challenge::Absent;

    for value in headers.get_all(WWW_AUTHENTICATE) {
        let Ok(value) = value.to_str() else {
            continue;
        };

        for part in value.split(',') {
            let part = part.trim();
            let Some(head) = part.get(..SCHEME.len()) else {
                continue;
            };
            if !head.eq_ignore_ascii_case(SCHEME) {
                continue;
            }

            let rest = &part[SCHEME.len()..];
            if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
                // e.g. "NegotiateFoo"
                continue;
            }

            let token = rest.trim();
            if token.is_empty() {
                if found == Challenge::Absent {
                    found = Challenge::Bare;
                }
                continue;
            }

            match STANDARD.decode(token) {
                Ok(bytes) if !bytes.is_empty() => return Challenge::Token(bytes),
                _ => found = Challenge::Malformed,
            }
        }
    }

    found
}

/// Outcome of one backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Backend accepted; the context is established.
    Accepted,
    /// Backend sent a continuation token for the next round.
    Continue(Vec<u8>),
    /// The exchange failed.
    Rejected(NegotiationError),
}

/// A token minted from an established context for one exchange.
///
/// It carries its own library context so the backend's answer is verified
/// against the token actually sent, after the lease has been released.
pub struct MintedToken {
    /// Base64 token for the `Authorization` header.
    pub token: String,
    /// Generation of the context it was minted from.
    pub generation: u64,
    spn: Spn,
    handle: Box<dyn ContextHandle>,
}

impl MintedToken {
    #[must_use]
    pub fn spn(&self) -> &Spn {
        &self.spn
    }
}

/// Drives the handshake for leased contexts.
pub struct NegotiationEngine {
    kerberos: Arc<dyn KerberosClient>,
    identity: Arc<IdentityStore>,
    max_rounds: u32,
}

impl NegotiationEngine {
    #[must_use]
    pub fn new(kerberos: Arc<dyn KerberosClient>, identity: Arc<IdentityStore>) -> Self {
        Self {
            kerberos,
            identity,
            max_rounds: MAX_CONTINUATION_ROUNDS,
        }
    }

    #[must_use]
    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    #[must_use]
    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    /// Start a handshake on the leased context and produce its first token,
    /// base64-encoded.
    ///
    /// Whatever the lease held before is replaced by a new library context
    /// opened from the current credential.
    ///
    /// # Errors
    ///
    /// Returns `TicketExpired` if no usable credential is left, or a
    /// `TokenGeneration` negotiation error if the library refuses.
    pub async fn begin(&self, lease: &mut ContextLease) -> Result<String, ProxyError> {
        let credential = self.identity.current_credential().await?;
        let spn = lease.spn().clone();

        let mut handle = self
            .kerberos
            .new_context(&credential, &spn)
            .await
            .map_err(|e| token_error(&spn, 0, &e))?;
        let token = handle
            .initiate()
            .await
            .map_err(|e| token_error(&spn, 0, &e))?;

        lease.handle = Some(handle);
        lease.credential_expires_at = Some(credential.expires_at);
        lease.state = NegotiationState::TokenGenerated;
        debug!(spn = %spn, generation = lease.generation(), "generated initial token");

        Ok(STANDARD.encode(token))
    }

    /// Mint a token for one exchange from an established context.
    ///
    /// The leased context itself is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `TicketExpired` if no usable credential is left, or a
    /// `TokenGeneration` negotiation error if the context cannot mint.
    pub async fn mint(&self, lease: &mut ContextLease) -> Result<MintedToken, ProxyError> {
        self.identity.current_credential().await?;
        let spn = lease.spn().clone();

        let mut handle = match lease.handle.as_ref() {
            Some(established) if lease.is_established() => established.fork(),
            _ => {
                return Err(NegotiationError::TokenGeneration {
                    spn: spn.to_string(),
                    round: 0,
                    message: "context is not established".to_string(),
                }
                .into())
            }
        };
        let token = handle
            .initiate()
            .await
            .map_err(|e| token_error(&spn, 0, &e))?;
        trace!(spn = %spn, generation = lease.generation(), "minted token from established context");

        Ok(MintedToken {
            token: STANDARD.encode(token),
            generation: lease.generation(),
            spn,
            handle,
        })
    }

    /// Check the backend's non-401 answer to a minted token.
    ///
    /// # Errors
    ///
    /// Returns `MutualAuth` if the final token does not verify.
    pub async fn verify_minted(
        &self,
        minted: &mut MintedToken,
        headers: &HeaderMap,
    ) -> Result<(), NegotiationError> {
        verify_final(Some(minted.handle.as_mut()), &minted.spn, 0, headers).await
    }

    /// Feed a continuation challenge and produce the next token.
    ///
    /// # Errors
    ///
    /// Returns an error if the library rejects the challenge or has nothing
    /// more to send.
    pub async fn step(
        &self,
        lease: &mut ContextLease,
        challenge: &[u8],
        round: u32,
    ) -> Result<String, NegotiationError> {
        let spn = lease.spn().to_string();
        lease.state = NegotiationState::ContinueChallenge;

        let handle = lease.handle.as_mut().ok_or_else(|| NegotiationError::TokenGeneration {
            spn: spn.clone(),
            round,
            message: "context has no handle".to_string(),
        })?;

        match handle.continue_with(challenge).await {
            Ok(Some(token)) => {
                lease.state = NegotiationState::TokenGenerated;
                debug!(spn = %spn, round, "generated continuation token");
                Ok(STANDARD.encode(token))
            }
            Ok(None) => {
                // The library is done but the backend is still challenging.
                lease.state = NegotiationState::Rejected;
                Err(NegotiationError::Rejected { spn, round })
            }
            Err(e) => {
                lease.state = NegotiationState::Rejected;
                Err(NegotiationError::TokenGeneration {
                    spn,
                    round,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Record that the current token is on its way to the backend.
    pub fn mark_sent(&self, lease: &mut ContextLease) {
        lease.state = NegotiationState::Sent;
    }

    /// Classify the backend's answer to the token sent in `round`.
    ///
    /// On acceptance the context becomes established, expiring at the
    /// earlier of its own lifetime and the credential's.
    pub async fn conclude(
        &self,
        lease: &mut ContextLease,
        status: StatusCode,
        headers: &HeaderMap,
        round: u32,
    ) -> Verdict {
        let spn = lease.spn().clone();

        if status == StatusCode::UNAUTHORIZED {
            let error = match parse_challenge(headers) {
                Challenge::Token(token) if round < self.max_rounds => {
                    lease.state = NegotiationState::ContinueChallenge;
                    return Verdict::Continue(token);
                }
                Challenge::Token(_) => NegotiationError::RoundsExhausted {
                    spn: spn.to_string(),
                    rounds: self.max_rounds,
                },
                Challenge::Malformed => NegotiationError::MalformedChallenge {
                    spn: spn.to_string(),
                    round,
                },
                Challenge::Absent | Challenge::Bare => NegotiationError::Rejected {
                    spn: spn.to_string(),
                    round,
                },
            };
            lease.state = NegotiationState::Rejected;
            return Verdict::Rejected(error);
        }

        let handle = lease.handle.as_mut().map(|h| h.as_mut());
        if let Err(e) = verify_final(handle, &spn, round, headers).await {
            lease.state = NegotiationState::Rejected;
            return Verdict::Rejected(e);
        }

        let now = Instant::now();
        let credential_expiry = lease.credential_expires_at.unwrap_or(now);
        let context_expiry = lease
            .handle
            .as_ref()
            .and_then(|h| h.expiry())
            .unwrap_or(credential_expiry);

        lease.state = NegotiationState::Accepted;
        lease.established_at = Some(now);
        lease.expires_at = Some(context_expiry.min(credential_expiry));
        debug!(spn = %spn, round, status = status.as_u16(), "negotiation accepted");

        Verdict::Accepted
    }
}

/// Feed a final `WWW-Authenticate: Negotiate` token on an accepted response
/// to the context.
///
/// A response without a token is accepted on its status alone; once a token
/// is fed, the library has to report the context complete.
async fn verify_final(
    handle: Option<&mut (dyn ContextHandle + 'static)>,
    spn: &Spn,
    round: u32,
    headers: &HeaderMap,
) -> Result<(), NegotiationError> {
    let mutual_auth = |message: String| {
        warn!(spn = %spn, round, error = %message, "mutual authentication failed");
        NegotiationError::MutualAuth {
            spn: spn.to_string(),
            message,
        }
    };

    let token = match parse_challenge(headers) {
        Challenge::Token(token) => token,
        Challenge::Malformed => return Err(mutual_auth("malformed final token".to_string())),
        Challenge::Absent | Challenge::Bare => return Ok(()),
    };
    let Some(handle) = handle else {
        return Err(mutual_auth("no context to verify the final token".to_string()));
    };

    match handle.continue_with(&token).await {
        Err(e) => Err(mutual_auth(e.to_string())),
        Ok(Some(_)) => Err(mutual_auth("context wants another round after acceptance".to_string())),
        Ok(None) if !handle.is_established() => {
            Err(mutual_auth("context incomplete after final token".to_string()))
        }
        Ok(None) => Ok(()),
    }
}

fn token_error(spn: &Spn, round: u32, e: &KerberosError) -> NegotiationError {
    NegotiationError::TokenGeneration {
        spn: spn.to_string(),
        round,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::HeaderValue;

    /// Answers every challenge the same way.
    struct Scripted {
        reply: Result<Option<Vec<u8>>, KerberosError>,
        completes: bool,
        established: bool,
    }

    impl Scripted {
        fn new(reply: Result<Option<Vec<u8>>, KerberosError>, completes: bool) -> Self {
            Self {
                reply,
                completes,
                established: false,
            }
        }
    }

    #[async_trait]
    impl ContextHandle for Scripted {
        async fn initiate(&mut self) -> Result<Vec<u8>, KerberosError> {
            Ok(b"tok".to_vec())
        }

        async fn continue_with(&mut self, _: &[u8]) -> Result<Option<Vec<u8>>, KerberosError> {
            self.established = self.completes;
            self.reply.clone()
        }

        fn fork(&self) -> Box<dyn ContextHandle> {
            Box::new(Self::new(self.reply.clone(), self.completes))
        }

        fn is_established(&self) -> bool {
            self.established
        }

        fn expiry(&self) -> Option<Instant> {
            None
        }
    }

    async fn verify(handle: &mut Scripted, values: &[&str]) -> Result<(), NegotiationError> {
        let handle: &mut (dyn ContextHandle + 'static) = handle;
        verify_final(Some(handle), &Spn::new("HTTP/web@R"), 0, &headers(values)).await
    }

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(WWW_AUTHENTICATE, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_absent() {
        assert_eq!(parse_challenge(&HeaderMap::new()), Challenge::Absent);
        assert_eq!(
            parse_challenge(&headers(&["Basic realm=\"x\""])),
            Challenge::Absent
        );
    }

    #[test]
    fn test_parse_bare() {
        assert_eq!(parse_challenge(&headers(&["Negotiate"])), Challenge::Bare);
        assert_eq!(
            parse_challenge(&headers(&["Basic realm=\"x\", negotiate"])),
            Challenge::Bare
        );
    }

    #[test]
    fn test_parse_token_case_insensitive() {
        let encoded = STANDARD.encode(b"srvTok1");
        let challenge = parse_challenge(&headers(&[&format!("NEGOTIATE {encoded}")]));
        assert_eq!(challenge, Challenge::Token(b"srvTok1".to_vec()));
    }

    #[test]
    fn test_parse_token_across_headers() {
        let encoded = STANDARD.encode(b"srvTok1");
        let challenge = parse_challenge(&headers(&[
            "Negotiate",
            &format!("Basic realm=\"r\", Negotiate {encoded}"),
        ]));
        assert_eq!(challenge, Challenge::Token(b"srvTok1".to_vec()));
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(
            parse_challenge(&headers(&["Negotiate !!!not-base64"])),
            Challenge::Malformed
        );
    }

    #[test]
    fn test_scheme_prefix_must_be_whole_word() {
        assert_eq!(
            parse_challenge(&headers(&["NegotiateX abc"])),
            Challenge::Absent
        );
    }

    #[tokio::test]
    async fn test_final_token_completing_context_verifies() {
        let mut handle = Scripted::new(Ok(None), true);
        let token = STANDARD.encode(b"mutual");
        assert!(verify(&mut handle, &[&format!("Negotiate {token}")]).await.is_ok());
    }

    #[tokio::test]
    async fn test_no_final_token_accepts_on_status() {
        let mut handle = Scripted::new(Err(KerberosError::Gss("unused".into())), false);
        assert!(verify(&mut handle, &[]).await.is_ok());
        assert!(verify(&mut handle, &["Negotiate"]).await.is_ok());
    }

    #[tokio::test]
    async fn test_final_token_failures_are_mutual_auth() {
        let token = STANDARD.encode(b"srv");
        let header = format!("Negotiate {token}");

        let mut refused = Scripted::new(Err(KerberosError::Gss("bad mic".into())), false);
        let mut wants_more = Scripted::new(Ok(Some(b"more".to_vec())), false);
        let mut incomplete = Scripted::new(Ok(None), false);

        for handle in [&mut refused, &mut wants_more, &mut incomplete] {
            let err = verify(handle, &[&header]).await.unwrap_err();
            assert!(matches!(err, NegotiationError::MutualAuth { .. }), "{err:?}");
        }

        let mut any = Scripted::new(Ok(None), true);
        let err = verify(&mut any, &["Negotiate !!!"]).await.unwrap_err();
        assert_eq!(err.kind(), "mutual_auth");
    }

    #[tokio::test]
    async fn test_final_token_without_context_is_mutual_auth() {
        let token = STANDARD.encode(b"srv");
        let result = verify_final(
            None,
            &Spn::new("HTTP/web@R"),
            1,
            &headers(&[&format!("Negotiate {token}")]),
        )
        .await;
        assert!(matches!(result, Err(NegotiationError::MutualAuth { .. })));
    }
}
