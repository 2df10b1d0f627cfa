//! Negotiation tests through a running proxy.
//!
//! The backend and Kerberos library are the scripted mocks from
//! `spnego_proxy_core::testing`, so the tokens on the wire are readable:
//! `init:<spn>` for an initial token and `cont:<challenge>` for a
//! continuation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::header::WWW_AUTHENTICATE;
use http::{HeaderValue, StatusCode};

use spnego_proxy_core::context::NegotiationState;
use spnego_proxy_core::testing::{
    responses, MockKerberos, ProxyTestHarness, RecordedRequest, TestHarnessBuilder,
};

const BACKEND_SPN: &str = "HTTP/127.0.0.1@EXAMPLE.COM";

fn token_text(request: &RecordedRequest) -> String {
    request.negotiate_text().unwrap_or_default()
}

#[tokio::test]
async fn test_single_round_accept() {
    let harness = ProxyTestHarness::new().await;

    let response = harness.get("/status").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "ok");

    let calls = harness.backend.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(token_text(&calls[0]), format!("init:{BACKEND_SPN}"));

    let status = harness.cache().status(&harness.backend_spn()).unwrap();
    assert_eq!(status.state, NegotiationState::Accepted);
    assert!(status.expires_at.is_some());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_continuation_challenge_then_accept() {
    let harness = TestHarnessBuilder::new()
        .backend_handler(Arc::new(|request: &RecordedRequest| {
            match token_text(request).as_str() {
                t if t.starts_with("init:") => responses::challenge(b"srvTok1"),
                "cont:srvTok1" => responses::ok("payload"),
                _ => responses::unauthorized(),
            }
        }))
        .build()
        .await;

    let response = harness.get("/data").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "payload");
    assert_eq!(harness.backend.call_count().await, 2);
    assert_eq!(harness.kerberos.continuation_count(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_bare_401_fails_without_retry() {
    let harness = TestHarnessBuilder::new()
        .backend_handler(responses::always(StatusCode::UNAUTHORIZED))
        .build()
        .await;

    let response = harness.get("/data").await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.backend.call_count().await, 1);

    let status = harness.cache().status(&harness.backend_spn()).unwrap();
    assert_eq!(status.state, NegotiationState::Rejected);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_continuation_rounds_are_bounded() {
    let harness = TestHarnessBuilder::new()
        .backend_handler(Arc::new(|_: &RecordedRequest| responses::challenge(b"again")))
        .build()
        .await;

    let response = harness.get("/loop").await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    // Initial token plus three continuations.
    assert_eq!(harness.backend.call_count().await, 4);
    assert_eq!(harness.kerberos.continuation_count(), 3);

    let metrics = harness.metrics.encode().unwrap();
    assert!(metrics.contains("outcome=\"rounds_exhausted\""));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_mutual_authentication_token_is_verified() {
    let harness = TestHarnessBuilder::new()
        .backend_handler(Arc::new(|_: &RecordedRequest| {
            responses::accept_with_token(b"mutual", "secure")
        }))
        .build()
        .await;

    let response = harness.get("/secure").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "secure");
    assert_eq!(harness.kerberos.continuation_count(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_mutual_authentication_hides_backend_body() {
    let harness = TestHarnessBuilder::new()
        .backend_handler(Arc::new(|_: &RecordedRequest| {
            responses::accept_with_token(b"reject-mutual", "must not leak")
        }))
        .build()
        .await;

    let response = harness.get("/secure").await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert!(!response.text().contains("must not leak"));

    let status = harness.cache().status(&harness.backend_spn()).unwrap();
    assert_eq!(status.state, NegotiationState::Rejected);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_reused_context_verifies_mutual_authentication() {
    let harness = TestHarnessBuilder::new()
        .backend_handler(Arc::new(|_: &RecordedRequest| {
            responses::accept_with_token(b"mutual", "secure")
        }))
        .build()
        .await;
    let spn = harness.backend_spn();

    assert_eq!(harness.get("/first").await.status, StatusCode::OK);
    let generation = harness.cache().status(&spn).unwrap().generation;

    let second = harness.get("/second").await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.text(), "secure");
    assert_eq!(harness.kerberos.context_count(), 1);
    assert_eq!(harness.kerberos.continuation_count(), 2);

    harness
        .set_backend_handler(Arc::new(|_: &RecordedRequest| {
            responses::accept_with_token(b"reject-mutual", "must not leak")
        }))
        .await;
    let forged = harness.get("/third").await;

    assert_eq!(forged.status, StatusCode::UNAUTHORIZED);
    assert!(!forged.text().contains("must not leak"));
    assert_eq!(harness.kerberos.context_count(), 1);
    assert_eq!(harness.kerberos.continuation_count(), 3);

    let status = harness.cache().status(&spn).unwrap();
    assert_eq!(status.state, NegotiationState::Rejected);
    assert_eq!(status.generation, generation);

    harness
        .set_backend_handler(Arc::new(|_: &RecordedRequest| {
            responses::accept_with_token(b"mutual", "recovered")
        }))
        .await;
    let recovered = harness.get("/fourth").await;
    assert_eq!(recovered.status, StatusCode::OK);
    assert_eq!(harness.kerberos.context_count(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_challenge_is_rejected() {
    let harness = TestHarnessBuilder::new()
        .backend_handler(Arc::new(|_: &RecordedRequest| {
            let mut response = responses::status(StatusCode::UNAUTHORIZED);
            response.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Negotiate !!!not-base64"),
            );
            response
        }))
        .build()
        .await;

    let response = harness.get("/data").await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.backend.call_count().await, 1);
    assert_eq!(harness.kerberos.continuation_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_token_generation_failure_never_reaches_backend() {
    let harness = ProxyTestHarness::new().await;
    harness.kerberos.fail_token_generation(true);

    let response = harness.get("/data").await;

    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(harness.backend.call_count().await, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_established_context_is_reused() {
    let harness = ProxyTestHarness::new().await;

    for _ in 0..3 {
        assert_eq!(harness.get("/data").await.status, StatusCode::OK);
    }

    assert_eq!(harness.kerberos.context_count(), 1);
    assert_eq!(harness.kerberos.token_count(), 3);
    assert_eq!(harness.backend.call_count().await, 3);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_refused_reuse_renegotiates() {
    let harness = ProxyTestHarness::new().await;
    assert_eq!(harness.get("/data").await.status, StatusCode::OK);
    let first = harness.cache().status(&harness.backend_spn()).unwrap();

    // The backend forgets the session once, then accepts again.
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    harness
        .set_backend_handler(Arc::new(move |_: &RecordedRequest| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                responses::unauthorized()
            } else {
                responses::ok("again")
            }
        }))
        .await;

    let response = harness.get("/data").await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "again");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.kerberos.context_count(), 2);

    let second = harness.cache().status(&harness.backend_spn()).unwrap();
    assert_eq!(second.state, NegotiationState::Accepted);
    assert!(second.generation > first.generation);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_context_inside_margin_is_not_reused() {
    // Contexts that live shorter than the 300s margin are never reusable.
    let harness = TestHarnessBuilder::new()
        .kerberos(MockKerberos::new().with_context_lifetime(Duration::from_secs(100)))
        .build()
        .await;

    assert_eq!(harness.get("/a").await.status, StatusCode::OK);
    assert_eq!(harness.get("/b").await.status, StatusCode::OK);

    assert_eq!(harness.kerberos.context_count(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_spn_mapping_override() {
    let harness = TestHarnessBuilder::new()
        .spn_mapping("127.0.0.1", "HTTP/namenode.internal@EXAMPLE.COM")
        .build()
        .await;

    assert_eq!(harness.get("/webhdfs/v1/").await.status, StatusCode::OK);

    let calls = harness.backend.calls().await;
    assert_eq!(token_text(&calls[0]), "init:HTTP/namenode.internal@EXAMPLE.COM");

    harness.shutdown().await;
}
