//! Concurrent exchanges: context sharing and renewal under load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::Full;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use spnego_proxy_core::config::AuthConfig;
use spnego_proxy_core::context::{ContextCache, NegotiationState};
use spnego_proxy_core::error::ProxyError;
use spnego_proxy_core::identity::{CredentialRenewer, IdentityStore, RenewalPolicy};
use spnego_proxy_core::negotiation::{NegotiationEngine, Verdict};
use spnego_proxy_core::spn::Spn;
use spnego_proxy_core::testing::{
    responses, MockBackend, MockKerberos, ProxyTestHarness, RecordedRequest,
};

#[tokio::test]
async fn test_concurrent_requests_share_one_context() {
    let harness = ProxyTestHarness::new().await;

    let paths: Vec<String> = (0..16).map(|i| format!("/item/{i}")).collect();
    let responses = join_all(paths.iter().map(|p| harness.get(p))).await;

    assert!(responses.iter().all(|r| r.status == StatusCode::OK));
    assert_eq!(harness.kerberos.context_count(), 1);
    assert_eq!(harness.kerberos.token_count(), 16);
    assert_eq!(harness.backend.call_count().await, 16);
    assert_eq!(harness.cache().established_count(), 1);

    harness.shutdown().await;
}

struct Fixture {
    kerberos: Arc<MockKerberos>,
    identity: Arc<IdentityStore>,
    cache: Arc<ContextCache>,
    engine: Arc<NegotiationEngine>,
}

async fn fixture() -> Fixture {
    let auth = AuthConfig::new("/etc/proxy.keytab", "EXAMPLE.COM");
    let kerberos = Arc::new(
        MockKerberos::new()
            .with_ticket_lifetime(Duration::from_secs(600))
            .with_login_delay(Duration::from_millis(50)),
    );
    let identity = Arc::new(
        IdentityStore::initialize(
            auth.identity(),
            kerberos.clone(),
            RenewalPolicy::from_config(&auth),
        )
        .await
        .unwrap(),
    );

    Fixture {
        cache: Arc::new(ContextCache::new(auth.renewal_margin())),
        engine: Arc::new(NegotiationEngine::new(kerberos.clone(), Arc::clone(&identity))),
        kerberos,
        identity,
    }
}

/// One single-round exchange against `spn` without a network backend.
async fn exchange(
    cache: Arc<ContextCache>,
    engine: Arc<NegotiationEngine>,
    spn: Spn,
) -> Result<(), ProxyError> {
    let mut lease = cache.acquire(&spn).await;
    engine.begin(&mut lease).await?;
    engine.mark_sent(&mut lease);

    match engine.conclude(&mut lease, StatusCode::OK, &HeaderMap::new(), 0).await {
        Verdict::Accepted => {
            lease.commit();
            Ok(())
        }
        Verdict::Rejected(e) => Err(e.into()),
        Verdict::Continue(_) => unreachable!("200 never continues"),
    }
}

fn spawn_exchanges(f: &Fixture, count: usize) -> Vec<JoinHandle<Result<(), ProxyError>>> {
    (0..count)
        .map(|i| {
            let spn = Spn::new(format!("HTTP/node{i}.example.com@EXAMPLE.COM"));
            tokio::spawn(exchange(Arc::clone(&f.cache), Arc::clone(&f.engine), spn))
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_inline_renewal_during_concurrent_exchanges() {
    let f = fixture().await;

    // Credential is now inside the 300s margin.
    tokio::time::advance(Duration::from_secs(301)).await;

    for task in spawn_exchanges(&f, 10) {
        task.await.unwrap().unwrap();
    }

    assert_eq!(f.kerberos.login_count(), 2);
    assert_eq!(f.kerberos.context_count(), 10);
    assert_eq!(f.cache.established_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_background_renewal_during_concurrent_exchanges() {
    let f = fixture().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let renewer = tokio::spawn(CredentialRenewer::new(Arc::clone(&f.identity), shutdown_rx).run());

    // Land the exchanges exactly on the renewal deadline.
    tokio::time::sleep_until(f.identity.renewal_deadline().await).await;

    for task in spawn_exchanges(&f, 10) {
        task.await.unwrap().unwrap();
    }

    assert_eq!(f.kerberos.login_count(), 2);
    assert_eq!(f.cache.established_count(), 10);

    shutdown_tx.send(true).unwrap();
    assert!(renewer.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_renewal_fails_exchanges_as_ticket_expired() {
    let f = fixture().await;
    f.kerberos.fail_all_logins(true);
    tokio::time::advance(Duration::from_secs(301)).await;

    for task in spawn_exchanges(&f, 3) {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::TicketExpired(_)), "{err:?}");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    assert_eq!(f.cache.established_count(), 0);
}

fn spawn_get(harness: &ProxyTestHarness, path: &str) -> JoinHandle<StatusCode> {
    let executor = Arc::clone(&harness.executor);
    let request = Request::get(path).body(Full::new(Bytes::new())).unwrap();
    tokio::spawn(async move { executor.handle(request, None).await.status() })
}

async fn wait_for_calls(backend: &MockBackend, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.call_count().await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_cancelled_reuse_keeps_established_context() {
    let harness = ProxyTestHarness::new().await;
    assert_eq!(harness.get("/warm").await.status, StatusCode::OK);

    harness.backend.hold_requests(true);
    let abandoned = spawn_get(&harness, "/abandoned");
    wait_for_calls(&harness.backend, 2).await;
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());
    harness.backend.hold_requests(false);

    assert_eq!(harness.get("/after").await.status, StatusCode::OK);
    assert_eq!(harness.kerberos.context_count(), 1);
    assert_eq!(harness.cache().established_count(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_handshake_releases_waiting_exchange() {
    let harness = ProxyTestHarness::new().await;
    harness.backend.hold_requests(true);

    let first = spawn_get(&harness, "/first");
    wait_for_calls(&harness.backend, 1).await;

    // Queued behind the first exchange's lease.
    let second = spawn_get(&harness, "/second");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.backend.call_count().await, 1);

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    harness.backend.hold_requests(false);

    assert_eq!(second.await.unwrap(), StatusCode::OK);
    assert_eq!(harness.kerberos.context_count(), 2);
    assert_eq!(harness.cache().established_count(), 1);
    assert_eq!(
        harness.cache().status(&harness.backend_spn()).unwrap().state,
        NegotiationState::Accepted
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_refused_reuse_keeps_context_established_meanwhile() {
    let harness = ProxyTestHarness::new().await;
    let spn = harness.backend_spn();
    assert_eq!(harness.get("/warm").await.status, StatusCode::OK);
    let stale = harness.cache().status(&spn).unwrap().generation;

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    harness
        .set_backend_handler(Arc::new(move |_: &RecordedRequest| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                responses::unauthorized()
            } else {
                responses::ok("fresh")
            }
        }))
        .await;

    harness.backend.hold_requests(true);
    let refused = spawn_get(&harness, "/refused");
    wait_for_calls(&harness.backend, 2).await;

    // Another exchange replaces the context while the refusal is in flight.
    harness.cache().invalidate(&spn, stale).await;
    let engine = NegotiationEngine::new(harness.kerberos.clone(), Arc::clone(&harness.identity));
    let mut lease = harness.cache().acquire(&spn).await;
    assert!(!lease.is_reused());
    engine.begin(&mut lease).await.unwrap();
    engine.mark_sent(&mut lease);
    assert!(matches!(
        engine.conclude(&mut lease, StatusCode::OK, &HeaderMap::new(), 0).await,
        Verdict::Accepted
    ));
    let replacement = lease.generation();
    lease.commit();

    harness.backend.hold_requests(false);

    assert_eq!(refused.await.unwrap(), StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.backend.call_count().await, 3);
    assert_eq!(harness.kerberos.context_count(), 2);

    let status = harness.cache().status(&spn).unwrap();
    assert_eq!(status.state, NegotiationState::Accepted);
    assert_eq!(status.generation, replacement);

    harness.shutdown().await;
}
