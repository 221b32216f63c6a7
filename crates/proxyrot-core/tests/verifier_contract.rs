//! Contract Test: Outbound Verification
//!
//! Constraints verified:
//! - A successful probe caches the observed IP on the port
//! - The probe is retried up to the configured attempts
//! - Probe failures never fail or undo a rotation
//! - Manual verification is owner-only

mod common;

use common::*;
use proxyrot_core::model::UserId;
use proxyrot_core::traits::PortStore;
use proxyrot_core::{ErrorKind, MemoryStore, RotationEvent};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_test::{assert_err, assert_ok};

async fn setup() -> (Arc<MemoryStore>, ScriptedProxyHost) {
    let store = Arc::new(MemoryStore::new());
    let host = ScriptedProxyHost::new();
    let ana = user(1, "ana");
    seed_pool(store.as_ref(), &["100.64.0.2", "100.64.0.3"]).await;
    seed_port(store.as_ref(), &host, &ana, 1000, Some("100.64.0.2")).await;
    (store, host)
}

#[tokio::test]
async fn successful_probe_records_observed_ip() {
    let (store, host) = setup().await;
    let (probe, calls) = FixedProbe::new(ip("203.0.113.7"));

    let mut h = harness(store.clone(), host, Some(Box::new(probe)));

    let outcome = assert_ok!(h.engine.rotate(1000, UserId(1)).await);
    assert_eq!(outcome.observed_ip, Some(ip("203.0.113.7")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let port = store.get_port(1000).await.unwrap().unwrap();
    assert_eq!(port.observed_ip, Some(ip("203.0.113.7")));

    let events = drain(&mut h.events);
    assert!(events.contains(&RotationEvent::Verified {
        port: 1000,
        observed_ip: Some(ip("203.0.113.7")),
    }));
}

#[tokio::test]
async fn probe_is_retried_until_it_answers() {
    let (store, host) = setup().await;
    let (probe, calls) = FlakyProbe::new(2, ip("203.0.113.9"));

    let h = harness(store, host, Some(Box::new(probe)));

    let outcome = assert_ok!(h.engine.rotate(1000, UserId(1)).await);
    assert_eq!(outcome.observed_ip, Some(ip("203.0.113.9")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn failing_probe_never_fails_rotation() {
    let (store, host) = setup().await;

    // Observed IP from an earlier verification
    store.set_observed_ip(1000, ip("203.0.113.1")).await.unwrap();

    let (probe, calls) = FlakyProbe::new(usize::MAX, ip("203.0.113.9"));
    let h = harness(store.clone(), host, Some(Box::new(probe)));

    let outcome = assert_ok!(h.engine.rotate(1000, UserId(1)).await);
    assert_eq!(outcome.new_address, ip("100.64.0.3"));
    assert_eq!(outcome.observed_ip, None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // Binding committed, stale observed IP left in place
    let port = store.get_port(1000).await.unwrap().unwrap();
    assert_eq!(port.bound_address, Some(ip("100.64.0.3")));
    assert_eq!(port.observed_ip, Some(ip("203.0.113.1")));
}

#[tokio::test]
async fn manual_verify_is_owner_only() {
    let (store, host) = setup().await;
    let (probe, calls) = FixedProbe::new(ip("203.0.113.7"));
    let h = harness(store, host.clone(), Some(Box::new(probe)));

    let err = assert_err!(h.engine.verify(1000, UserId(2)).await);
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let observed = assert_ok!(h.engine.verify(1000, UserId(1)).await);
    assert_eq!(observed, Some(ip("203.0.113.7")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Verification never touches the remote host
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn manual_verify_without_probe_is_config_error() {
    let (store, host) = setup().await;
    let h = harness(store, host, None);

    let err = assert_err!(h.engine.verify(1000, UserId(1)).await);
    assert!(matches!(err, proxyrot_core::Error::Config(_)));
}
