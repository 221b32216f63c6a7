//! Contract Test: Batch Rotation
//!
//! Constraints verified:
//! - Every owned port is attempted, one after another
//! - Recoverable failures are reported per port and do not stop the batch
//! - A ledger inconsistency aborts the batch immediately

mod common;

use common::*;
use proxyrot_core::model::UserId;
use proxyrot_core::traits::PortStore;
use proxyrot_core::{ErrorKind, MemoryStore};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn partial_success_reports_skipped_ports() {
    let store = Arc::new(MemoryStore::new());
    let host = ScriptedProxyHost::new();
    let ana = user(1, "ana");
    let bruno = user(2, "bruno");

    seed_pool(
        store.as_ref(),
        &["100.64.0.2", "100.64.0.3", "100.64.0.4", "100.64.0.5"],
    )
    .await;
    seed_port(store.as_ref(), &host, &ana, 1000, None).await;
    seed_port(store.as_ref(), &host, &ana, 1001, Some("100.64.0.2")).await;
    seed_port(store.as_ref(), &host, &ana, 1002, None).await;
    seed_port(store.as_ref(), &host, &bruno, 1003, Some("100.64.0.5")).await;

    let h = harness(store.clone(), host.clone(), None);

    // Start the cooldown on 1002 before the batch
    assert_ok!(h.engine.rotate(1002, UserId(1)).await);

    // One free address remains; the unbound port takes it, which frees nothing
    let report = assert_ok!(h.engine.rotate_all(UserId(1)).await);
    assert_eq!(report.rotated.len(), 1);
    assert_eq!(report.rotated[0].port, 1000);
    assert_eq!(report.rotated[0].previous_address, None);
    assert_eq!(report.rotated[0].new_address, ip("100.64.0.4"));
    assert_eq!(report.skipped.len(), 2);

    let exhausted = report.skipped.iter().find(|s| s.port == 1001).unwrap();
    assert_eq!(exhausted.reason, ErrorKind::PoolExhausted);

    let limited = report.skipped.iter().find(|s| s.port == 1002).unwrap();
    assert_eq!(limited.reason, ErrorKind::RateLimited);

    // Skipped port kept its binding
    let port = store.get_port(1001).await.unwrap().unwrap();
    assert_eq!(port.bound_address, Some(ip("100.64.0.2")));
}

#[tokio::test]
async fn user_without_ports_gets_empty_report() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(store, ScriptedProxyHost::new(), None);

    let report = assert_ok!(h.engine.rotate_all(UserId(9)).await);
    assert!(report.rotated.is_empty());
    assert!(report.skipped.is_empty());
}

#[tokio::test]
async fn rejected_port_does_not_stop_the_batch() {
    let store = Arc::new(MemoryStore::new());
    let host = ScriptedProxyHost::new();
    let ana = user(1, "ana");

    seed_pool(
        store.as_ref(),
        &["100.64.0.2", "100.64.0.3", "100.64.0.4", "100.64.0.5"],
    )
    .await;
    seed_port(store.as_ref(), &host, &ana, 1000, Some("100.64.0.2")).await;
    seed_port(store.as_ref(), &host, &ana, 1001, Some("100.64.0.3")).await;

    // First validation rejects; everything after passes
    host.script_validation(&[PARSE_FATAL]);

    let h = harness(store.clone(), host.clone(), None);
    let report = assert_ok!(h.engine.rotate_all(UserId(1)).await);

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].port, 1000);
    assert_eq!(report.skipped[0].reason, ErrorKind::RemoteConfigInvalid);
    assert_eq!(report.rotated.len(), 1);
    assert_eq!(report.rotated[0].port, 1001);
}

#[tokio::test]
async fn ledger_inconsistency_aborts_the_batch() {
    let inner = MemoryStore::new();
    let host = ScriptedProxyHost::new();
    let ana = user(1, "ana");

    seed_pool(
        &inner,
        &["100.64.0.2", "100.64.0.3", "100.64.0.4", "100.64.0.5"],
    )
    .await;
    seed_port(&inner, &host, &ana, 1000, Some("100.64.0.2")).await;
    seed_port(&inner, &host, &ana, 1001, Some("100.64.0.3")).await;

    let store = Arc::new(FailingCommitStore { inner });
    let h = harness(store, host.clone(), None);

    let err = assert_err!(h.engine.rotate_all(UserId(1)).await);
    assert_eq!(err.kind(), ErrorKind::LedgerInconsistency);

    // Second port was never attempted
    assert_eq!(host.count("reconfigure"), 1);
}
