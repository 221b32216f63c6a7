//! Contract Test: Remote Reconciliation
//!
//! Constraints verified:
//! - Ownership and bindings are adopted from the ACL file and fragments
//! - Unknown users, ports and addresses are reported, never invented
//! - An address already bound elsewhere is reported as a conflict
//! - Adopted bindings keep the pool's in-use flags consistent

mod common;

use common::*;
use proxyrot_core::config::RemoteConfig;
use proxyrot_core::model::{Port, UserId};
use proxyrot_core::traits::{PoolStore, PortStore};
use proxyrot_core::{MemoryStore, RotationEvent};
use std::sync::Arc;
use tokio_test::assert_ok;

const ACL: &str = "acl ana_ports myportname port1000 port1001\n\
                   acl bruno_ports myportname port1002 port1005\n\
                   acl carla_ports myportname port1003\n\
                   http_access allow ana_ports\n";

async fn setup() -> (Arc<MemoryStore>, ScriptedProxyHost) {
    let store = Arc::new(MemoryStore::new());
    let host = ScriptedProxyHost::new();

    seed_pool(store.as_ref(), &["100.64.0.2", "100.64.0.3"]).await;
    store
        .insert_ports(
            [1000, 1001, 1002, 1003]
                .into_iter()
                .map(|n| Port::new(n, HOST))
                .collect(),
        )
        .await
        .unwrap();
    store.upsert_user(user(1, "ana")).await.unwrap();
    store.upsert_user(user(2, "bruno")).await.unwrap();

    host.put_file(&RemoteConfig::default().acl_path(), ACL);
    host.put_file(
        &fragment_path("ana"),
        "tcp_outgoing_address 100.64.0.2 user_ana port1000\n\
         tcp_outgoing_address 198.51.100.1 user_ana port1001\n",
    );
    // bruno's fragment claims ana's address
    host.put_file(
        &fragment_path("bruno"),
        "tcp_outgoing_address 100.64.0.2 user_bruno port1002\n",
    );

    (store, host)
}

#[tokio::test]
async fn scan_reads_acl_and_fragments() {
    let (store, host) = setup().await;
    let h = harness(store, host.clone(), None);

    let users = assert_ok!(h.engine.scan_remote().await);
    assert_eq!(users.len(), 3);

    let ana = &users["ana"];
    assert_eq!(ana.ports, vec![1000, 1001]);
    assert_eq!(ana.addresses.get(&1000), Some(&ip("100.64.0.2")));
    assert_eq!(ana.addresses.get(&1001), Some(&ip("198.51.100.1")));

    // No fragment for carla
    assert!(users["carla"].addresses.is_empty());

    // Scanning is read-only
    assert_eq!(host.count("write"), 0);
    assert_eq!(host.count("reconfigure"), 0);
}

#[tokio::test]
async fn scan_without_acl_file_is_empty() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(store, ScriptedProxyHost::new(), None);

    let users = assert_ok!(h.engine.scan_remote().await);
    assert!(users.is_empty());
}

#[tokio::test]
async fn sync_adopts_and_reports() {
    let (store, host) = setup().await;
    let mut h = harness(store.clone(), host, None);

    let report = assert_ok!(h.engine.sync_remote().await);
    assert_eq!(report.assigned_ports, 2);
    assert_eq!(report.missing_users, vec!["carla".to_string()]);
    assert_eq!(report.missing_ports, vec![1005]);
    assert_eq!(report.missing_ips, vec![ip("198.51.100.1")]);
    assert_eq!(report.conflicting_ports, vec![1002]);

    let bound = store.get_port(1000).await.unwrap().unwrap();
    assert_eq!(bound.owner, Some(UserId(1)));
    assert_eq!(bound.bound_address, Some(ip("100.64.0.2")));
    assert!(store.get_address(ip("100.64.0.2")).await.unwrap().unwrap().in_use);

    // Owned, but its remote address is outside the pool
    let unbound = store.get_port(1001).await.unwrap().unwrap();
    assert_eq!(unbound.owner, Some(UserId(1)));
    assert_eq!(unbound.bound_address, None);

    // Conflict left the port untouched
    let conflicted = store.get_port(1002).await.unwrap().unwrap();
    assert_eq!(conflicted.owner, None);

    let events = drain(&mut h.events);
    assert!(events.contains(&RotationEvent::Reconciled { assigned_ports: 2 }));
}

#[tokio::test]
async fn placeholder_address_adopts_unbound_port() {
    let (store, host) = setup().await;
    host.put_file(
        &fragment_path("ana"),
        "tcp_outgoing_address 0.0.0.0 user_ana port1000\n\
         tcp_outgoing_address 0.0.0.0 user_ana port1001\n",
    );

    let h = harness(store.clone(), host, None);
    let report = assert_ok!(h.engine.sync_remote().await);
    assert!(report.missing_ips.is_empty());

    let port = store.get_port(1000).await.unwrap().unwrap();
    assert_eq!(port.owner, Some(UserId(1)));
    assert_eq!(port.bound_address, None);
}

#[tokio::test]
async fn sync_is_idempotent() {
    let (store, host) = setup().await;
    let h = harness(store.clone(), host, None);

    let first = assert_ok!(h.engine.sync_remote().await);
    let before = snapshot(&store).await;
    let second = assert_ok!(h.engine.sync_remote().await);

    assert_eq!(first, second);
    assert_eq!(snapshot(&store).await, before);
}

#[tokio::test]
async fn adopted_port_can_rotate() {
    let (store, host) = setup().await;
    let h = harness(store.clone(), host.clone(), None);
    assert_ok!(h.engine.sync_remote().await);

    let outcome = assert_ok!(h.engine.rotate(1000, UserId(1)).await);
    assert_eq!(outcome.previous_address, Some(ip("100.64.0.2")));
    assert_eq!(outcome.new_address, ip("100.64.0.3"));
    assert_eq!(
        host.file(&fragment_path("ana")).unwrap(),
        "tcp_outgoing_address 100.64.0.3 user_ana port1000\n\
         tcp_outgoing_address 198.51.100.1 user_ana port1001\n"
    );
}
