//! Contract Test: Pool Exclusivity Under Concurrency
//!
//! Constraints verified:
//! - Concurrent rotations never claim the same pool address
//! - In-use flags always match the set of bound addresses
//! - Remote commands against one host never overlap
//!
//! If this test fails, two ports can egress from the same IP.

mod common;

use common::*;
use proxyrot_core::model::UserId;
use proxyrot_core::traits::{PoolStore, PortStore};
use proxyrot_core::{ErrorKind, MemoryStore};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

async fn assert_pool_exclusive(store: &MemoryStore) {
    let ports = store.list_ports().await.unwrap();
    let bound: Vec<IpAddr> = ports.iter().filter_map(|p| p.bound_address).collect();
    let distinct: HashSet<IpAddr> = bound.iter().copied().collect();
    assert_eq!(bound.len(), distinct.len(), "an address is bound to two ports");

    let in_use: HashSet<IpAddr> = store
        .list_addresses()
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.in_use)
        .map(|a| a.address)
        .collect();
    assert_eq!(in_use, distinct, "in-use flags disagree with bindings");
}

/// Four users with two unbound ports each
async fn setup(pool: &[&str]) -> (Arc<MemoryStore>, ScriptedProxyHost) {
    let store = Arc::new(MemoryStore::new());
    let host = ScriptedProxyHost::new();
    seed_pool(store.as_ref(), pool).await;

    for (i, name) in ["ana", "bruno", "carla", "davi"].iter().enumerate() {
        let owner = user(i as u64 + 1, name);
        let base = 1000 + (i as u16) * 2;
        seed_port(store.as_ref(), &host, &owner, base, None).await;
        seed_port(store.as_ref(), &host, &owner, base + 1, None).await;
    }

    (store, host)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotations_claim_distinct_addresses() {
    let pool: Vec<String> = (2..14).map(|n| format!("100.64.0.{}", n)).collect();
    let pool: Vec<&str> = pool.iter().map(String::as_str).collect();
    let (store, host) = setup(&pool).await;

    let Harness {
        engine, events: _events, ..
    } = harness(store.clone(), host.clone(), None);
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for port in 1000u16..1008 {
        let owner = UserId(u64::from((port - 1000) / 2 + 1));
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.rotate(port, owner).await }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_pool_exclusive(&store).await;
    assert_eq!(store.ledger_len().await, 8);
    assert_eq!(host.max_in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_rotations_on_a_short_pool() {
    // Eight ports race for five addresses
    let (store, host) = setup(&[
        "100.64.0.2",
        "100.64.0.3",
        "100.64.0.4",
        "100.64.0.5",
        "100.64.0.6",
    ])
    .await;

    let Harness {
        engine, events: _events, ..
    } = harness(store.clone(), host.clone(), None);
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for port in 1000u16..1008 {
        let owner = UserId(u64::from((port - 1000) / 2 + 1));
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.rotate(port, owner).await }));
    }

    let mut rotated = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => rotated += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::PoolExhausted);
                exhausted += 1;
            }
        }
    }

    assert_eq!(rotated, 5);
    assert_eq!(exhausted, 3);
    assert_pool_exclusive(&store).await;
    assert_eq!(store.ledger_len().await, 5);
    assert_eq!(host.max_in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batches_for_different_users() {
    let pool: Vec<String> = (2..20).map(|n| format!("100.64.0.{}", n)).collect();
    let pool: Vec<&str> = pool.iter().map(String::as_str).collect();
    let (store, host) = setup(&pool).await;

    let Harness {
        engine, events: _events, ..
    } = harness(store.clone(), host, None);
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for id in 1..=4u64 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move { engine.rotate_all(UserId(id)).await }));
    }

    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.rotated.len(), 2);
        assert!(report.skipped.is_empty());
    }

    assert_pool_exclusive(&store).await;
}
