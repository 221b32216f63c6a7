//! Test doubles and common utilities for contract tests
//!
//! - `ScriptedProxyHost`: in-memory remote filesystem with scripted validator output
//! - `FixedProbe` / `FlakyProbe`: egress probes with call counting
//! - `FailingCommitStore`: a MemoryStore whose binding commit always fails
//! - `Harness`: engine wired to the doubles above

#![allow(dead_code)]

use async_trait::async_trait;
use proxyrot_core::config::{EngineConfig, RemoteConfig, VerifierConfig};
use proxyrot_core::error::{Error, Result};
use proxyrot_core::model::{BindingCommit, LedgerEntry, PoolAddress, Port, User, UserId};
use proxyrot_core::traits::{
    EgressProbe, PoolStore, PortStore, ProbeTarget, ProxyHost, ProxyStore, UsageLedger,
};
use proxyrot_core::{MemoryStore, OutboundVerifier, RotationEngine, RotationEvent, Synchronizer};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const HOST: &str = "proxy.example.net";

/// Validator output for an accepted configuration
pub const PARSE_OK: &str = "2025/07/20 12:00:00| Processing Configuration File: /etc/squid/squid.conf (depth 0)";

/// Validator output for a rejected configuration
pub const PARSE_FATAL: &str = "2025/07/20 12:00:00| FATAL: Bungled /etc/squid/includes/user_ports_ana.conf line 1: tcp_outgoing_address";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn user(id: u64, username: &str) -> User {
    User {
        id: UserId(id),
        name: username.to_string(),
        email: format!("{}@example.net", username),
        proxy_username: username.to_string(),
        proxy_password: format!("{}-secret", username),
    }
}

pub fn fragment_path(username: &str) -> String {
    RemoteConfig::default().fragment_path(username)
}

pub fn backup_path(username: &str) -> String {
    let remote = RemoteConfig::default();
    remote.backup_path(&remote.fragment_path(username))
}

#[derive(Default)]
struct HostState {
    files: BTreeMap<String, Vec<u8>>,
    calls: Vec<String>,
    validate_script: VecDeque<String>,
    fail_on: Option<&'static str>,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory remote host
///
/// Clones share state, so a test keeps one handle and hands another to the
/// Synchronizer.
#[derive(Clone, Default)]
pub struct ScriptedProxyHost {
    state: Arc<Mutex<HostState>>,
}

impl ScriptedProxyHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, path: &str, contents: impl AsRef<[u8]>) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.as_ref().to_vec());
    }

    /// File contents as text (lossy for non-UTF-8 bytes)
    pub fn file(&self, path: &str) -> Option<String> {
        self.file_bytes(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn file_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Queue validator outputs; once drained every validation passes
    pub fn script_validation(&self, outputs: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state
            .validate_script
            .extend(outputs.iter().map(|s| s.to_string()));
    }

    /// Make every call of one operation fail as if the connection dropped
    pub fn fail_on(&self, operation: &'static str) {
        self.state.lock().unwrap().fail_on = Some(operation);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    /// Highest number of remote commands observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    async fn enter(&self, call: String) -> Result<()> {
        let operation = call.split(' ').next().unwrap_or_default().to_string();
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        // Give concurrent callers a chance to overlap
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if state.fail_on == Some(operation.as_str()) {
            return Err(Error::remote(format!("connection reset during {}", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyHost for ScriptedProxyHost {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.enter(format!("read {}", path)).await?;
        self.file_bytes(path)
            .ok_or_else(|| Error::remote(format!("cat: {}: No such file or directory", path)))
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.enter(format!("write {}", path)).await?;
        self.put_file(path, contents);
        Ok(())
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<()> {
        self.enter(format!("copy {} {}", from, to)).await?;
        let contents = self
            .file_bytes(from)
            .ok_or_else(|| Error::remote(format!("cp: cannot stat '{}'", from)))?;
        self.put_file(to, contents);
        Ok(())
    }

    async fn move_file(&self, from: &str, to: &str) -> Result<()> {
        self.enter(format!("move {} {}", from, to)).await?;
        let mut state = self.state.lock().unwrap();
        let contents = state
            .files
            .remove(from)
            .ok_or_else(|| Error::remote(format!("mv: cannot stat '{}'", from)))?;
        state.files.insert(to.to_string(), contents);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.enter(format!("remove {}", path)).await?;
        self.state.lock().unwrap().files.remove(path);
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        self.enter(format!("exists {}", path)).await?;
        Ok(self.file_bytes(path).is_some())
    }

    async fn validate_config(&self) -> Result<String> {
        self.enter("validate".to_string()).await?;
        let scripted = self.state.lock().unwrap().validate_script.pop_front();
        Ok(scripted.unwrap_or_else(|| PARSE_OK.to_string()))
    }

    async fn reconfigure(&self) -> Result<()> {
        self.enter("reconfigure".to_string()).await
    }

    fn host_name(&self) -> &str {
        HOST
    }
}

/// Probe that always sees the same IP
pub struct FixedProbe {
    ip: IpAddr,
    calls: Arc<AtomicUsize>,
}

impl FixedProbe {
    pub fn new(ip: IpAddr) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                ip,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl EgressProbe for FixedProbe {
    async fn probe(&self, _target: &ProbeTarget) -> Result<IpAddr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ip)
    }

    fn probe_name(&self) -> &'static str {
        "fixed"
    }
}

/// Probe that fails a number of times before answering
///
/// With `failures = usize::MAX` it never answers.
pub struct FlakyProbe {
    failures: usize,
    answer: IpAddr,
    calls: Arc<AtomicUsize>,
}

impl FlakyProbe {
    pub fn new(failures: usize, answer: IpAddr) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                failures,
                answer,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl EgressProbe for FlakyProbe {
    async fn probe(&self, _target: &ProbeTarget) -> Result<IpAddr> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(Error::Other("operation timed out".to_string()));
        }
        Ok(self.answer)
    }

    fn probe_name(&self) -> &'static str {
        "flaky"
    }
}

/// MemoryStore whose `commit_binding` always fails
pub struct FailingCommitStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl PoolStore for FailingCommitStore {
    async fn get_address(&self, address: IpAddr) -> Result<Option<PoolAddress>> {
        self.inner.get_address(address).await
    }
    async fn list_addresses(&self) -> Result<Vec<PoolAddress>> {
        self.inner.list_addresses().await
    }
    async fn insert_addresses(&self, addresses: Vec<PoolAddress>) -> Result<usize> {
        self.inner.insert_addresses(addresses).await
    }
    async fn mark_in_use(&self, address: IpAddr, in_use: bool) -> Result<()> {
        self.inner.mark_in_use(address, in_use).await
    }
    async fn find_free_excluding(&self, excluded: &HashSet<IpAddr>) -> Result<Option<PoolAddress>> {
        self.inner.find_free_excluding(excluded).await
    }
}

#[async_trait]
impl UsageLedger for FailingCommitStore {
    async fn append(&self, entry: LedgerEntry) -> Result<()> {
        self.inner.append(entry).await
    }
    async fn used_addresses_for(&self, user: UserId) -> Result<HashSet<IpAddr>> {
        self.inner.used_addresses_for(user).await
    }
    async fn oldest_used_address_still_free(&self, user: UserId) -> Result<Option<PoolAddress>> {
        self.inner.oldest_used_address_still_free(user).await
    }
    async fn entries_for(&self, user: UserId) -> Result<Vec<LedgerEntry>> {
        self.inner.entries_for(user).await
    }
}

#[async_trait]
impl PortStore for FailingCommitStore {
    async fn get_port(&self, number: u16) -> Result<Option<Port>> {
        self.inner.get_port(number).await
    }
    async fn list_ports(&self) -> Result<Vec<Port>> {
        self.inner.list_ports().await
    }
    async fn ports_owned_by(&self, user: UserId) -> Result<Vec<Port>> {
        self.inner.ports_owned_by(user).await
    }
    async fn insert_ports(&self, ports: Vec<Port>) -> Result<usize> {
        self.inner.insert_ports(ports).await
    }
    async fn assign_owner(&self, number: u16, owner: Option<UserId>) -> Result<()> {
        self.inner.assign_owner(number, owner).await
    }
    async fn set_observed_ip(&self, number: u16, ip: IpAddr) -> Result<()> {
        self.inner.set_observed_ip(number, ip).await
    }
    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.inner.get_user(id).await
    }
    async fn find_user_by_proxy_username(&self, proxy_username: &str) -> Result<Option<User>> {
        self.inner.find_user_by_proxy_username(proxy_username).await
    }
    async fn upsert_user(&self, user: User) -> Result<()> {
        self.inner.upsert_user(user).await
    }
}

#[async_trait]
impl ProxyStore for FailingCommitStore {
    async fn commit_binding(&self, _commit: &BindingCommit) -> Result<()> {
        Err(Error::store("No space left on device"))
    }
    async fn adopt_binding(&self, port: u16, owner: UserId, address: Option<IpAddr>) -> Result<()> {
        self.inner.adopt_binding(port, owner, address).await
    }
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Add pool addresses to a store
pub async fn seed_pool(store: &dyn ProxyStore, addresses: &[&str]) {
    store
        .insert_addresses(addresses.iter().map(|a| PoolAddress::new(ip(a))).collect())
        .await
        .unwrap();
}

/// Give `user` a port bound to `bound` (or unbound), with a directive line in
/// the user's remote fragment
///
/// Unbound ports carry a placeholder directive, as provisioning writes them.
pub async fn seed_port(
    store: &dyn ProxyStore,
    host: &ScriptedProxyHost,
    owner: &User,
    port: u16,
    bound: Option<&str>,
) {
    store.upsert_user(owner.clone()).await.unwrap();
    store.insert_ports(vec![Port::new(port, HOST)]).await.unwrap();
    store
        .adopt_binding(port, owner.id, bound.map(ip))
        .await
        .unwrap();

    let path = fragment_path(&owner.proxy_username);
    let mut content = host.file(&path).unwrap_or_default();
    content.push_str(&format!(
        "tcp_outgoing_address {} user_{} port{}\n",
        bound.unwrap_or("0.0.0.0"),
        owner.proxy_username,
        port
    ));
    host.put_file(&path, &content);
}

/// Record a past use of `address` by `user`
pub async fn seed_usage(store: &dyn ProxyStore, owner: &User, address: &str, port: u16, hours_ago: i64) {
    let at = chrono::Utc::now() - chrono::Duration::hours(hours_ago);
    store
        .append(LedgerEntry::new(owner, ip(address), port, at))
        .await
        .unwrap();
}

/// Ports, pool and ledger as plain values, for before/after comparisons
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub ports: Vec<Port>,
    pub addresses: Vec<PoolAddress>,
    pub ledger_len: usize,
}

pub async fn snapshot(store: &MemoryStore) -> Snapshot {
    Snapshot {
        ports: store.list_ports().await.unwrap(),
        addresses: store.list_addresses().await.unwrap(),
        ledger_len: store.ledger_len().await,
    }
}

/// Engine wired to test doubles
pub struct Harness {
    pub engine: RotationEngine,
    pub events: mpsc::Receiver<RotationEvent>,
    pub host: ScriptedProxyHost,
}

pub fn harness(
    store: Arc<dyn ProxyStore>,
    host: ScriptedProxyHost,
    probe: Option<Box<dyn EgressProbe>>,
) -> Harness {
    let synchronizer = Synchronizer::new(Box::new(host.clone()), RemoteConfig::default());
    let verifier = probe.map(|p| {
        OutboundVerifier::new(p, &VerifierConfig::default()).with_retry_delay(Duration::ZERO)
    });
    let (engine, events) =
        RotationEngine::new(store, synchronizer, verifier, &EngineConfig::default())
            .expect("engine construction succeeds");

    Harness {
        engine,
        events,
        host,
    }
}

/// Drain every event emitted so far
pub fn drain(events: &mut mpsc::Receiver<RotationEvent>) -> Vec<RotationEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
