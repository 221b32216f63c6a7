// # Memory Store
//
// In-memory implementation of ProxyStore.
//
// ## Purpose
//
// A fast store that doesn't persist across restarts. Useful for testing and
// for dry runs against a staging proxy host.
//
// ## Crash Behavior
//
// - All pool flags, bindings and ledger entries are lost on restart
// - The remote fragments remain the source of truth; `Reconciler::sync`
//   can rebuild owners and bindings from them

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::tables::Tables;
use crate::Error;
use crate::model::{BindingCommit, LedgerEntry, PoolAddress, Port, User, UserId};
use crate::traits::{PoolStore, PortStore, ProxyStore, UsageLedger};

/// In-memory store implementation
///
/// All tables live behind one async `RwLock`, so a binding commit is applied
/// under a single write guard and is never observed half-done.
///
/// # Example
///
/// ```rust,no_run
/// use proxyrot_core::state::MemoryStore;
/// use proxyrot_core::model::PoolAddress;
/// use proxyrot_core::traits::PoolStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStore::new();
///     store.insert_addresses(vec![PoolAddress::new("100.64.0.2".parse()?)]).await?;
///
///     let free = store.find_free_excluding(&Default::default()).await?;
///     assert!(free.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger entries
    pub async fn ledger_len(&self) -> usize {
        self.inner.read().await.ledger.len()
    }
}

#[async_trait]
impl PoolStore for MemoryStore {
    async fn get_address(&self, address: IpAddr) -> Result<Option<PoolAddress>, Error> {
        Ok(self.inner.read().await.addresses.get(&address).cloned())
    }

    async fn list_addresses(&self) -> Result<Vec<PoolAddress>, Error> {
        Ok(self.inner.read().await.addresses.values().cloned().collect())
    }

    async fn insert_addresses(&self, addresses: Vec<PoolAddress>) -> Result<usize, Error> {
        Ok(self.inner.write().await.insert_addresses(addresses))
    }

    async fn mark_in_use(&self, address: IpAddr, in_use: bool) -> Result<(), Error> {
        self.inner.write().await.mark_in_use(address, in_use)
    }

    async fn find_free_excluding(
        &self,
        excluded: &HashSet<IpAddr>,
    ) -> Result<Option<PoolAddress>, Error> {
        Ok(self.inner.read().await.find_free_excluding(excluded))
    }
}

#[async_trait]
impl UsageLedger for MemoryStore {
    async fn append(&self, entry: LedgerEntry) -> Result<(), Error> {
        self.inner.write().await.ledger.push(entry);
        Ok(())
    }

    async fn used_addresses_for(&self, user: UserId) -> Result<HashSet<IpAddr>, Error> {
        Ok(self.inner.read().await.used_addresses_for(user))
    }

    async fn oldest_used_address_still_free(
        &self,
        user: UserId,
    ) -> Result<Option<PoolAddress>, Error> {
        Ok(self.inner.read().await.oldest_used_address_still_free(user))
    }

    async fn entries_for(&self, user: UserId) -> Result<Vec<LedgerEntry>, Error> {
        Ok(self.inner.read().await.entries_for(user))
    }
}

#[async_trait]
impl PortStore for MemoryStore {
    async fn get_port(&self, number: u16) -> Result<Option<Port>, Error> {
        Ok(self.inner.read().await.ports.get(&number).cloned())
    }

    async fn list_ports(&self) -> Result<Vec<Port>, Error> {
        Ok(self.inner.read().await.ports.values().cloned().collect())
    }

    async fn ports_owned_by(&self, user: UserId) -> Result<Vec<Port>, Error> {
        Ok(self.inner.read().await.ports_owned_by(user))
    }

    async fn insert_ports(&self, ports: Vec<Port>) -> Result<usize, Error> {
        Ok(self.inner.write().await.insert_ports(ports))
    }

    async fn assign_owner(&self, number: u16, owner: Option<UserId>) -> Result<(), Error> {
        self.inner.write().await.assign_owner(number, owner)
    }

    async fn set_observed_ip(&self, number: u16, ip: IpAddr) -> Result<(), Error> {
        self.inner.write().await.set_observed_ip(number, ip)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, Error> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_proxy_username(
        &self,
        proxy_username: &str,
    ) -> Result<Option<User>, Error> {
        Ok(self
            .inner
            .read()
            .await
            .find_user_by_proxy_username(proxy_username))
    }

    async fn upsert_user(&self, user: User) -> Result<(), Error> {
        self.inner.write().await.users.insert(user.id, user);
        Ok(())
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn commit_binding(&self, commit: &BindingCommit) -> Result<(), Error> {
        self.inner.write().await.apply_commit(commit)
    }

    async fn adopt_binding(
        &self,
        port: u16,
        owner: UserId,
        address: Option<IpAddr>,
    ) -> Result<(), Error> {
        self.inner.write().await.apply_adopt(port, owner, address)
    }

    async fn flush(&self) -> Result<(), Error> {
        // No-op for memory store
        Ok(())
    }
}
