//! Core traits for proxyrot
//!
//! - [`PoolStore`]: Allocatable outbound addresses and their in-use flags
//! - [`UsageLedger`]: Append-only history of which address each user used
//! - [`PortStore`]: Port records and the read-only user directory
//! - [`ProxyStore`]: All three, plus the atomic binding commit
//! - [`ProxyHost`]: Remote-command channel to the proxy host
//! - [`EgressProbe`]: Outbound request through a port to observe its egress IP

pub mod egress_probe;
pub mod pool_store;
pub mod port_store;
pub mod proxy_host;
pub mod usage_ledger;

pub use egress_probe::{EgressProbe, EgressProbeFactory, ProbeTarget};
pub use pool_store::PoolStore;
pub use port_store::PortStore;
pub use proxy_host::{ProxyHost, ProxyHostFactory};
pub use usage_ledger::UsageLedger;

use async_trait::async_trait;
use std::net::IpAddr;

use crate::model::{BindingCommit, UserId};

/// Durable store backing the rotation engine
///
/// # Atomicity
///
/// [`ProxyStore::commit_binding`] is the only way a rotation mutates durable
/// state. It releases the previous address, claims the next one, updates the
/// port and appends the ledger entry as one unit: either all of it is
/// persisted or none of it is, and a failed commit leaves the store exactly
/// as it was.
///
/// Implementations must validate before mutating:
/// - the next address exists, is active and is not bound to another port
/// - the port exists and is still owned by the committing user
#[async_trait]
pub trait ProxyStore: PoolStore + UsageLedger + PortStore {
    /// Commit a successful remote binding change
    async fn commit_binding(&self, commit: &BindingCommit) -> Result<(), crate::Error>;

    /// Record an owner and binding discovered on the remote host
    ///
    /// Used by reconciliation. Releases the address the port held before (if
    /// different) and claims `address`. No ledger entry is written.
    async fn adopt_binding(
        &self,
        port: u16,
        owner: UserId,
        address: Option<IpAddr>,
    ) -> Result<(), crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}
