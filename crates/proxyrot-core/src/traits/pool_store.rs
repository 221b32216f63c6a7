// # Pool Store
//
// Durable record of every allocatable outbound IP and whether it is
// currently bound to a port.
//
// Absence of a free address is a normal outcome (`Ok(None)`), never an error.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::model::PoolAddress;

/// Trait for pool address storage
///
/// # Ownership of `in_use`
///
/// The in-use flag is written by [`crate::ProxyStore::commit_binding`]. The
/// standalone [`PoolStore::mark_in_use`] exists for provisioning tools and
/// tests; the rotation engine never calls it.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Get one pool address
    async fn get_address(&self, address: IpAddr) -> Result<Option<PoolAddress>, crate::Error>;

    /// List every pool address, ordered by address
    async fn list_addresses(&self) -> Result<Vec<PoolAddress>, crate::Error>;

    /// Insert new pool addresses, skipping any that already exist
    ///
    /// # Returns
    ///
    /// The number of addresses actually inserted
    async fn insert_addresses(&self, addresses: Vec<PoolAddress>) -> Result<usize, crate::Error>;

    /// Set the in-use flag of an address
    async fn mark_in_use(&self, address: IpAddr, in_use: bool) -> Result<(), crate::Error>;

    /// Find any free (active, not in use) address outside `excluded`
    ///
    /// No ordering guarantee is made about which free address is returned.
    async fn find_free_excluding(
        &self,
        excluded: &HashSet<IpAddr>,
    ) -> Result<Option<PoolAddress>, crate::Error>;
}
