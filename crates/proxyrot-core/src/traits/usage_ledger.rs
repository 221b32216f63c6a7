// # Usage Ledger
//
// Append-only history of which pool address each user has used, on which
// port and when. Entries are never updated or deleted.

use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;

use crate::model::{LedgerEntry, PoolAddress, UserId};

/// Trait for the usage ledger
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Append one entry
    async fn append(&self, entry: LedgerEntry) -> Result<(), crate::Error>;

    /// Every address the user has ever been bound to
    async fn used_addresses_for(&self, user: UserId) -> Result<HashSet<IpAddr>, crate::Error>;

    /// The least-recently-used address of this user that is free right now
    ///
    /// Each previously used address is ranked by the user's most recent use
    /// of it; among those currently free, the one with the oldest such
    /// timestamp wins. Ties break on the lower address.
    async fn oldest_used_address_still_free(
        &self,
        user: UserId,
    ) -> Result<Option<PoolAddress>, crate::Error>;

    /// All entries for a user, oldest first (audit)
    async fn entries_for(&self, user: UserId) -> Result<Vec<LedgerEntry>, crate::Error>;
}
