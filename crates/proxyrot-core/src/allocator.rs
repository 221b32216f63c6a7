//! Pool address selection
//!
//! The allocator only *selects*; claiming happens in the binding commit. The
//! caller must hold the engine's allocation lock from selection through commit
//! so two rotations never pick the same free address.

use std::sync::Arc;

use crate::model::{PoolAddress, UserId};
use crate::traits::{PoolStore, ProxyStore, UsageLedger};
use crate::{Error, Result};

/// Picks the next pool address for a user
///
/// Order of preference:
/// 1. any free address the user has never used
/// 2. among free addresses the user has used, the least recently used one
/// 3. otherwise [`Error::PoolExhausted`]
///
/// Never returns an address that is currently in use, so it never preempts
/// another port's binding.
#[derive(Clone)]
pub struct Allocator {
    store: Arc<dyn ProxyStore>,
}

impl Allocator {
    pub fn new(store: Arc<dyn ProxyStore>) -> Self {
        Self { store }
    }

    /// Select a free address for `user`
    pub async fn select(&self, user: UserId) -> Result<PoolAddress> {
        let used = self.store.used_addresses_for(user).await?;

        if let Some(fresh) = self.store.find_free_excluding(&used).await? {
            tracing::debug!(user = %user, address = %fresh.address, "Selected unused address");
            return Ok(fresh);
        }

        if !used.is_empty()
            && let Some(reused) = self.store.oldest_used_address_still_free(user).await?
        {
            tracing::debug!(
                user = %user,
                address = %reused.address,
                "No unused address left, reusing least recently used"
            );
            return Ok(reused);
        }

        Err(Error::PoolExhausted { user })
    }
}
