// # Store Tables
//
// The three durable collections (pool addresses, ports, usage ledger) plus
// the user directory, as plain data with synchronous operations. Both store
// implementations wrap this type; all invariant checks live here.

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::model::{BindingCommit, LedgerEntry, PoolAddress, Port, User, UserId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    #[serde(default)]
    pub addresses: BTreeMap<IpAddr, PoolAddress>,
    #[serde(default)]
    pub ports: BTreeMap<u16, Port>,
    #[serde(default)]
    pub users: BTreeMap<UserId, User>,
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
}

impl Tables {
    pub fn insert_addresses(&mut self, addresses: Vec<PoolAddress>) -> usize {
        let mut inserted = 0;
        for address in addresses {
            if !self.addresses.contains_key(&address.address) {
                self.addresses.insert(address.address, address);
                inserted += 1;
            }
        }
        inserted
    }

    pub fn mark_in_use(&mut self, address: IpAddr, in_use: bool) -> Result<(), Error> {
        let entry = self
            .addresses
            .get_mut(&address)
            .ok_or_else(|| Error::not_found(format!("pool address {}", address)))?;
        entry.in_use = in_use;
        Ok(())
    }

    pub fn find_free_excluding(&self, excluded: &HashSet<IpAddr>) -> Option<PoolAddress> {
        self.addresses
            .values()
            .find(|a| a.is_free() && !excluded.contains(&a.address))
            .cloned()
    }

    pub fn used_addresses_for(&self, user: UserId) -> HashSet<IpAddr> {
        self.ledger
            .iter()
            .filter(|e| e.user_id == user)
            .map(|e| e.address)
            .collect()
    }

    pub fn oldest_used_address_still_free(&self, user: UserId) -> Option<PoolAddress> {
        let mut last_use: BTreeMap<IpAddr, DateTime<Utc>> = BTreeMap::new();
        for entry in self.ledger.iter().filter(|e| e.user_id == user) {
            last_use
                .entry(entry.address)
                .and_modify(|at| *at = (*at).max(entry.used_at))
                .or_insert(entry.used_at);
        }

        last_use
            .into_iter()
            .filter(|(address, _)| self.addresses.get(address).is_some_and(|a| a.is_free()))
            .min_by_key(|(address, used_at)| (*used_at, *address))
            .and_then(|(address, _)| self.addresses.get(&address).cloned())
    }

    pub fn entries_for(&self, user: UserId) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .ledger
            .iter()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.used_at);
        entries
    }

    pub fn ports_owned_by(&self, user: UserId) -> Vec<Port> {
        self.ports
            .values()
            .filter(|p| p.is_owned_by(user))
            .cloned()
            .collect()
    }

    pub fn insert_ports(&mut self, ports: Vec<Port>) -> usize {
        let mut inserted = 0;
        for port in ports {
            if !self.ports.contains_key(&port.number) {
                self.ports.insert(port.number, port);
                inserted += 1;
            }
        }
        inserted
    }

    pub fn assign_owner(&mut self, number: u16, owner: Option<UserId>) -> Result<(), Error> {
        self.port_mut(number)?.assign_owner(owner);
        Ok(())
    }

    pub fn set_observed_ip(&mut self, number: u16, ip: IpAddr) -> Result<(), Error> {
        self.port_mut(number)?.observed_ip = Some(ip);
        Ok(())
    }

    pub fn find_user_by_proxy_username(&self, proxy_username: &str) -> Option<User> {
        self.users
            .values()
            .find(|u| u.proxy_username == proxy_username)
            .cloned()
    }

    /// Apply a binding commit, or change nothing at all
    pub fn apply_commit(&mut self, commit: &BindingCommit) -> Result<(), Error> {
        let port = self
            .ports
            .get(&commit.port)
            .ok_or_else(|| Error::not_found(format!("port {}", commit.port)))?;

        if !port.is_owned_by(commit.user) {
            return Err(Error::store(format!(
                "port {} is no longer owned by user {}",
                commit.port, commit.user
            )));
        }
        if port.bound_address != commit.previous {
            return Err(Error::store(format!(
                "port {} binding changed during rotation (expected {:?}, found {:?})",
                commit.port, commit.previous, port.bound_address
            )));
        }

        let next = self
            .addresses
            .get(&commit.next)
            .ok_or_else(|| Error::not_found(format!("pool address {}", commit.next)))?;
        if !next.is_free() {
            return Err(Error::store(format!(
                "pool address {} is not free",
                commit.next
            )));
        }
        if let Some(holder) = self.holder_of(commit.next)
            && holder != commit.port
        {
            return Err(Error::store(format!(
                "pool address {} is already bound to port {}",
                commit.next, holder
            )));
        }

        // Validation done; everything below is infallible.
        if let Some(previous) = commit.previous
            && let Some(prev) = self.addresses.get_mut(&previous)
        {
            prev.in_use = false;
        }
        if let Some(next) = self.addresses.get_mut(&commit.next) {
            next.in_use = true;
        }
        if let Some(port) = self.ports.get_mut(&commit.port) {
            port.bound_address = Some(commit.next);
            port.binding_changed_at = Some(commit.changed_at);
        }
        self.ledger.push(commit.entry.clone());

        Ok(())
    }

    /// Record an owner and binding found on the remote host
    pub fn apply_adopt(
        &mut self,
        number: u16,
        owner: UserId,
        address: Option<IpAddr>,
    ) -> Result<(), Error> {
        let current = self
            .ports
            .get(&number)
            .ok_or_else(|| Error::not_found(format!("port {}", number)))?
            .bound_address;

        if let Some(address) = address {
            if !self.addresses.contains_key(&address) {
                return Err(Error::not_found(format!("pool address {}", address)));
            }
            if let Some(holder) = self.holder_of(address)
                && holder != number
            {
                return Err(Error::store(format!(
                    "pool address {} is already bound to port {}",
                    address, holder
                )));
            }
        }

        if current != address
            && let Some(previous) = current
            && let Some(prev) = self.addresses.get_mut(&previous)
        {
            prev.in_use = false;
        }
        if let Some(address) = address
            && let Some(next) = self.addresses.get_mut(&address)
        {
            next.in_use = true;
        }
        if let Some(port) = self.ports.get_mut(&number) {
            port.assign_owner(Some(owner));
            port.bound_address = address;
        }

        Ok(())
    }

    fn holder_of(&self, address: IpAddr) -> Option<u16> {
        self.ports
            .values()
            .find(|p| p.bound_address == Some(address))
            .map(|p| p.number)
    }

    fn port_mut(&mut self, number: u16) -> Result<&mut Port, Error> {
        self.ports
            .get_mut(&number)
            .ok_or_else(|| Error::not_found(format!("port {}", number)))
    }
}
