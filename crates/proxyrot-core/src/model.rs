//! Data model: pool addresses, ports, users and ledger entries

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a user account (owned by the provisioning/billing side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user account as seen by the rotation core
///
/// The core only reads users: the proxy username names the remote fragment
/// and the credentials are used by the verifier probe.
#[derive(Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    /// Username on the proxy host (fragment `user_ports_{proxy_username}.conf`)
    pub proxy_username: String,
    /// Password on the proxy host
    /// ⚠️ NEVER log this value
    pub proxy_password: String,
}

// Custom Debug implementation that hides the proxy password
impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("proxy_username", &self.proxy_username)
            .field("proxy_password", &"<REDACTED>")
            .finish()
    }
}

/// One allocatable outbound IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAddress {
    pub address: IpAddr,
    pub active: bool,
    /// Flipped only through a binding commit
    pub in_use: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl PoolAddress {
    /// A fresh, active, unclaimed pool address
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            active: true,
            in_use: false,
            description: None,
        }
    }

    /// Whether the address can be claimed right now
    pub fn is_free(&self) -> bool {
        self.active && !self.in_use
    }
}

/// Externally visible state of a port's binding
///
/// A rotation in flight is not observable: it happens entirely under the
/// engine's allocation lock, so readers see either the old or the new binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortState {
    Unbound,
    Bound,
}

/// One proxy listening port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub number: u16,
    pub host: String,
    pub owner: Option<UserId>,
    pub bound_address: Option<IpAddr>,
    /// Advisory cache of the last verified egress IP
    pub observed_ip: Option<IpAddr>,
    pub binding_changed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub last_renewal_at: Option<DateTime<Utc>>,
    /// True iff `owner` is set
    pub in_use: bool,
}

impl Port {
    /// A pre-provisioned, unowned, unbound port that expires now
    pub fn new(number: u16, host: impl Into<String>) -> Self {
        Self {
            number,
            host: host.into(),
            owner: None,
            bound_address: None,
            observed_ip: None,
            binding_changed_at: None,
            expires_at: Utc::now(),
            last_renewal_at: None,
            in_use: false,
        }
    }

    /// Set or clear the owner, keeping `in_use` consistent
    pub fn assign_owner(&mut self, owner: Option<UserId>) {
        self.owner = owner;
        self.in_use = owner.is_some();
    }

    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.owner == Some(user)
    }

    pub fn state(&self) -> PortState {
        match self.bound_address {
            Some(_) => PortState::Bound,
            None => PortState::Unbound,
        }
    }

    /// Whether the port's license has not yet expired
    pub fn license_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left before the port may rotate again, if any
    pub fn cooldown_remaining(
        &self,
        now: DateTime<Utc>,
        cooldown: chrono::Duration,
    ) -> Option<chrono::Duration> {
        let changed_at = self.binding_changed_at?;
        let elapsed = now.signed_duration_since(changed_at);
        if elapsed < cooldown {
            Some(cooldown - elapsed)
        } else {
            None
        }
    }

    /// Read-only view for presentation layers
    pub fn binding(&self, now: DateTime<Utc>) -> PortBinding {
        PortBinding {
            port: self.number,
            host: self.host.clone(),
            state: self.state(),
            bound_address: self.bound_address,
            observed_ip: self.observed_ip,
            binding_changed_at: self.binding_changed_at,
            expires_at: self.expires_at,
            license_active: self.license_active(now),
        }
    }
}

/// Current binding of a port, as exposed to collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortBinding {
    pub port: u16,
    pub host: String,
    pub state: PortState,
    pub bound_address: Option<IpAddr>,
    pub observed_ip: Option<IpAddr>,
    pub binding_changed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub license_active: bool,
}

/// Answer for the proxy's port access check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LicenseStatus {
    pub expired: bool,
    pub allow: bool,
}

impl LicenseStatus {
    pub fn allow() -> Self {
        Self {
            expired: false,
            allow: true,
        }
    }

    pub fn block() -> Self {
        Self {
            expired: true,
            allow: false,
        }
    }
}

/// Immutable record: a user used an address on a port at a time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub user_name: String,
    pub user_email: String,
    pub proxy_username: String,
    pub address: IpAddr,
    pub port: u16,
    pub used_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(user: &User, address: IpAddr, port: u16, used_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user.id,
            user_name: user.name.clone(),
            user_email: user.email.clone(),
            proxy_username: user.proxy_username.clone(),
            address,
            port,
            used_at,
        }
    }
}

/// Everything that must become durable together after a successful remote apply
#[derive(Debug, Clone)]
pub struct BindingCommit {
    pub port: u16,
    pub user: UserId,
    /// Address the port was bound to when the rotation started
    pub previous: Option<IpAddr>,
    pub next: IpAddr,
    pub changed_at: DateTime<Utc>,
    pub entry: LedgerEntry,
}
