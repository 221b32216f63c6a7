// # Port Store
//
// Durable port records plus a read-only view of user accounts.
//
// Ownership (`owner`) and expiry are maintained by the provisioning and
// billing side; the rotation engine only reads them. The only port fields
// the engine writes are the binding (through `commit_binding`) and the
// advisory observed egress IP.

use async_trait::async_trait;
use std::net::IpAddr;

use crate::model::{Port, User, UserId};

/// Trait for port and user storage
#[async_trait]
pub trait PortStore: Send + Sync {
    /// Get one port
    async fn get_port(&self, number: u16) -> Result<Option<Port>, crate::Error>;

    /// List every port, ordered by number
    async fn list_ports(&self) -> Result<Vec<Port>, crate::Error>;

    /// Ports currently owned by a user, ordered by number
    async fn ports_owned_by(&self, user: UserId) -> Result<Vec<Port>, crate::Error>;

    /// Insert new ports, skipping numbers that already exist
    async fn insert_ports(&self, ports: Vec<Port>) -> Result<usize, crate::Error>;

    /// Set or clear a port's owner (provisioning collaborator)
    async fn assign_owner(&self, number: u16, owner: Option<UserId>) -> Result<(), crate::Error>;

    /// Update the advisory observed egress IP
    async fn set_observed_ip(&self, number: u16, ip: IpAddr) -> Result<(), crate::Error>;

    /// Get a user account
    async fn get_user(&self, id: UserId) -> Result<Option<User>, crate::Error>;

    /// Find a user by proxy username
    async fn find_user_by_proxy_username(
        &self,
        proxy_username: &str,
    ) -> Result<Option<User>, crate::Error>;

    /// Create or replace a user account (provisioning collaborator)
    async fn upsert_user(&self, user: User) -> Result<(), crate::Error>;
}
