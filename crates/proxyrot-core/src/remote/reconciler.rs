// # Reconciler
//
// Rebuilds port ownership and bindings from what the remote proxy actually
// runs: the ACL file names each user's ports and each user's fragment names
// the outbound address of every port.
//
// Used after provisioning ports by hand on the proxy host, or to recover a
// store that was lost (e.g. a MemoryStore after restart).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use super::Synchronizer;
use crate::fragment;
use crate::traits::{PoolStore, PortStore, ProxyStore};
use crate::Result;

/// Ports and addresses configured on the remote host for one proxy user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteUser {
    /// Ports listed in the user's ACL line
    pub ports: Vec<u16>,
    /// Outbound address per port, from the user's fragment
    pub addresses: BTreeMap<u16, IpAddr>,
}

/// Outcome of [`Reconciler::sync`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub assigned_ports: usize,
    /// Proxy usernames with no matching user
    pub missing_users: Vec<String>,
    /// Ports listed remotely but absent from the store
    pub missing_ports: Vec<u16>,
    /// Fragment addresses absent from the pool (port left unbound)
    pub missing_ips: Vec<IpAddr>,
    /// Ports whose remote address is already bound to another port
    pub conflicting_ports: Vec<u16>,
}

/// Reads remote configuration and adopts it into the store
pub struct Reconciler {
    store: Arc<dyn ProxyStore>,
    synchronizer: Arc<Synchronizer>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ProxyStore>, synchronizer: Arc<Synchronizer>) -> Self {
        Self {
            store,
            synchronizer,
        }
    }

    /// Read the ACL file and every listed user's fragment
    pub async fn scan(&self) -> Result<BTreeMap<String, RemoteUser>> {
        let remote = self.synchronizer.remote_config();
        let (_session, host) = self.synchronizer.session().await;

        let acl_path = remote.acl_path();
        if !host.file_exists(&acl_path).await? {
            tracing::warn!(host = host.host_name(), acl = %acl_path, "ACL file not found");
            return Ok(BTreeMap::new());
        }
        let acl = String::from_utf8_lossy(&host.read_file(&acl_path).await?).into_owned();

        let mut users = BTreeMap::new();
        for (username, ports) in fragment::parse_acl_user_ports(&acl) {
            let fragment_path = remote.fragment_path(&username);
            let mut addresses = BTreeMap::new();

            if host.file_exists(&fragment_path).await? {
                // Directives are ASCII; lossy decoding only affects other lines
                let content = host.read_file(&fragment_path).await?;
                let content = String::from_utf8_lossy(&content);
                for directive in fragment::parse_outbound_directives(&content) {
                    addresses.insert(directive.port, directive.address);
                }
            } else {
                tracing::debug!(user = %username, "No fragment for user");
            }

            users.insert(username, RemoteUser { ports, addresses });
        }

        Ok(users)
    }

    /// Adopt remote owners and bindings into the store
    ///
    /// The caller must hold the engine's allocation lock.
    pub async fn sync(&self) -> Result<SyncReport> {
        let remote_users = self.scan().await?;
        let mut report = SyncReport::default();

        for (username, remote_user) in remote_users {
            let Some(user) = self.store.find_user_by_proxy_username(&username).await? else {
                report.missing_users.push(username);
                continue;
            };

            for port in remote_user.ports {
                if self.store.get_port(port).await?.is_none() {
                    report.missing_ports.push(port);
                    continue;
                }

                // 0.0.0.0 is the provisioning placeholder for an unbound port
                let mut address = remote_user
                    .addresses
                    .get(&port)
                    .copied()
                    .filter(|ip| !ip.is_unspecified());
                if let Some(ip) = address
                    && self.store.get_address(ip).await?.is_none()
                {
                    report.missing_ips.push(ip);
                    address = None;
                }

                match self.store.adopt_binding(port, user.id, address).await {
                    Ok(()) => report.assigned_ports += 1,
                    Err(e) => {
                        tracing::warn!(port, user = %user.id, "Cannot adopt remote binding: {}", e);
                        report.conflicting_ports.push(port);
                    }
                }
            }
        }

        tracing::info!(
            assigned = report.assigned_ports,
            missing_users = report.missing_users.len(),
            missing_ports = report.missing_ports.len(),
            missing_ips = report.missing_ips.len(),
            conflicts = report.conflicting_ports.len(),
            "Reconciled store with remote proxy"
        );

        Ok(report)
    }
}
