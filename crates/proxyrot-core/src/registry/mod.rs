//! Plugin-based backend registry
//!
//! Remote hosts and egress probes live in their own crates and register a
//! factory under a type name. The daemon builds them from configuration
//! without knowing the concrete types.
//!
//! ## Registration
//!
//! ```rust,ignore
//! # use proxyrot_core::registry::BackendRegistry;
//! // In proxyrot-remote-ssh
//! pub fn register(registry: &BackendRegistry) {
//!     registry.register_host("ssh", Box::new(SshProxyHostFactory));
//! }
//! ```

use crate::config::{RemoteConfig, SshConfig, StoreConfig, VerifierConfig};
use crate::error::{Error, Result};
use crate::state::{FileStore, MemoryStore};
use crate::traits::{EgressProbe, EgressProbeFactory, ProxyHost, ProxyHostFactory, ProxyStore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Registry of remote host and probe factories
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct BackendRegistry {
    /// Registered remote host factories
    hosts: RwLock<HashMap<String, Box<dyn ProxyHostFactory>>>,

    /// Registered egress probe factories
    probes: RwLock<HashMap<String, Box<dyn EgressProbeFactory>>>,
}

impl BackendRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a remote host factory
    ///
    /// # Parameters
    ///
    /// - `name`: Host type name (e.g., "ssh")
    /// - `factory`: Factory object for creating host instances
    pub fn register_host(&self, name: impl Into<String>, factory: Box<dyn ProxyHostFactory>) {
        write(&self.hosts).insert(name.into(), factory);
    }

    /// Register an egress probe factory
    ///
    /// # Parameters
    ///
    /// - `name`: Probe type name (e.g., "http")
    /// - `factory`: Factory object for creating probe instances
    pub fn register_probe(&self, name: impl Into<String>, factory: Box<dyn EgressProbeFactory>) {
        write(&self.probes).insert(name.into(), factory);
    }

    /// Create a remote host from configuration
    ///
    /// The factory is chosen by `ssh.remote_type`.
    pub fn create_host(&self, ssh: &SshConfig, remote: &RemoteConfig) -> Result<Box<dyn ProxyHost>> {
        let hosts = read(&self.hosts);
        let factory = hosts.get(&ssh.remote_type).ok_or_else(|| {
            Error::config(format!("Unknown remote host type: {}", ssh.remote_type))
        })?;

        factory.create(ssh, remote)
    }

    /// Create an egress probe from configuration
    ///
    /// The factory is chosen by `config.probe_type`.
    pub fn create_probe(&self, config: &VerifierConfig) -> Result<Box<dyn EgressProbe>> {
        let probes = read(&self.probes);
        let factory = probes.get(&config.probe_type).ok_or_else(|| {
            Error::config(format!("Unknown probe type: {}", config.probe_type))
        })?;

        factory.create(config)
    }

    /// Open the store described by `config`
    pub async fn create_store(&self, config: &StoreConfig) -> Result<Arc<dyn ProxyStore>> {
        match config {
            StoreConfig::File { path } => Ok(Arc::new(FileStore::new(path).await?)),
            StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        }
    }

    /// List all registered remote host types
    pub fn list_hosts(&self) -> Vec<String> {
        read(&self.hosts).keys().cloned().collect()
    }

    /// List all registered probe types
    pub fn list_probes(&self) -> Vec<String> {
        read(&self.probes).keys().cloned().collect()
    }

    /// Check if a remote host type is registered
    pub fn has_host(&self, name: &str) -> bool {
        read(&self.hosts).contains_key(name)
    }

    /// Check if a probe type is registered
    pub fn has_probe(&self, name: &str) -> bool {
        read(&self.probes).contains_key(name)
    }
}

// A panicking registrant cannot leave a map half-inserted, so poison is ignored
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
