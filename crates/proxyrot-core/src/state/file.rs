// # File Store
//
// File-based implementation of ProxyStore with crash recovery.
//
// ## Purpose
//
// Persists the address pool, port records, user directory and usage ledger
// across daemon restarts and crashes.
//
// ## Crash Recovery
//
// - Atomic writes: Uses write-then-rename for atomicity
// - Corruption detection: Validates JSON on load
// - Automatic backup: Keeps .backup of last known good state
// - Recovery: Falls back to backup if corruption detected
//
// ## Commit Semantics
//
// Every mutation is applied to a copy of the tables, the copy is written to
// disk, and only then does it replace the in-memory tables. A failed write
// leaves both the file and memory untouched.
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "addresses": { "100.64.0.2": { "address": "100.64.0.2", "active": true, "in_use": true } },
//   "ports": { "1000": { "number": 1000, "owner": 7, "bound_address": "100.64.0.2", ... } },
//   "users": { "7": { "id": 7, "proxy_username": "ana", ... } },
//   "ledger": [ { "user_id": 7, "address": "100.64.0.2", "port": 1000, "used_at": "..." } ]
// }
// ```

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::tables::Tables;
use crate::Error;
use crate::model::{BindingCommit, LedgerEntry, PoolAddress, Port, User, UserId};
use crate::traits::{PoolStore, PortStore, ProxyStore, UsageLedger};

/// Store file format version
/// Used for future migration if format changes
const STORE_FILE_VERSION: &str = "1.0";

/// File-based store with crash recovery
///
/// # Crash Recovery
///
/// - **Atomic writes**: New state written to temporary file, then renamed
/// - **Backup**: Last known good state kept in `.backup` file
/// - **Corruption detection**: JSON validation on load
/// - **Automatic recovery**: Falls back to backup if main file corrupted
///
/// # Example
///
/// ```rust,no_run
/// use proxyrot_core::state::FileStore;
/// use proxyrot_core::traits::PortStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = FileStore::new("/var/lib/proxyrot/store.json").await?;
///     let ports = store.list_ports().await?;
///     println!("{} ports", ports.len());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Arc<RwLock<Tables>>,
}

/// Serializable store file format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoreFileFormat {
    version: String,
    #[serde(default)]
    addresses: BTreeMap<IpAddr, PoolAddress>,
    #[serde(default)]
    ports: BTreeMap<u16, Port>,
    #[serde(default)]
    users: BTreeMap<UserId, User>,
    #[serde(default)]
    ledger: Vec<LedgerEntry>,
}

impl From<StoreFileFormat> for Tables {
    fn from(file: StoreFileFormat) -> Self {
        Tables {
            addresses: file.addresses,
            ports: file.ports,
            users: file.users,
            ledger: file.ledger,
        }
    }
}

impl FileStore {
    /// Create or load a file store
    ///
    /// This will:
    /// 1. Try to load existing store file
    /// 2. If corruption detected, try to load from backup
    /// 3. If both fail, start with empty tables
    /// 4. Create parent directories if needed
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let tables = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(tables)),
        })
    }

    /// Load tables from file with automatic recovery
    ///
    /// Recovery strategy:
    /// 1. Try to load main store file
    /// 2. If JSON parse error, try loading backup
    /// 3. If backup also fails, start with empty tables
    async fn load_with_recovery(path: &Path) -> Result<Tables, Error> {
        let err = match Self::load(path).await {
            Ok(tables) => {
                tracing::debug!(
                    addresses = tables.addresses.len(),
                    ports = tables.ports.len(),
                    ledger = tables.ledger.len(),
                    "Loaded store from file"
                );
                return Ok(tables);
            }
            Err(e) => e,
        };

        // Only parse failures count as corruption
        if !matches!(err, Error::Json(_)) {
            return Err(err);
        }

        tracing::warn!(
            "Store file appears corrupted: {}. Attempting recovery from backup.",
            err
        );

        let backup_path = Self::backup_path(path);
        if !backup_path.exists() {
            tracing::warn!("No backup file found. Starting with empty store.");
            return Ok(Tables::default());
        }

        match Self::load(&backup_path).await {
            Ok(tables) => {
                tracing::info!(
                    ports = tables.ports.len(),
                    ledger = tables.ledger.len(),
                    "Recovered store from backup"
                );

                if let Err(restore_err) = Self::restore_from_backup(path, &backup_path).await {
                    tracing::error!("Failed to restore store file from backup: {}", restore_err);
                }

                Ok(tables)
            }
            Err(backup_err) => {
                tracing::error!(
                    "Backup also corrupted: {}. Starting with empty store.",
                    backup_err
                );
                Ok(Tables::default())
            }
        }
    }

    /// Load tables from file
    async fn load(path: &Path) -> Result<Tables, Error> {
        if !path.exists() {
            tracing::debug!("Store file does not exist: {}", path.display());
            return Ok(Tables::default());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store(format!("Failed to read store file {}: {}", path.display(), e))
        })?;

        let file: StoreFileFormat = serde_json::from_str(&content)?;

        if file.version != STORE_FILE_VERSION {
            tracing::warn!(
                "Store file version mismatch: expected {}, got {}. \
                Attempting to load anyway.",
                STORE_FILE_VERSION,
                file.version
            );
        }

        Ok(file.into())
    }

    /// Write tables to file atomically
    async fn write(&self, tables: &Tables) -> Result<(), Error> {
        let file = StoreFileFormat {
            version: STORE_FILE_VERSION.to_string(),
            addresses: tables.addresses.clone(),
            ports: tables.ports.clone(),
            users: tables.users.clone(),
            ledger: tables.ledger.clone(),
        };

        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::store(format!("Failed to serialize store: {}", e)))?;

        let temp_path = self.temp_path();
        {
            let mut f = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            f.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!(
                    "Failed to write to temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

            f.sync_all().await.map_err(|e| {
                Error::store(format!(
                    "Failed to sync temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
        }

        if self.path.exists() {
            let backup_path = Self::backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup_path).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::trace!("Store written to file: {}", self.path.display());
        Ok(())
    }

    /// Apply a change to a copy, persist it, then swap it in
    async fn mutate<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Tables) -> Result<T, Error>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.write(&next).await?;
        *guard = next;
        Ok(out)
    }

    /// Restore store file from backup
    async fn restore_from_backup(path: &Path, backup_path: &Path) -> Result<(), Error> {
        fs::copy(backup_path, path).await.map_err(|e| {
            Error::store(format!(
                "Failed to restore from backup {} to {}: {}",
                backup_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::info!("Restored store file from backup");
        Ok(())
    }

    /// Get path to temporary file for atomic writes
    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    /// Get path to backup file
    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PoolStore for FileStore {
    async fn get_address(&self, address: IpAddr) -> Result<Option<PoolAddress>, Error> {
        Ok(self.state.read().await.addresses.get(&address).cloned())
    }

    async fn list_addresses(&self) -> Result<Vec<PoolAddress>, Error> {
        Ok(self.state.read().await.addresses.values().cloned().collect())
    }

    async fn insert_addresses(&self, addresses: Vec<PoolAddress>) -> Result<usize, Error> {
        self.mutate(|t| Ok(t.insert_addresses(addresses))).await
    }

    async fn mark_in_use(&self, address: IpAddr, in_use: bool) -> Result<(), Error> {
        self.mutate(|t| t.mark_in_use(address, in_use)).await
    }

    async fn find_free_excluding(
        &self,
        excluded: &HashSet<IpAddr>,
    ) -> Result<Option<PoolAddress>, Error> {
        Ok(self.state.read().await.find_free_excluding(excluded))
    }
}

#[async_trait]
impl UsageLedger for FileStore {
    async fn append(&self, entry: LedgerEntry) -> Result<(), Error> {
        self.mutate(|t| {
            t.ledger.push(entry);
            Ok(())
        })
        .await
    }

    async fn used_addresses_for(&self, user: UserId) -> Result<HashSet<IpAddr>, Error> {
        Ok(self.state.read().await.used_addresses_for(user))
    }

    async fn oldest_used_address_still_free(
        &self,
        user: UserId,
    ) -> Result<Option<PoolAddress>, Error> {
        Ok(self.state.read().await.oldest_used_address_still_free(user))
    }

    async fn entries_for(&self, user: UserId) -> Result<Vec<LedgerEntry>, Error> {
        Ok(self.state.read().await.entries_for(user))
    }
}

#[async_trait]
impl PortStore for FileStore {
    async fn get_port(&self, number: u16) -> Result<Option<Port>, Error> {
        Ok(self.state.read().await.ports.get(&number).cloned())
    }

    async fn list_ports(&self) -> Result<Vec<Port>, Error> {
        Ok(self.state.read().await.ports.values().cloned().collect())
    }

    async fn ports_owned_by(&self, user: UserId) -> Result<Vec<Port>, Error> {
        Ok(self.state.read().await.ports_owned_by(user))
    }

    async fn insert_ports(&self, ports: Vec<Port>) -> Result<usize, Error> {
        self.mutate(|t| Ok(t.insert_ports(ports))).await
    }

    async fn assign_owner(&self, number: u16, owner: Option<UserId>) -> Result<(), Error> {
        self.mutate(|t| t.assign_owner(number, owner)).await
    }

    async fn set_observed_ip(&self, number: u16, ip: IpAddr) -> Result<(), Error> {
        self.mutate(|t| t.set_observed_ip(number, ip)).await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, Error> {
        Ok(self.state.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_proxy_username(
        &self,
        proxy_username: &str,
    ) -> Result<Option<User>, Error> {
        Ok(self
            .state
            .read()
            .await
            .find_user_by_proxy_username(proxy_username))
    }

    async fn upsert_user(&self, user: User) -> Result<(), Error> {
        self.mutate(|t| {
            t.users.insert(user.id, user);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ProxyStore for FileStore {
    async fn commit_binding(&self, commit: &BindingCommit) -> Result<(), Error> {
        self.mutate(|t| t.apply_commit(commit)).await
    }

    async fn adopt_binding(
        &self,
        port: u16,
        owner: UserId,
        address: Option<IpAddr>,
    ) -> Result<(), Error> {
        self.mutate(|t| t.apply_adopt(port, owner, address)).await
    }

    async fn flush(&self) -> Result<(), Error> {
        let guard = self.state.read().await;
        self.write(&guard).await
    }
}
