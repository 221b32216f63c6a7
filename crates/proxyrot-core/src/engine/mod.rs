//! Port rotation engine
//!
//! The RotationEngine is the port state machine. It is responsible for:
//! - Guarding rotations (ownership, cooldown)
//! - Selecting the next address via the Allocator
//! - Applying the binding remotely via the Synchronizer
//! - Committing pool flags, port binding and ledger entry as one unit
//! - Refreshing the observed egress IP via the OutboundVerifier
//!
//! ## Architecture
//!
//! ```text
//!              rotate(port, user)
//!                      │
//!                      ▼
//!            ┌───────────────────┐
//!            │  RotationEngine   │
//!            └───────────────────┘
//!                      │  allocation lock held ─────────────┐
//!      ┌───────────────┼────────────────┬──────────────┐    │
//!      ▼               ▼                ▼              ▼    │
//! ┌─────────┐   ┌────────────┐   ┌──────────────┐ ┌────────┐│
//! │ guards  │   │ Allocator  │   │ Synchronizer │ │ commit ││
//! └─────────┘   └────────────┘   └──────────────┘ └────────┘│
//!                      │  lock released ────────────────────┘
//!                      ▼
//!            ┌───────────────────┐
//!            │ OutboundVerifier  │  (best effort)
//!            └───────────────────┘
//! ```
//!
//! ## States
//!
//! A port is `Unbound` or `Bound`. The transition runs entirely under the
//! allocation lock, so no caller ever observes a half-applied rotation.
//!
//! ## Failure Points
//!
//! 1. Guards: `Unauthorized`, `RateLimited`
//! 2. Allocation: `PoolExhausted`
//! 3. Remote apply: `RemoteConfigInvalid`, `RemoteUnavailable`
//! 4. Commit: `LedgerInconsistency` (the remote side has already changed)
//!
//! Nothing local changes before step 4, so failures in steps 1-3 leave no trace.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::allocator::Allocator;
use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{BindingCommit, LedgerEntry, LicenseStatus, PortBinding, User, UserId};
use crate::remote::{Reconciler, RemoteUser, SyncReport, Synchronizer};
use crate::traits::{PortStore, ProxyStore};
use crate::verifier::OutboundVerifier;

/// Events emitted by the RotationEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationEvent {
    /// Rotation guards passed, remote apply about to start
    RotationStarted {
        port: u16,
        user: UserId,
        candidate: IpAddr,
    },

    /// Binding applied remotely and committed locally
    Rotated {
        port: u16,
        user: UserId,
        previous: Option<IpAddr>,
        address: IpAddr,
    },

    /// Rotation rejected or failed before any local change
    RotationFailed {
        port: u16,
        user: UserId,
        kind: ErrorKind,
        error: String,
    },

    /// Egress verification finished
    Verified {
        port: u16,
        observed_ip: Option<IpAddr>,
    },

    /// Remote configuration adopted into the store
    Reconciled {
        assigned_ports: usize,
    },
}

/// Result of a successful rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationOutcome {
    pub port: u16,
    pub previous_address: Option<IpAddr>,
    pub new_address: IpAddr,
    /// Egress IP seen by the verifier, if verification succeeded
    pub observed_ip: Option<IpAddr>,
    pub changed_at: DateTime<Utc>,
}

/// A port left unchanged by [`RotationEngine::rotate_all`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedPort {
    pub port: u16,
    pub reason: ErrorKind,
    pub message: String,
}

/// Per-port outcome of [`RotationEngine::rotate_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub rotated: Vec<RotationOutcome>,
    pub skipped: Vec<SkippedPort>,
}

/// Port rotation engine
///
/// ## Locking
///
/// - **Allocation lock**: held from loading the port through the binding
///   commit, so selecting and claiming a free address is never interleaved
///   with another rotation
/// - **Remote session lock**: owned by the [`Synchronizer`], one in-flight
///   command sequence per host
///
/// The verifier runs after both are released.
///
/// ## Load Resistance
///
/// Events go through a bounded channel; when it is full they are dropped
/// with a warning instead of blocking rotations.
pub struct RotationEngine {
    store: Arc<dyn ProxyStore>,
    allocator: Allocator,
    synchronizer: Arc<Synchronizer>,
    verifier: Option<OutboundVerifier>,
    cooldown: chrono::Duration,
    allocation: Mutex<()>,
    event_tx: mpsc::Sender<RotationEvent>,
}

impl RotationEngine {
    /// Create a new rotation engine
    ///
    /// # Parameters
    ///
    /// - `store`: Durable pool, ports and ledger
    /// - `synchronizer`: Remote proxy host access
    /// - `verifier`: Optional egress verifier; without it `observed_ip` is never refreshed
    /// - `config`: Engine configuration
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields rotation events
    pub fn new(
        store: Arc<dyn ProxyStore>,
        synchronizer: Synchronizer,
        verifier: Option<OutboundVerifier>,
        config: &EngineConfig,
    ) -> Result<(Self, mpsc::Receiver<RotationEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let engine = Self {
            allocator: Allocator::new(store.clone()),
            store,
            synchronizer: Arc::new(synchronizer),
            verifier,
            cooldown: config.cooldown(),
            allocation: Mutex::new(()),
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// Rotate one port to a new pool address
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`]: unknown port or user
    /// - [`Error::Unauthorized`]: `user` does not own the port
    /// - [`Error::RateLimited`]: the port was rotated within the cooldown window
    /// - [`Error::PoolExhausted`]: no free address, even after fallback
    /// - [`Error::RemoteConfigInvalid`] / [`Error::RemoteUnavailable`]: remote apply failed,
    ///   nothing changed locally
    /// - [`Error::LedgerInconsistency`]: remote changed but the local commit failed
    pub async fn rotate(&self, port: u16, user: UserId) -> Result<RotationOutcome> {
        let committed = {
            let _allocation = self.allocation.lock().await;
            self.rotate_locked(port, user).await
        };

        let (commit, owner, host) = match committed {
            Ok(c) => c,
            Err(e) => {
                self.emit_event(RotationEvent::RotationFailed {
                    port,
                    user,
                    kind: e.kind(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        self.emit_event(RotationEvent::Rotated {
            port,
            user,
            previous: commit.previous,
            address: commit.next,
        });

        let observed_ip = self.run_verifier(&host, port, &owner).await;

        Ok(RotationOutcome {
            port,
            previous_address: commit.previous,
            new_address: commit.next,
            observed_ip,
            changed_at: commit.changed_at,
        })
    }

    /// Guards, allocation, remote apply and commit; caller holds the allocation lock
    async fn rotate_locked(&self, number: u16, user_id: UserId) -> Result<(BindingCommit, User, String)> {
        let port = self
            .store
            .get_port(number)
            .await?
            .ok_or_else(|| Error::not_found(format!("port {}", number)))?;

        if !port.is_owned_by(user_id) {
            return Err(Error::Unauthorized {
                port: number,
                user: user_id,
            });
        }

        if let Some(remaining) = port.cooldown_remaining(Utc::now(), self.cooldown) {
            debug!(port = number, remaining_secs = remaining.num_seconds(), "Rotation rate limited");
            return Err(Error::RateLimited {
                port: number,
                remaining,
            });
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("user {}", user_id)))?;

        let candidate = self.allocator.select(user_id).await?;

        self.emit_event(RotationEvent::RotationStarted {
            port: number,
            user: user_id,
            candidate: candidate.address,
        });

        self.synchronizer
            .apply_binding(number, &user, candidate.address)
            .await?;

        // Remote side has changed; from here on nothing is abortable
        let now = Utc::now();
        let commit = BindingCommit {
            port: number,
            user: user_id,
            previous: port.bound_address,
            next: candidate.address,
            changed_at: now,
            entry: LedgerEntry::new(&user, candidate.address, number, now),
        };

        if let Err(e) = self.store.commit_binding(&commit).await {
            error!(
                port = number,
                user = %user_id,
                old_address = ?commit.previous,
                new_address = %commit.next,
                host = self.synchronizer.host_name(),
                "Remote binding applied but local commit failed, operator action required: {}",
                e
            );
            return Err(Error::LedgerInconsistency {
                port: number,
                user: user_id,
                old: commit.previous,
                new: commit.next,
                reason: e.to_string(),
            });
        }

        info!(
            port = number,
            user = %user_id,
            old_address = ?commit.previous,
            new_address = %commit.next,
            "Port rotated"
        );

        Ok((commit, user, port.host))
    }

    /// Rotate every port `user` owns, one after another
    ///
    /// Per-port failures are reported in [`BatchReport::skipped`]. Only a
    /// [`Error::LedgerInconsistency`] aborts the batch.
    pub async fn rotate_all(&self, user: UserId) -> Result<BatchReport> {
        let ports = self.store.ports_owned_by(user).await?;
        let mut report = BatchReport::default();

        for port in ports {
            match self.rotate(port.number, user).await {
                Ok(outcome) => report.rotated.push(outcome),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(port = port.number, user = %user, "Skipping port: {}", e);
                    report.skipped.push(SkippedPort {
                        port: port.number,
                        reason: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            user = %user,
            rotated = report.rotated.len(),
            skipped = report.skipped.len(),
            "Batch rotation finished"
        );

        Ok(report)
    }

    /// Current binding of a port
    pub async fn binding(&self, port: u16) -> Result<PortBinding> {
        port_binding(self.store.as_ref(), port).await
    }

    /// Whether the proxy should accept traffic on a port
    pub async fn license_status(&self, port: i64) -> Result<LicenseStatus> {
        license_status(self.store.as_ref(), port).await
    }

    /// Probe a port's egress IP on demand
    ///
    /// Owner-only. Returns `Ok(None)` when every probe attempt failed.
    pub async fn verify(&self, port: u16, user: UserId) -> Result<Option<IpAddr>> {
        if self.verifier.is_none() {
            return Err(Error::config("Outbound verifier is not configured"));
        }

        let record = self
            .store
            .get_port(port)
            .await?
            .ok_or_else(|| Error::not_found(format!("port {}", port)))?;
        if !record.is_owned_by(user) {
            return Err(Error::Unauthorized { port, user });
        }
        let owner = self
            .store
            .get_user(user)
            .await?
            .ok_or_else(|| Error::not_found(format!("user {}", user)))?;

        Ok(self.run_verifier(&record.host, port, &owner).await)
    }

    /// Read the bindings configured on the remote host
    pub async fn scan_remote(&self) -> Result<BTreeMap<String, RemoteUser>> {
        self.reconciler().scan().await
    }

    /// Adopt the remote host's owners and bindings into the store
    pub async fn sync_remote(&self) -> Result<SyncReport> {
        let report = {
            let _allocation = self.allocation.lock().await;
            self.reconciler().sync().await?
        };
        self.emit_event(RotationEvent::Reconciled {
            assigned_ports: report.assigned_ports,
        });
        Ok(report)
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.store.clone(), self.synchronizer.clone())
    }

    async fn run_verifier(&self, host: &str, port: u16, user: &User) -> Option<IpAddr> {
        let verifier = self.verifier.as_ref()?;
        let observed_ip = verifier.verify(self.store.as_ref(), host, port, user).await;
        self.emit_event(RotationEvent::Verified { port, observed_ip });
        observed_ip
    }

    /// Emit an event to the event channel
    ///
    /// Drops the event (with a warning) when the channel is full.
    fn emit_event(&self, event: RotationEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.event_tx.try_send(event) {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

/// Current binding of a port, read straight from the store
pub async fn port_binding(store: &dyn ProxyStore, port: u16) -> Result<PortBinding> {
    let record = store
        .get_port(port)
        .await?
        .ok_or_else(|| Error::not_found(format!("port {}", port)))?;
    Ok(record.binding(Utc::now()))
}

/// Whether the proxy should accept traffic on a port
///
/// Takes the raw number from the proxy's ACL helper; anything outside
/// 1..=65535 or unknown to the store is blocked.
pub async fn license_status(store: &dyn ProxyStore, port: i64) -> Result<LicenseStatus> {
    let Ok(number) = u16::try_from(port) else {
        return Ok(LicenseStatus::block());
    };
    if number == 0 {
        return Ok(LicenseStatus::block());
    }

    match store.get_port(number).await? {
        Some(p) if p.license_active(Utc::now()) => Ok(LicenseStatus::allow()),
        _ => Ok(LicenseStatus::block()),
    }
}
