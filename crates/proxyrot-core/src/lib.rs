// # proxyrot-core
//
// Core library for rotating the outbound IP address of forward-proxy ports.
//
// ## Architecture Overview
//
// - **PoolStore / UsageLedger / PortStore**: Durable pool, ledger and port records
// - **Allocator**: Picks the next pool address for a user's port
// - **ProxyHost**: Remote-command channel to the proxy host
// - **Synchronizer**: Applies a binding change remotely with validate-or-rollback
// - **RotationEngine**: Port state machine tying allocation, remote apply and commit together
// - **OutboundVerifier**: Best-effort egress IP confirmation through an `EgressProbe`
// - **BackendRegistry**: Name-keyed factories for remote hosts and probes
//
// ## Design Principles
//
// 1. **Explicit pipeline**: A rotation is a named sequence of steps, never implicit hooks
// 2. **One durable unit**: Pool flags, port binding and ledger entry commit together
// 3. **Serialized claims**: Selection and claim of a free address happen under one lock
// 4. **Library-first**: The daemon is a thin shell over this crate

pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod model;
pub mod registry;
pub mod remote;
pub mod seed;
pub mod state;
pub mod traits;
pub mod verifier;

// Re-export core types for convenience
pub use allocator::Allocator;
pub use config::{EngineConfig, ProxyrotConfig, RemoteConfig, SshConfig, StoreConfig, VerifierConfig};
pub use engine::{
    BatchReport, RotationEngine, RotationEvent, RotationOutcome, SkippedPort, license_status,
    port_binding,
};
pub use error::{Error, ErrorKind, Result};
pub use model::{
    LedgerEntry, LicenseStatus, PoolAddress, Port, PortBinding, PortState, User, UserId,
};
pub use registry::BackendRegistry;
pub use remote::{Reconciler, RemoteUser, SyncReport, Synchronizer};
pub use state::{FileStore, MemoryStore};
pub use traits::{EgressProbe, PoolStore, PortStore, ProxyHost, ProxyStore, UsageLedger};
pub use verifier::OutboundVerifier;
