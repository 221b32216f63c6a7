//! Remote proxy configuration: applying bindings and reading them back

mod reconciler;
mod synchronizer;

pub use reconciler::{Reconciler, RemoteUser, SyncReport};
pub use synchronizer::Synchronizer;
