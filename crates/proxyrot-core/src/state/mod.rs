// # Store Implementations
//
// This module provides the ProxyStore implementations:
// - MemoryStore: in-memory storage (for testing)
// - FileStore: file-based persistent storage (for production)

pub mod file;
pub mod memory;
mod tables;

pub use file::FileStore;
pub use memory::MemoryStore;
