//! Error types for proxyrot
//!
//! The first six variants are the rotation taxonomy surfaced to callers;
//! the rest are ambient failures of storage, configuration and I/O.

use std::net::IpAddr;

use thiserror::Error;

use crate::model::UserId;

/// Result type alias for proxyrot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for proxyrot
#[derive(Error, Debug)]
pub enum Error {
    /// The caller does not own the port
    #[error("User {user} does not own port {port}")]
    Unauthorized {
        /// Port number
        port: u16,
        /// Requesting user
        user: UserId,
    },

    /// The rotation cooldown for the port has not elapsed
    #[error("Port {port} was rotated too recently, retry in {}s", .remaining.num_seconds())]
    RateLimited {
        /// Port number
        port: u16,
        /// Time left until the next rotation is allowed
        remaining: chrono::Duration,
    },

    /// No pool address is available for the user
    #[error("No pool address available for user {user}")]
    PoolExhausted {
        /// User the allocation was attempted for
        user: UserId,
    },

    /// The proxy rejected the edited configuration; the fragment was restored
    #[error("Remote configuration rejected for port {port}: {validator_output}")]
    RemoteConfigInvalid {
        /// Port number
        port: u16,
        /// Raw validator output
        validator_output: String,
    },

    /// Transport or authentication failure on the remote-command channel
    #[error("Remote host unavailable: {0}")]
    RemoteUnavailable(String),

    /// The remote side changed but the local commit failed
    #[error(
        "Ledger inconsistency on port {port} for user {user} ({old:?} -> {new}): {reason}"
    )]
    LedgerInconsistency {
        /// Port number
        port: u16,
        /// Owning user
        user: UserId,
        /// Previously bound address
        old: Option<IpAddr>,
        /// Address already applied on the remote host
        new: IpAddr,
        /// Underlying failure
        reason: String,
    },

    /// Store-related errors
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Coarse classification used by presentation layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    RateLimited,
    PoolExhausted,
    RemoteConfigInvalid,
    RemoteUnavailable,
    LedgerInconsistency,
    NotFound,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    /// HTTP-equivalent status code for this kind of failure
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::Unauthorized => 403,
            ErrorKind::RateLimited => 429,
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput => 400,
            ErrorKind::RemoteUnavailable => 503,
            ErrorKind::PoolExhausted
            | ErrorKind::RemoteConfigInvalid
            | ErrorKind::LedgerInconsistency
            | ErrorKind::Internal => 500,
        }
    }
}

impl Error {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Unauthorized { .. } => ErrorKind::Unauthorized,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::RemoteConfigInvalid { .. } => ErrorKind::RemoteConfigInvalid,
            Error::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            Error::LedgerInconsistency { .. } => ErrorKind::LedgerInconsistency,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the remote host may have been left in a state the local store does not reflect
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LedgerInconsistency { .. })
    }

    /// Create a remote-unavailable error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::RemoteUnavailable(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
