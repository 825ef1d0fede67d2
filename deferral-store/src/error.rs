//! Error types for delayed message storage.
//!
//! Every backend failure surfaces as a [`StoreError`]; the store never drops
//! an entry silently. Callers decide whether to retry or trip a breaker.

use std::io;

use thiserror::Error;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (opening the database file, creating directories).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The SQLite backend reported a failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection to the backend could not be used.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Header blob could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// An entry with this message id is already stored.
    #[error("Delayed message already exists: {0}")]
    AlreadyExists(String),

    /// The backend has reached its configured capacity.
    #[error("Store capacity exceeded: {used}/{capacity} delayed messages")]
    CapacityExceeded { used: usize, capacity: usize },

    /// An operation was attempted before `initialize`.
    #[error("Store not initialized: {0}")]
    NotInitialized(String),

    /// The transaction was already committed or rolled back.
    #[error("Transaction {0} is no longer active")]
    TransactionFinished(String),

    /// Invalid backend configuration.
    #[error("Invalid store configuration: {0}")]
    InvalidConfiguration(String),

    /// Failure injected by the test backend.
    #[error("Injected failure during {0}")]
    Injected(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Header blob encoding and decoding errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Bincode serialization failed.
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Bincode deserialization failed.
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl StoreError {
    /// Returns `true` if the entry was already present.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(error: tokio_rusqlite::Error) -> Self {
        match error {
            tokio_rusqlite::Error::Rusqlite(e) => Self::Sqlite(e),
            tokio_rusqlite::Error::ConnectionClosed => {
                Self::Connection("Connection closed".to_string())
            }
            other => Self::Connection(other.to_string()),
        }
    }
}
