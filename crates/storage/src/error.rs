//! Storage engine errors
//!
//! Internals of every adapter return `StoreResult`. The repository trait
//! never exposes these: each adapter turns them into an `UnknownFailure`
//! outcome at its boundary, logging the message.

use thiserror::Error;

/// Result type alias for storage internals
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by storage engines
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The engine itself failed (I/O, SQL, transaction)
    #[error("Storage engine error: {0}")]
    Engine(String),

    /// No connection could be taken from the pool
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// A stored document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored data violates an engine invariant
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Core model error while rebuilding a stored document
    #[error(transparent)]
    Core(#[from] edstore_core::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Engine(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Pool(e.to_string())
    }
}

macro_rules! engine_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(e: $ty) -> Self {
                    StoreError::Engine(e.to_string())
                }
            }
        )*
    };
}

engine_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
