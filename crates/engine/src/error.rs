//! Error types for the engine's startup and maintenance paths
//!
//! Request paths never return these; they answer with result enums.
//! Loading configuration, constructing a backend and running a reindex
//! can fail outright, and report through `EngineError`.

use edstore_search::IndexError;
use edstore_storage::StoreError;
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors raised while opening or maintaining a document service
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be parsed or failed validation
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No constructor is registered under the configured backend key
    #[error("Unknown backend: {0:?}")]
    UnknownBackend(String),

    /// Storage engine failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Search index failure
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(e: toml::ser::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}
