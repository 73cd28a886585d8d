//! Error types for edstore core
//!
//! This module defines the errors raised while building identities,
//! references and query filters. We use `thiserror` for automatic
//! `Display` and `Error` trait implementations.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the core data model
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Identity is empty, has an empty field name, or repeats a field name
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Document id is not a 56 character hex string
    #[error("Invalid document id: {0:?}")]
    InvalidDocumentId(String),

    /// Reference or resource coordinates are incomplete
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Query filter field is not a valid dotted path
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_invalid_identity() {
        let err = Error::InvalidIdentity("empty field name".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Invalid identity"));
        assert!(msg.contains("empty field name"));
    }

    #[test]
    fn test_error_display_invalid_document_id() {
        let err = Error::InvalidDocumentId("xyz".to_string());
        assert!(err.to_string().contains("\"xyz\""));
    }

    #[test]
    fn test_error_from_serde_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = result.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
