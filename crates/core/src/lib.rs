//! Core types for edstore
//!
//! This crate defines the foundational types used throughout the system:
//! - DocumentId: 224-bit hex identifier derived from a document's identity
//! - DocumentIdentity: canonical (sorted) natural-key name/value pairs
//! - ResourceInfo: project/resource/version coordinates of a document
//! - Document: the unit of storage, with outbound references and alias ids
//! - Identity derivation: pure SHA-224 hashing of identity coordinates
//! - Messages: request/result types exchanged with collaborators
//! - Query types: FilterParameters, Pagination, body field flattening
//! - StripedLocks: fixed-size lock table for per-id serialization
//! - Error: Error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod identity;
pub mod locks;
pub mod message;
pub mod query;
pub mod types;

pub use error::{Error, Result};
pub use identity::{alias_id, derive_document_id, derive_checked, reference_id};
pub use locks::{StripedLocks, StripeGuard};
pub use message::{
    DeleteRequest, DeleteResponse, DeleteResult, GetRequest, GetResponse, GetResult, QueryRequest,
    QueryResponse, QueryResult, UpdateRequest, UpdateResponse, UpdateResult, UpsertRequest,
    UpsertResponse, UpsertResult,
};
pub use query::{flatten_body, scalar_at_path, FilterParameters, Pagination};
pub use types::{
    AuthorizationStrategy, Document, DocumentId, DocumentIdentity, DocumentReference, OutboundRef,
    ResourceInfo, Security, SuperclassInfo, TraceId,
};
