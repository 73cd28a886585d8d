//! edstore - persistence and consistency layer for education API documents
//!
//! edstore stores API documents behind one repository contract that is
//! satisfied by three storage engines (in-memory document store, SQLite,
//! redb), validates references between documents before commit, and keeps a
//! secondary search index eventually consistent with the primary store.
//!
//! # Quick Start
//!
//! ```ignore
//! use edstore::{DocumentService, EdstoreConfig, UpsertRequest};
//!
//! let service = DocumentService::open(&EdstoreConfig::default())?;
//! let result = service.upsert(request);
//! ```
//!
//! # Architecture
//!
//! All operations go through the [`DocumentService`], which derives the
//! document id, validates references, commits through the configured
//! repository and hands the change to the search index projector.
//!
//! Storage engines and the search index are reachable through
//! [`DocumentService::repository`] and [`DocumentService::search_index`];
//! their crates are not re-exported beyond the traits needed to plug in
//! custom ones.

// Re-export the request/result model and the service
pub use edstore_core::{
    alias_id, derive_checked, derive_document_id, reference_id, AuthorizationStrategy,
    DeleteRequest, DeleteResponse, DeleteResult, Document, DocumentId, DocumentIdentity,
    DocumentReference, Error, FilterParameters, GetRequest, GetResponse, GetResult, OutboundRef,
    Pagination, QueryRequest, QueryResponse, QueryResult, ResourceInfo, Result, Security,
    SuperclassInfo, TraceId, UpdateRequest, UpdateResponse, UpdateResult, UpsertRequest,
    UpsertResponse, UpsertResult,
};
pub use edstore_engine::*;
