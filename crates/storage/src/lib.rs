//! Storage layer for edstore
//!
//! This crate implements the repository contract over three engines:
//! - InMemoryDocumentStore: DashMap documents with striped row locks
//! - SqliteRepository: pooled SQLite, `BEGIN IMMEDIATE` write transactions
//! - RedbRepository: redb key-value tables, queries served by the search index
//!
//! All three give the same answers for the same sequence of operations;
//! the shared conformance suite in `tests/` runs against each.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod kv;
pub mod relational;
pub mod repository;
pub mod sql;

pub use document::InMemoryDocumentStore;
pub use error::{StoreError, StoreResult};
pub use kv::RedbRepository;
pub use relational::{SqliteOptions, SqliteRepository};
pub use repository::{
    DeleteOutcome, DocumentRepository, DocumentWrite, GetOutcome, QueryOutcome, UpdateOutcome,
    UpsertOutcome,
};
pub use sql::ParameterizedQuery;
