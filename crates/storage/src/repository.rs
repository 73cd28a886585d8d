//! The repository contract every storage engine implements
//!
//! Operations report outcomes rather than errors. Engine failures are
//! caught inside each adapter and surface as `UnknownFailure(message)`;
//! only the two helper queries used by validation and reindexing return
//! `StoreResult`.
//!
//! ## Guarantees every adapter upholds
//!
//! - Concurrent upserts of one id yield exactly one `InsertSuccess`.
//! - Enforced references are re-checked inside the adapter's own atomic
//!   unit, so a delete racing with validation shows up as
//!   `ValidationFailure`, never as a dangling committed reference.
//! - An existence id (document id or alias) belongs to one document.
//! - A document with inbound references is only deleted when forced.
//! - `created_by` of an existing document survives replacement.

use crate::error::StoreResult;
use edstore_core::{Document, DocumentId, FilterParameters, Pagination, ResourceInfo};

/// A document ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    /// The full document, id and references already derived
    pub document: Document,
    /// References that must resolve at commit time, sorted
    pub enforced_refs: Vec<DocumentId>,
}

impl DocumentWrite {
    /// Write that enforces every outbound reference
    pub fn enforcing_all(document: Document) -> Self {
        let enforced_refs = document.out_ref_ids();
        DocumentWrite {
            document,
            enforced_refs,
        }
    }
}

/// Outcome of [`DocumentRepository::upsert`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Id was unknown; document inserted
    InsertSuccess,
    /// Id was known; document replaced
    UpdateSuccess,
    /// Enforced references that do not resolve, sorted
    ValidationFailure(Vec<DocumentId>),
    /// An existence id is claimed by another document
    Conflict(String),
    /// Engine failure
    UnknownFailure(String),
}

/// Outcome of [`DocumentRepository::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Document replaced
    Success,
    /// Id is unknown; nothing written
    NotExists,
    /// Enforced references that do not resolve, sorted
    ValidationFailure(Vec<DocumentId>),
    /// An existence id is claimed by another document
    Conflict(String),
    /// Engine failure
    UnknownFailure(String),
}

/// Outcome of [`DocumentRepository::get_by_id`]
#[derive(Debug, Clone, PartialEq)]
pub enum GetOutcome {
    /// Found
    Success(Document),
    /// No such id
    NotExists,
    /// Engine failure
    UnknownFailure(String),
}

/// Outcome of [`DocumentRepository::delete_by_id`]
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// Removed; carries the removed document
    Success(Document),
    /// No such id
    NotExists,
    /// Documents still referencing it, sorted
    ReferenceConflict(Vec<DocumentId>),
    /// Engine failure
    UnknownFailure(String),
}

/// Outcome of [`DocumentRepository::query`]
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Matches in id order
    Success(Vec<Document>),
    /// A filter path is malformed
    InvalidQuery(String),
    /// Engine failure
    UnknownFailure(String),
}

/// Uniform persistence interface over one storage engine
///
/// Implementations are shared across request threads behind an `Arc`.
pub trait DocumentRepository: Send + Sync {
    /// Registry key of this adapter, for logs
    fn name(&self) -> &'static str;

    /// Insert when the id is unknown, replace when known
    fn upsert(&self, write: &DocumentWrite) -> UpsertOutcome;

    /// Replace an existing document; never inserts
    fn update(&self, write: &DocumentWrite) -> UpdateOutcome;

    /// Fetch by document id
    fn get_by_id(&self, id: &DocumentId) -> GetOutcome;

    /// Delete by document id
    ///
    /// Without `force`, any inbound reference to the id or one of its
    /// aliases from another document blocks the delete.
    fn delete_by_id(&self, id: &DocumentId, force: bool) -> DeleteOutcome;

    /// Documents of a resource whose body matches every filter
    fn query(
        &self,
        resource: &ResourceInfo,
        filters: &FilterParameters,
        pagination: &Pagination,
    ) -> QueryOutcome;

    /// Subset of `ids` that resolve to a stored document, sorted
    ///
    /// Aliases count as existing.
    fn find_existing(&self, ids: &[DocumentId]) -> StoreResult<Vec<DocumentId>>;

    /// Up to `limit` documents with id greater than `after`, in id order
    fn scan(&self, after: Option<&DocumentId>, limit: usize) -> StoreResult<Vec<Document>>;
}

/// Sorted, unique ids
pub(crate) fn sorted_unique(mut ids: Vec<DocumentId>) -> Vec<DocumentId> {
    ids.sort();
    ids.dedup();
    ids
}

/// Conflict message for an existence id already owned elsewhere
pub(crate) fn claimed_message(existence_id: &DocumentId, owner: &DocumentId) -> String {
    format!(
        "identity {} is already claimed by document {}",
        existence_id, owner
    )
}

/// Conflict message for an alias a write would drop while others use it
pub(crate) fn referenced_alias_message(alias: &DocumentId, parents: &[DocumentId]) -> String {
    let parents: Vec<&str> = parents.iter().map(|p| p.as_str()).collect();
    format!(
        "identity {} is still referenced by documents {}",
        alias,
        parents.join(", ")
    )
}

/// What an adapter's write path did, before mapping to an outcome
pub(crate) enum Applied {
    Inserted,
    Updated,
    NotExists,
    Missing(Vec<DocumentId>),
    Conflict(String),
}

impl Applied {
    pub(crate) fn upsert_outcome(result: StoreResult<Applied>) -> UpsertOutcome {
        match result {
            Ok(Applied::Inserted) => UpsertOutcome::InsertSuccess,
            Ok(Applied::Updated) => UpsertOutcome::UpdateSuccess,
            Ok(Applied::Missing(ids)) => UpsertOutcome::ValidationFailure(ids),
            Ok(Applied::Conflict(message)) => UpsertOutcome::Conflict(message),
            Ok(Applied::NotExists) => {
                UpsertOutcome::UnknownFailure("insert unexpectedly refused".to_string())
            }
            Err(e) => UpsertOutcome::UnknownFailure(e.to_string()),
        }
    }

    pub(crate) fn update_outcome(result: StoreResult<Applied>) -> UpdateOutcome {
        match result {
            Ok(Applied::Updated) => UpdateOutcome::Success,
            Ok(Applied::NotExists) => UpdateOutcome::NotExists,
            Ok(Applied::Missing(ids)) => UpdateOutcome::ValidationFailure(ids),
            Ok(Applied::Conflict(message)) => UpdateOutcome::Conflict(message),
            Ok(Applied::Inserted) => {
                UpdateOutcome::UnknownFailure("update unexpectedly inserted".to_string())
            }
            Err(e) => UpdateOutcome::UnknownFailure(e.to_string()),
        }
    }
}
