//! Per-resource search index
//!
//! This module provides:
//! - SearchIndex with one ResourceIndex per `project$version$resource`
//! - Posting lists keyed by `(path, value)` terms from the flattened body
//! - Version watermark for consistency checks
//! - Availability switch for taking the index offline
//!
//! # Usage
//!
//! The projector writes through [`ProjectionSink`]; the key-value engine
//! and the service read through [`SearchIndex::search`]. A search that
//! runs before the projector has caught up may miss a committed document.

use dashmap::DashMap;
use edstore_core::query::flatten_body;
use edstore_core::{Document, DocumentId, FilterParameters, Pagination, ResourceInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

// ============================================================================
// Errors and sink trait
// ============================================================================

/// Failure reported by a projection sink
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    /// The index is offline; the write can be retried later
    #[error("Search index unavailable")]
    Unavailable,

    /// The sink refuses this document
    #[error("Document {id} rejected by search index: {reason}")]
    Rejected {
        /// Document that was refused
        id: DocumentId,
        /// Why it was refused
        reason: String,
    },
}

/// Write side of a secondary index
///
/// Implementations must be idempotent: applying the same upsert or remove
/// twice leaves the same state as applying it once.
pub trait ProjectionSink: Send + Sync {
    /// Insert or replace the entry for a document
    fn upsert(&self, document: &Document) -> Result<(), IndexError>;

    /// Remove the entry for an id; removing an absent id succeeds
    fn remove(&self, id: &DocumentId) -> Result<(), IndexError>;

    /// Drop every entry
    fn clear(&self) -> Result<(), IndexError>;
}

/// Name of the index holding a resource's documents
///
/// `project$version$resource`, lowercased, with `.` replaced by `-`.
pub fn index_name(resource: &ResourceInfo) -> String {
    format!(
        "{}${}${}",
        resource.project_name, resource.resource_version, resource.resource_name
    )
    .to_lowercase()
    .replace('.', "-")
}

// ============================================================================
// PostingList
// ============================================================================

/// Ids of documents containing one `(path, value)` term
#[derive(Debug, Clone, Default)]
pub struct PostingList {
    ids: BTreeSet<DocumentId>,
}

impl PostingList {
    /// Number of documents containing this term
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if posting list is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Check if a document contains this term
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.ids.contains(id)
    }
}

// ============================================================================
// ResourceIndex
// ============================================================================

#[derive(Debug, Default)]
struct ResourceIndex {
    documents: BTreeMap<DocumentId, Document>,
    postings: BTreeMap<(String, String), PostingList>,
}

impl ResourceIndex {
    fn put(&mut self, document: Document) {
        self.take(&document.id);
        for term in flatten_body(&document.body) {
            self.postings
                .entry(term)
                .or_default()
                .ids
                .insert(document.id.clone());
        }
        self.documents.insert(document.id.clone(), document);
    }

    fn take(&mut self, id: &DocumentId) -> Option<Document> {
        let old = self.documents.remove(id)?;
        for term in flatten_body(&old.body) {
            if let Some(list) = self.postings.get_mut(&term) {
                list.ids.remove(id);
                if list.ids.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        Some(old)
    }

    fn matching(&self, filters: &FilterParameters) -> Vec<&DocumentId> {
        if filters.is_empty() {
            return self.documents.keys().collect();
        }

        let mut lists = Vec::with_capacity(filters.len());
        for (path, value) in filters.iter() {
            match self.postings.get(&(path.to_string(), value.to_string())) {
                Some(list) => lists.push(list),
                None => return Vec::new(),
            }
        }

        // Walk the shortest list, check the others
        lists.sort_by_key(|l| l.len());
        let (first, rest) = match lists.split_first() {
            Some(split) => split,
            None => return Vec::new(),
        };
        first
            .ids
            .iter()
            .filter(|id| rest.iter().all(|l| l.contains(id)))
            .collect()
    }
}

// ============================================================================
// SearchIndex
// ============================================================================

/// Eventually consistent secondary index over stored documents
///
/// # Thread Safety
///
/// Uses DashMap for concurrent access. Writers for the same id must be
/// serialized by the caller (the projector holds the id's stripe lock).
///
/// # Version Watermark
///
/// Incremented on every change, so tests and callers can wait for a
/// projection to land.
pub struct SearchIndex {
    /// index name -> resource index
    indices: DashMap<String, ResourceIndex>,

    /// document id -> index name holding it
    owners: DashMap<DocumentId, String>,

    /// Whether the index accepts reads and writes
    available: AtomicBool,

    /// Version watermark for consistency
    version: AtomicU64,
}

impl Default for SearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchIndex {
    /// Create an empty, available index
    pub fn new() -> Self {
        SearchIndex {
            indices: DashMap::new(),
            owners: DashMap::new(),
            available: AtomicBool::new(true),
            version: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Availability
    // ========================================================================

    /// Check if the index is online
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Take the index offline or bring it back
    ///
    /// Offline, every read and write fails with `IndexError::Unavailable`.
    /// Data is kept.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        info!(target: "edstore::search", available, "Search index availability changed");
    }

    fn check_available(&self) -> Result<(), IndexError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(IndexError::Unavailable)
        }
    }

    // ========================================================================
    // Version Watermark
    // ========================================================================

    /// Get current version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Wait for index to reach a version (with timeout)
    ///
    /// Returns true if version was reached, false on timeout.
    pub fn wait_for_version(&self, version: u64, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.version.load(Ordering::Acquire) >= version {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::yield_now();
        }
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Total number of indexed documents
    pub fn total_docs(&self) -> usize {
        self.owners.len()
    }

    /// Names of indices that currently hold documents
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .indices
            .iter()
            .filter(|r| !r.documents.is_empty())
            .map(|r| r.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Check if a document is indexed
    pub fn contains(&self, id: &DocumentId) -> bool {
        self.owners.contains_key(id)
    }

    /// Indexed copy of a document
    pub fn get(&self, id: &DocumentId) -> Option<Document> {
        let name = self.owners.get(id).map(|r| r.value().clone())?;
        let index = self.indices.get(&name)?;
        index.documents.get(id).cloned()
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// Documents of a resource matching every filter, in id order
    ///
    /// Filter paths are assumed valid; a malformed path simply matches
    /// nothing.
    pub fn search(
        &self,
        resource: &ResourceInfo,
        filters: &FilterParameters,
        pagination: &Pagination,
    ) -> Result<Vec<Document>, IndexError> {
        self.check_available()?;
        let index = match self.indices.get(&index_name(resource)) {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };
        // Index names fold case and `.`, so coordinates are compared exactly
        let hits: Vec<&Document> = index
            .matching(filters)
            .into_iter()
            .filter_map(|id| index.documents.get(id))
            .filter(|document| document.resource.matches(resource))
            .collect();
        Ok(pagination.apply(hits).into_iter().cloned().collect())
    }

    fn remove_entry(&self, id: &DocumentId) -> bool {
        let name = match self.owners.remove(id) {
            Some((_, name)) => name,
            None => return false,
        };
        if let Some(mut index) = self.indices.get_mut(&name) {
            index.take(id);
        }
        true
    }
}

impl ProjectionSink for SearchIndex {
    fn upsert(&self, document: &Document) -> Result<(), IndexError> {
        self.check_available()?;
        if !document.body.is_object() {
            return Err(IndexError::Rejected {
                id: document.id.clone(),
                reason: "body is not a JSON object".to_string(),
            });
        }

        let name = index_name(&document.resource);
        let previous = self.owners.get(&document.id).map(|r| r.value().clone());
        if previous.as_deref().is_some_and(|p| p != name) {
            self.remove_entry(&document.id);
        }

        self.indices
            .entry(name.clone())
            .or_default()
            .put(document.clone());
        self.owners.insert(document.id.clone(), name);
        self.bump();

        debug!(target: "edstore::search", id = %document.id, "Indexed document");
        Ok(())
    }

    fn remove(&self, id: &DocumentId) -> Result<(), IndexError> {
        self.check_available()?;
        if self.remove_entry(id) {
            self.bump();
            debug!(target: "edstore::search", id = %id, "Removed document from index");
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), IndexError> {
        self.check_available()?;
        self.indices.clear();
        self.owners.clear();
        self.bump();
        info!(target: "edstore::search", "Cleared search index");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
