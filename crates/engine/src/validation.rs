//! Reference validation
//!
//! Before a write, every outbound reference the document enforces must
//! resolve to a stored document or alias. The check goes to the
//! existence cache first and to the repository for the misses, one batch
//! each. All unresolved references are reported together.
//!
//! Which references are enforced depends on the [`DescriptorPolicy`]:
//!
//! | referencing doc | referenced doc | Strict   | Bootstrap |
//! |-----------------|----------------|----------|-----------|
//! | resource        | resource       | enforced | enforced  |
//! | resource        | descriptor     | enforced | deferred  |
//! | descriptor      | resource       | deferred | deferred  |
//! | descriptor      | descriptor     | enforced | deferred  |

use crate::cache::ExistenceCache;
use edstore_core::{Document, DocumentId};
use edstore_storage::{DocumentRepository, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// How references to descriptors are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorPolicy {
    /// Descriptor references must resolve like any other
    #[default]
    Strict,
    /// Descriptor references are recorded but not checked, so descriptors
    /// can be loaded after the documents that use them
    Bootstrap,
}

/// Outcome of validating one document's references
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// Enforced references that resolve to nothing, sorted
    pub invalid_refs: Vec<DocumentId>,
    /// References that were checked, sorted
    pub enforced: Vec<DocumentId>,
    /// References skipped under the descriptor policy, sorted
    pub deferred: Vec<DocumentId>,
}

impl ValidationResult {
    /// Whether every enforced reference resolved
    pub fn is_valid(&self) -> bool {
        self.invalid_refs.is_empty()
    }

    /// Whether every outbound reference was checked
    pub fn fully_checked(&self) -> bool {
        self.deferred.is_empty()
    }
}

/// Checks outbound references against cache and repository
pub struct ReferenceValidator {
    repository: Arc<dyn DocumentRepository>,
    cache: Arc<dyn ExistenceCache>,
    policy: DescriptorPolicy,
}

impl ReferenceValidator {
    /// Create a validator
    pub fn new(
        repository: Arc<dyn DocumentRepository>,
        cache: Arc<dyn ExistenceCache>,
        policy: DescriptorPolicy,
    ) -> Self {
        ReferenceValidator {
            repository,
            cache,
            policy,
        }
    }

    /// Active descriptor policy
    pub fn policy(&self) -> DescriptorPolicy {
        self.policy
    }

    /// Split a document's references into (enforced, deferred), each sorted
    pub fn partition(&self, document: &Document) -> (Vec<DocumentId>, Vec<DocumentId>) {
        let mut enforced = Vec::new();
        let mut deferred = Vec::new();
        for r in &document.out_refs {
            let defer = (document.resource.is_descriptor && !r.is_descriptor)
                || (r.is_descriptor && self.policy == DescriptorPolicy::Bootstrap);
            if defer {
                deferred.push(r.id.clone());
            } else {
                enforced.push(r.id.clone());
            }
        }
        enforced.sort();
        deferred.sort();
        (enforced, deferred)
    }

    /// Check every enforced reference of a document
    ///
    /// # Errors
    ///
    /// Returns the repository's error if the existence query fails.
    pub fn validate(&self, document: &Document) -> StoreResult<ValidationResult> {
        let (enforced, deferred) = self.partition(document);
        if enforced.is_empty() {
            return Ok(ValidationResult {
                invalid_refs: Vec::new(),
                enforced,
                deferred,
            });
        }

        let cached: BTreeSet<DocumentId> = self.cache.has(&enforced).into_iter().collect();
        let misses: Vec<DocumentId> = enforced
            .iter()
            .filter(|id| !cached.contains(*id))
            .cloned()
            .collect();

        let invalid_refs = if misses.is_empty() {
            Vec::new()
        } else {
            let found: BTreeSet<DocumentId> =
                self.repository.find_existing(&misses)?.into_iter().collect();
            misses
                .into_iter()
                .filter(|id| !found.contains(id))
                .collect()
        };

        debug!(
            target: "edstore::engine",
            id = %document.id,
            enforced = enforced.len(),
            cache_hits = cached.len(),
            invalid = invalid_refs.len(),
            "Validated references"
        );

        Ok(ValidationResult {
            invalid_refs,
            enforced,
            deferred,
        })
    }
}
