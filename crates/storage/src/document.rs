//! In-memory document engine
//!
//! Documents live in DashMaps; row-level locking comes from
//! `StripedLocks`. A write locks the stripes of the document id, its
//! aliases and every id it references, so:
//! - two writers of one id are serialized
//! - a delete of a referenced document waits for (or blocks) the writer
//!   that is about to reference it
//!
//! Neither a write nor a delete knows the stored aliases until it has read
//! the document, so both read, lock, then re-read and retry if the aliases
//! moved in between. An alias still referenced by another document is
//! never dropped by a write.
//!
//! # Layout
//!
//! - documents: document id -> Document
//! - existence: existence id (id or alias) -> owning document id
//! - inbound: referenced id -> ids of documents referencing it

use crate::error::StoreResult;
use crate::repository::{
    claimed_message, referenced_alias_message, sorted_unique, Applied, DeleteOutcome,
    DocumentRepository, DocumentWrite, GetOutcome, QueryOutcome, UpdateOutcome, UpsertOutcome,
};
use dashmap::DashMap;
use edstore_core::{
    Document, DocumentId, FilterParameters, Pagination, ResourceInfo, StripedLocks,
};
use std::collections::BTreeSet;
use tracing::debug;

/// Document engine adapter
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: DashMap<DocumentId, Document>,
    existence: DashMap<DocumentId, DocumentId>,
    inbound: DashMap<DocumentId, BTreeSet<DocumentId>>,
    locks: StripedLocks,
}

impl InMemoryDocumentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn write(&self, write: &DocumentWrite, insert_allowed: bool) -> Applied {
        let new = &write.document;
        let existence_ids = new.existence_ids();
        loop {
            let stored_aliases = self.stored_aliases(&new.id);
            let _guard = self.locks.lock_all(
                existence_ids
                    .iter()
                    .chain(stored_aliases.iter())
                    .chain(new.out_refs.iter().map(|r| &r.id))
                    .chain(write.enforced_refs.iter()),
            );

            let old = self.documents.get(&new.id).map(|r| r.value().clone());
            if old.as_ref().map_or_else(Vec::new, |o| o.alias_ids.clone()) != stored_aliases {
                debug!(target: "edstore::storage", id = %new.id, "Aliases changed during write, retrying");
                continue;
            }
            return self.apply(write, &existence_ids, old, insert_allowed);
        }
    }

    fn stored_aliases(&self, id: &DocumentId) -> Vec<DocumentId> {
        self.documents
            .get(id)
            .map_or_else(Vec::new, |r| r.alias_ids.clone())
    }

    /// Apply a write; the caller holds every stripe it touches
    fn apply(
        &self,
        write: &DocumentWrite,
        existence_ids: &[DocumentId],
        old: Option<Document>,
        insert_allowed: bool,
    ) -> Applied {
        let new = &write.document;
        if old.is_none() && !insert_allowed {
            return Applied::NotExists;
        }

        for existence_id in existence_ids {
            if let Some(owner) = self.existence.get(existence_id).map(|r| r.value().clone()) {
                if owner != new.id {
                    return Applied::Conflict(claimed_message(existence_id, &owner));
                }
            }
        }

        let missing: Vec<DocumentId> = write
            .enforced_refs
            .iter()
            .filter(|id| !self.existence.contains_key(*id))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Applied::Missing(sorted_unique(missing));
        }

        let dropped: Vec<DocumentId> = old
            .iter()
            .flat_map(|o| o.alias_ids.iter())
            .filter(|a| !new.alias_ids.contains(a))
            .cloned()
            .collect();
        for alias in &dropped {
            let parents: Vec<DocumentId> = self
                .inbound
                .get(alias)
                .map(|set| set.iter().filter(|p| **p != new.id).cloned().collect())
                .unwrap_or_default();
            if !parents.is_empty() {
                return Applied::Conflict(referenced_alias_message(alias, &parents));
            }
        }

        let mut document = new.clone();
        if let Some(old) = &old {
            if old.created_by.is_some() {
                document.created_by = old.created_by.clone();
            }
            for stale in old.out_refs.iter().filter(|r| !new.out_refs.contains(r)) {
                self.unlink(&stale.id, &new.id);
            }
        }
        for alias in &dropped {
            self.existence.remove(alias);
        }

        for existence_id in existence_ids {
            self.existence.insert(existence_id.clone(), document.id.clone());
        }
        for r in &document.out_refs {
            self.inbound
                .entry(r.id.clone())
                .or_default()
                .insert(document.id.clone());
        }
        self.documents.insert(document.id.clone(), document);

        if old.is_some() {
            Applied::Updated
        } else {
            Applied::Inserted
        }
    }

    fn unlink(&self, referenced: &DocumentId, parent: &DocumentId) {
        if let Some(mut parents) = self.inbound.get_mut(referenced) {
            parents.remove(parent);
        }
        self.inbound.remove_if(referenced, |_, parents| parents.is_empty());
    }

    fn referencing(&self, document: &Document) -> Vec<DocumentId> {
        let mut parents = BTreeSet::new();
        for existence_id in document.existence_ids() {
            if let Some(set) = self.inbound.get(&existence_id) {
                parents.extend(set.iter().filter(|p| **p != document.id).cloned());
            }
        }
        parents.into_iter().collect()
    }
}

impl DocumentRepository for InMemoryDocumentStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn upsert(&self, write: &DocumentWrite) -> UpsertOutcome {
        Applied::upsert_outcome(Ok(self.write(write, true)))
    }

    fn update(&self, write: &DocumentWrite) -> UpdateOutcome {
        Applied::update_outcome(Ok(self.write(write, false)))
    }

    fn get_by_id(&self, id: &DocumentId) -> GetOutcome {
        match self.documents.get(id) {
            Some(document) => GetOutcome::Success(document.value().clone()),
            None => GetOutcome::NotExists,
        }
    }

    fn delete_by_id(&self, id: &DocumentId, force: bool) -> DeleteOutcome {
        loop {
            let aliases = match self.documents.get(id) {
                Some(document) => document.alias_ids.clone(),
                None => return DeleteOutcome::NotExists,
            };

            let _guard = self.locks.lock_all(std::iter::once(id).chain(aliases.iter()));
            let document = match self.documents.get(id).map(|r| r.value().clone()) {
                Some(document) => document,
                None => return DeleteOutcome::NotExists,
            };
            if document.alias_ids != aliases {
                debug!(target: "edstore::storage", id = %id, "Aliases changed during delete, retrying");
                continue;
            }

            let referencing = self.referencing(&document);
            if !referencing.is_empty() && !force {
                return DeleteOutcome::ReferenceConflict(referencing);
            }

            for existence_id in document.existence_ids() {
                self.existence.remove_if(&existence_id, |_, owner| owner == id);
            }
            for r in &document.out_refs {
                self.unlink(&r.id, id);
            }
            self.documents.remove(id);
            return DeleteOutcome::Success(document);
        }
    }

    fn query(
        &self,
        resource: &ResourceInfo,
        filters: &FilterParameters,
        pagination: &Pagination,
    ) -> QueryOutcome {
        if let Err(e) = filters.validate() {
            return QueryOutcome::InvalidQuery(e.to_string());
        }
        let mut matches: Vec<Document> = self
            .documents
            .iter()
            .filter(|r| r.resource.matches(resource) && filters.matches(&r.body))
            .map(|r| r.value().clone())
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        QueryOutcome::Success(pagination.apply(matches))
    }

    fn find_existing(&self, ids: &[DocumentId]) -> StoreResult<Vec<DocumentId>> {
        Ok(sorted_unique(
            ids.iter()
                .filter(|id| self.existence.contains_key(*id))
                .cloned()
                .collect(),
        ))
    }

    fn scan(&self, after: Option<&DocumentId>, limit: usize) -> StoreResult<Vec<Document>> {
        let mut ids: Vec<DocumentId> = self
            .documents
            .iter()
            .map(|r| r.key().clone())
            .filter(|id| after.map_or(true, |a| id > a))
            .collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.documents.get(&id).map(|r| r.value().clone()))
            .take(limit)
            .collect())
    }
}
