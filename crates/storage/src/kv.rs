//! Key-value engine: redb, with queries served by the search index
//!
//! # Tables
//!
//! - documents: document id -> JSON encoded Document
//! - existence: existence id (document id or alias) -> owning document id
//! - inbound: "referenced|parent" -> parent id
//!
//! redb runs one write transaction at a time, so the read-check-write
//! sequence of an upsert or delete is atomic without further locking.
//! Reads use MVCC read transactions and never block writers.
//!
//! The engine has no secondary indexes over bodies. `query` is answered
//! by the shared [`SearchIndex`], which the projector keeps eventually
//! consistent; a document committed a moment ago may not be found yet.
//! While the index is offline, queries fall back to a full table scan.

use crate::error::StoreResult;
use crate::repository::{
    claimed_message, referenced_alias_message, sorted_unique, Applied, DeleteOutcome,
    DocumentRepository, DocumentWrite, GetOutcome, QueryOutcome, UpdateOutcome, UpsertOutcome,
};
use edstore_core::{Document, DocumentId, FilterParameters, Pagination, ResourceInfo};
use edstore_search::{IndexError, SearchIndex};
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const EXISTENCE: TableDefinition<&str, &str> = TableDefinition::new("existence");
const INBOUND: TableDefinition<&str, &str> = TableDefinition::new("inbound");

fn inbound_key(referenced: &DocumentId, parent: &DocumentId) -> String {
    format!("{}|{}", referenced, parent)
}

/// Key range covering every inbound entry of `referenced`
fn inbound_range(referenced: &DocumentId) -> (String, String) {
    // '~' sorts after every hex digit
    (format!("{}|", referenced), format!("{}|~", referenced))
}

/// Documents other than `owner` referencing any of `ids`, sorted
fn inbound_parents(
    inbound: &impl ReadableTable<&'static str, &'static str>,
    ids: &[DocumentId],
    owner: &DocumentId,
) -> StoreResult<Vec<DocumentId>> {
    let mut parents = Vec::new();
    for id in ids {
        let (start, end) = inbound_range(id);
        for entry in inbound.range::<&str>(start.as_str()..end.as_str())? {
            let (_, parent) = entry?;
            let parent = DocumentId::parse(parent.value())?;
            if &parent != owner {
                parents.push(parent);
            }
        }
    }
    Ok(sorted_unique(parents))
}

/// Key-value engine adapter
pub struct RedbRepository {
    db: Database,
    index: Arc<SearchIndex>,
}

impl RedbRepository {
    /// Open (creating if needed) a database file
    ///
    /// `None` keeps the whole database in memory.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or the tables cannot be created.
    pub fn open(path: Option<&Path>, index: Arc<SearchIndex>) -> StoreResult<Self> {
        let db = match path {
            Some(path) => Database::create(path)?,
            None => Database::builder().create_with_backend(InMemoryBackend::new())?,
        };

        let txn = db.begin_write()?;
        {
            txn.open_table(DOCUMENTS)?;
            txn.open_table(EXISTENCE)?;
            txn.open_table(INBOUND)?;
        }
        txn.commit()?;

        info!(
            target: "edstore::storage",
            path = %path.map_or_else(|| "<memory>".to_string(), |p| p.display().to_string()),
            "Opened redb repository"
        );
        Ok(RedbRepository { db, index })
    }

    /// The search index queries are delegated to
    pub fn search_index(&self) -> &Arc<SearchIndex> {
        &self.index
    }

    fn write(&self, write: &DocumentWrite, insert_allowed: bool) -> StoreResult<Applied> {
        let new = &write.document;
        let txn = self.db.begin_write()?;
        let applied = {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut existence = txn.open_table(EXISTENCE)?;
            let mut inbound = txn.open_table(INBOUND)?;

            let old: Option<Document> = match documents.get(new.id.as_str())? {
                Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
                None => None,
            };
            if old.is_none() && !insert_allowed {
                return Ok(Applied::NotExists);
            }

            let existence_ids = new.existence_ids();
            for existence_id in &existence_ids {
                let owner = existence
                    .get(existence_id.as_str())?
                    .map(|g| g.value().to_string());
                if let Some(owner) = owner {
                    if owner != new.id.as_str() {
                        let owner = DocumentId::parse(&owner)?;
                        return Ok(Applied::Conflict(claimed_message(existence_id, &owner)));
                    }
                }
            }

            let mut missing = Vec::new();
            for id in &write.enforced_refs {
                if existence.get(id.as_str())?.is_none() {
                    missing.push(id.clone());
                }
            }
            if !missing.is_empty() {
                return Ok(Applied::Missing(sorted_unique(missing)));
            }

            let dropped: Vec<DocumentId> = old
                .iter()
                .flat_map(|o| o.alias_ids.iter())
                .filter(|a| !new.alias_ids.contains(a))
                .cloned()
                .collect();
            for alias in &dropped {
                let parents = inbound_parents(&inbound, std::slice::from_ref(alias), &new.id)?;
                if !parents.is_empty() {
                    return Ok(Applied::Conflict(referenced_alias_message(alias, &parents)));
                }
            }

            let mut document = new.clone();
            if let Some(old) = &old {
                if old.created_by.is_some() {
                    document.created_by = old.created_by.clone();
                }
                for r in &old.out_refs {
                    inbound.remove(inbound_key(&r.id, &old.id).as_str())?;
                }
            }
            for alias in &dropped {
                existence.remove(alias.as_str())?;
            }

            for existence_id in &existence_ids {
                existence.insert(existence_id.as_str(), document.id.as_str())?;
            }
            for r in &document.out_refs {
                inbound.insert(inbound_key(&r.id, &document.id).as_str(), document.id.as_str())?;
            }
            let encoded = serde_json::to_vec(&document)?;
            documents.insert(document.id.as_str(), encoded.as_slice())?;

            if old.is_some() {
                Applied::Updated
            } else {
                Applied::Inserted
            }
        };
        txn.commit()?;
        Ok(applied)
    }

    fn try_get(&self, id: &DocumentId) -> StoreResult<Option<Document>> {
        let txn = self.db.begin_read()?;
        let documents = txn.open_table(DOCUMENTS)?;
        let document = match documents.get(id.as_str())? {
            Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
            None => None,
        };
        Ok(document)
    }

    fn try_delete(&self, id: &DocumentId, force: bool) -> StoreResult<DeleteOutcome> {
        let txn = self.db.begin_write()?;
        let document = {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut existence = txn.open_table(EXISTENCE)?;
            let mut inbound = txn.open_table(INBOUND)?;

            let document: Document = match documents.get(id.as_str())? {
                Some(bytes) => serde_json::from_slice(bytes.value())?,
                None => return Ok(DeleteOutcome::NotExists),
            };

            let referencing = inbound_parents(&inbound, &document.existence_ids(), id)?;
            if !referencing.is_empty() && !force {
                return Ok(DeleteOutcome::ReferenceConflict(referencing));
            }

            for existence_id in document.existence_ids() {
                let owned = existence
                    .get(existence_id.as_str())?
                    .is_some_and(|g| g.value() == id.as_str());
                if owned {
                    existence.remove(existence_id.as_str())?;
                }
            }
            for r in &document.out_refs {
                inbound.remove(inbound_key(&r.id, id).as_str())?;
            }
            documents.remove(id.as_str())?;
            document
        };
        txn.commit()?;
        Ok(DeleteOutcome::Success(document))
    }

    fn scan_filtered(
        &self,
        resource: &ResourceInfo,
        filters: &FilterParameters,
        pagination: &Pagination,
    ) -> StoreResult<Vec<Document>> {
        let txn = self.db.begin_read()?;
        let documents = txn.open_table(DOCUMENTS)?;
        let mut matches = Vec::new();
        for entry in documents.iter()? {
            let (_, bytes) = entry?;
            let document: Document = serde_json::from_slice(bytes.value())?;
            if document.resource.matches(resource) && filters.matches(&document.body) {
                matches.push(document);
            }
        }
        Ok(pagination.apply(matches))
    }
}

impl std::fmt::Debug for RedbRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRepository")
            .field("indexed_docs", &self.index.total_docs())
            .finish()
    }
}

impl DocumentRepository for RedbRepository {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn upsert(&self, write: &DocumentWrite) -> UpsertOutcome {
        Applied::upsert_outcome(self.write(write, true))
    }

    fn update(&self, write: &DocumentWrite) -> UpdateOutcome {
        Applied::update_outcome(self.write(write, false))
    }

    fn get_by_id(&self, id: &DocumentId) -> GetOutcome {
        match self.try_get(id) {
            Ok(Some(document)) => GetOutcome::Success(document),
            Ok(None) => GetOutcome::NotExists,
            Err(e) => GetOutcome::UnknownFailure(e.to_string()),
        }
    }

    fn delete_by_id(&self, id: &DocumentId, force: bool) -> DeleteOutcome {
        self.try_delete(id, force)
            .unwrap_or_else(|e| DeleteOutcome::UnknownFailure(e.to_string()))
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
        match self.index.search(resource, filters, pagination) {
            Ok(documents) => QueryOutcome::Success(documents),
            Err(IndexError::Unavailable) => {
                warn!(target: "edstore::storage", backend = "redb", "Search index offline, scanning documents");
                match self.scan_filtered(resource, filters, pagination) {
                    Ok(documents) => QueryOutcome::Success(documents),
                    Err(e) => QueryOutcome::UnknownFailure(e.to_string()),
                }
            }
            Err(e) => QueryOutcome::UnknownFailure(e.to_string()),
        }
    }

    fn find_existing(&self, ids: &[DocumentId]) -> StoreResult<Vec<DocumentId>> {
        let txn = self.db.begin_read()?;
        let existence = txn.open_table(EXISTENCE)?;
        let mut found = Vec::new();
        for id in ids {
            if existence.get(id.as_str())?.is_some() {
                found.push(id.clone());
            }
        }
        Ok(sorted_unique(found))
    }

    fn scan(&self, after: Option<&DocumentId>, limit: usize) -> StoreResult<Vec<Document>> {
        let txn = self.db.begin_read()?;
        let documents = txn.open_table(DOCUMENTS)?;
        let range = match after {
            Some(after) => {
                documents.range::<&str>((Bound::Excluded(after.as_str()), Bound::Unbounded))?
            }
            None => documents.range::<&str>(..)?,
        };
        let mut page = Vec::new();
        for entry in range.take(limit) {
            let (_, bytes) = entry?;
            page.push(serde_json::from_slice(bytes.value())?);
        }
        Ok(page)
    }
}
