//! Search index projection through the service
//!
//! The index trails the primary store: a query served from it may miss a
//! fresh write until the projector catches up, and a full reindex rebuilds
//! it after an outage.

mod common;

use common::*;
use edstore_core::{
    derive_document_id, DeleteRequest, Document, DocumentId, FilterParameters, QueryRequest,
    QueryResponse, UpdateRequest, UpdateResponse, UpsertResponse,
};
use edstore_engine::{
    DocumentService, EdstoreConfig, IndexError, ProjectionSink, QuerySource, SearchIndex,
};
use edstore_storage::{DocumentRepository, DocumentWrite, GetOutcome, InMemoryDocumentStore};
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use std::sync::Arc;

/// Index sink whose writes wait until the gate opens
struct GatedIndex {
    index: Arc<SearchIndex>,
    open: Mutex<bool>,
    opened: Condvar,
}

impl GatedIndex {
    fn closed(index: Arc<SearchIndex>) -> Self {
        GatedIndex {
            index,
            open: Mutex::new(false),
            opened: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

impl ProjectionSink for GatedIndex {
    fn upsert(&self, document: &Document) -> Result<(), IndexError> {
        self.wait();
        self.index.upsert(document)
    }

    fn remove(&self, id: &DocumentId) -> Result<(), IndexError> {
        self.wait();
        self.index.remove(id)
    }

    fn clear(&self) -> Result<(), IndexError> {
        self.index.clear()
    }
}

fn search_index_config() -> EdstoreConfig {
    let mut config = EdstoreConfig::default();
    config.query.source = QuerySource::SearchIndex;
    config.projection.retry_backoff_ms = 1;
    config.projection.max_attempts = 2;
    config
}

fn by_school_id(id: u32) -> QueryRequest {
    QueryRequest::new(resource("School"), admin())
        .with_filters(FilterParameters::new().with("schoolId", id.to_string()))
}

#[test]
fn test_query_misses_until_projected() {
    let index = Arc::new(SearchIndex::new());
    let gate = Arc::new(GatedIndex::closed(Arc::clone(&index)));
    let service = DocumentService::with_components(
        Arc::new(InMemoryDocumentStore::new()),
        Arc::clone(&index),
        gate.clone(),
        search_index_config(),
    )
    .unwrap();

    insert(&service, school(123));

    // Committed, but the projector is held at the gate
    let early = service.query(by_school_id(123));
    assert_eq!(early.result, QueryResponse::QuerySuccess);
    assert!(early.documents.is_empty());

    gate.open();
    service.drain_projections();
    let late = service.query(by_school_id(123));
    assert_eq!(late.documents.len(), 1);
    assert_eq!(late.documents[0].body["schoolId"], 123);
    service.shutdown();
}

#[test]
fn test_delete_is_projected() {
    let service = DocumentService::open(&search_index_config()).unwrap();
    let id = insert(&service, school(1));
    service.drain_projections();
    assert!(service.search_index().contains(&id));

    service.delete(DeleteRequest::new(id.clone(), admin()));
    service.drain_projections();
    assert!(!service.search_index().contains(&id));
    assert!(service.query(by_school_id(1)).documents.is_empty());
    service.shutdown();
}

#[test]
fn test_outage_flags_reindex_and_reindex_recovers() {
    let service = DocumentService::open(&search_index_config()).unwrap();
    insert(&service, school(1));
    service.drain_projections();

    service.search_index().set_available(false);
    for id in 2..=5 {
        insert(&service, school(id));
    }
    service.drain_projections();

    let stats = service.projection_stats();
    assert!(stats.needs_reindex);
    assert_eq!(stats.failed, 4);
    assert_eq!(service.projection_failures().len(), 4);

    // Offline index answers with a generic failure, not engine detail
    let offline = service.query(by_school_id(1));
    assert_eq!(offline.result, QueryResponse::UnknownFailure);
    assert_eq!(
        offline.failure_message.as_deref(),
        Some(edstore_engine::UNKNOWN_FAILURE_MESSAGE)
    );

    // Back online, the writes made during the outage are missing
    service.search_index().set_available(true);
    assert!(service.query(by_school_id(3)).documents.is_empty());

    let report = service.reindex().unwrap();
    assert_eq!(report.documents, 5);
    assert!(!service.projection_stats().needs_reindex);
    for id in 1..=5 {
        assert_eq!(service.query(by_school_id(id)).documents.len(), 1);
    }
    service.shutdown();
}

#[test]
fn test_reindex_after_index_loss() {
    let service = DocumentService::open(&search_index_config()).unwrap();
    for id in 1..=3 {
        insert(&service, school(id));
    }
    insert(&service, student("s-1", 1));
    service.drain_projections();

    service.search_index().clear().unwrap();
    assert_eq!(service.search_index().total_docs(), 0);

    let report = service.reindex().unwrap();
    assert_eq!(report.documents, 4);
    assert_eq!(
        service.search_index().index_names(),
        vec![
            "ed-fi$3-3-1-b$school".to_string(),
            "ed-fi$3-3-1-b$student".to_string()
        ]
    );
    service.shutdown();
}

#[test]
fn test_projection_failure_does_not_fail_write() {
    let service = DocumentService::open(&search_index_config()).unwrap();
    service.search_index().set_available(false);

    let result = service.upsert(school(1));
    assert_eq!(result.result, UpsertResponse::InsertSuccess);
    service.drain_projections();
    assert!(service.projection_stats().needs_reindex);
    service.shutdown();
}

#[test]
fn test_redb_queries_follow_projection() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = config_for("redb", &dir);
    config.projection.max_attempts = 2;
    let service = DocumentService::open(&config).unwrap();

    insert(&service, school(8));
    service.drain_projections();
    let found = service.query(by_school_id(8));
    assert_eq!(found.documents.len(), 1);

    // With the index offline the redb engine falls back to scanning itself
    service.search_index().set_available(false);
    let fallback = service.query(by_school_id(8));
    assert_eq!(fallback.result, QueryResponse::QuerySuccess);
    assert_eq!(fallback.documents.len(), 1);
    service.shutdown();
}

#[test]
fn test_non_object_body_rejected_before_commit() {
    let service = DocumentService::open(&search_index_config()).unwrap();

    let mut request = school(1);
    request.body = json!(["not", "an", "object"]);
    let id = derive_document_id(PROJECT, "School", VERSION, &request.identity);
    let result = service.upsert(request);
    assert_eq!(result.result, UpsertResponse::InvalidBody);
    assert_eq!(service.repository().get_by_id(&id), GetOutcome::NotExists);

    let id = insert(&service, school(2));
    let update = UpdateRequest::new(
        id.clone(),
        resource("School"),
        identity("schoolId", 2),
        json!("just a string"),
        admin(),
    );
    assert_eq!(service.update(update).result, UpdateResponse::InvalidBody);
    match service.repository().get_by_id(&id) {
        GetOutcome::Success(stored) => assert_eq!(stored.body["schoolId"], 2),
        other => panic!("unexpected {:?}", other),
    }

    service.drain_projections();
    assert_eq!(service.projection_stats().failed, 0);
    service.shutdown();
}

#[test]
fn test_reindex_skips_document_the_index_rejects() {
    let repo = Arc::new(InMemoryDocumentStore::new());
    let index = Arc::new(SearchIndex::new());

    // Written straight to the store, as an older process might have
    let identity = identity("schoolId", 1);
    let bad = Document {
        id: derive_document_id(PROJECT, "School", VERSION, &identity),
        resource: resource("School"),
        identity,
        body: json!(["not", "an", "object"]),
        out_refs: vec![],
        alias_ids: vec![],
        validated: true,
        created_by: None,
    };
    repo.upsert(&DocumentWrite::enforcing_all(bad.clone()));

    let service = DocumentService::with_components(
        repo,
        Arc::clone(&index),
        index.clone(),
        search_index_config(),
    )
    .unwrap();
    let ids: Vec<DocumentId> = (2..=4).map(|n| insert(&service, school(n))).collect();
    service.drain_projections();
    index.clear().unwrap();

    let report = service.reindex().unwrap();
    assert_eq!(report.documents, 3);
    assert_eq!(report.rejected, 1);
    for id in &ids {
        assert!(index.contains(id));
    }
    assert!(!service.projection_stats().needs_reindex);
    let failures = service.projection_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, bad.id);

    // Running it again gives the same answer
    assert_eq!(service.reindex().unwrap().documents, 3);
    service.shutdown();
}
