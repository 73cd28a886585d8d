//! Document service
//!
//! The entry point for every request. It owns the collaborators built at
//! startup and runs each operation through them in a fixed order:
//!
//! 1. derive the document id, aliases and outbound references
//! 2. authorize against the stored document for ownership-scoped clients
//! 3. validate references (cache first, then repository)
//! 4. commit through the repository, which re-checks enforced references
//! 5. update the existence cache
//! 6. hand the change to the search index projector
//!
//! Requests never fail with `Err`. Engine failures come back as
//! `UnknownFailure` with a generic message; the detail is logged.

use crate::cache::{ExistenceCache, InMemoryExistenceCache, NoopExistenceCache};
use crate::config::{EdstoreConfig, QuerySource};
use crate::error::EngineResult;
use crate::projector::{
    ChangeKind, ProjectionFailure, ProjectionStats, ReindexReport, SearchIndexProjector,
};
use crate::registry::BackendRegistry;
use crate::validation::ReferenceValidator;
use edstore_core::{
    alias_id, derive_checked, AuthorizationStrategy, DeleteRequest, DeleteResponse, DeleteResult,
    Document, DocumentId, DocumentIdentity, DocumentReference, GetRequest, GetResponse, GetResult,
    Pagination, QueryRequest, QueryResponse, QueryResult, ResourceInfo, Security, SuperclassInfo,
    UpdateRequest, UpdateResponse, UpdateResult, UpsertRequest, UpsertResponse, UpsertResult,
};
use edstore_search::{ProjectionSink, SearchIndex};
use edstore_storage::{
    DeleteOutcome, DocumentRepository, DocumentWrite, GetOutcome, QueryOutcome, StoreResult,
    UpdateOutcome, UpsertOutcome,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn};

/// Message returned in place of engine failure detail
pub const UNKNOWN_FAILURE_MESSAGE: &str = "Unexpected storage failure";

const BODY_NOT_OBJECT: &str = "document body must be a JSON object";

/// Reference check before a write
enum Checked {
    Ready(DocumentWrite),
    Invalid(Vec<DocumentId>),
}

/// What an ownership check against the stored document found
enum Ownership {
    Permitted(Option<Document>),
    Denied,
    Failed(String),
}

/// Persistence and consistency layer for API documents
///
/// Built once at startup and shared as `Arc<DocumentService>`; every
/// operation takes `&self`.
pub struct DocumentService {
    repository: Arc<dyn DocumentRepository>,
    cache: Arc<dyn ExistenceCache>,
    validator: ReferenceValidator,
    projector: SearchIndexProjector,
    index: Arc<SearchIndex>,
    config: EdstoreConfig,
}

impl DocumentService {
    /// Open the backend named in the config, with the built-in registry
    pub fn open(config: &EdstoreConfig) -> EngineResult<Self> {
        Self::open_with_registry(config, &BackendRegistry::with_builtin())
    }

    /// Open the backend named in the config from a custom registry
    pub fn open_with_registry(
        config: &EdstoreConfig,
        registry: &BackendRegistry,
    ) -> EngineResult<Self> {
        config.validate()?;
        let index = Arc::new(SearchIndex::new());
        let repository = registry.build(config, Arc::clone(&index))?;
        Self::with_repository(repository, index, config.clone())
    }

    /// Wrap an already constructed repository; projects into `index`
    pub fn with_repository(
        repository: Arc<dyn DocumentRepository>,
        index: Arc<SearchIndex>,
        config: EdstoreConfig,
    ) -> EngineResult<Self> {
        let sink: Arc<dyn ProjectionSink> = index.clone();
        Self::with_components(repository, index, sink, config)
    }

    /// Wrap a repository and project into an arbitrary sink
    ///
    /// `index` still serves `QuerySource::SearchIndex` queries.
    pub fn with_components(
        repository: Arc<dyn DocumentRepository>,
        index: Arc<SearchIndex>,
        sink: Arc<dyn ProjectionSink>,
        config: EdstoreConfig,
    ) -> EngineResult<Self> {
        config.validate()?;
        let cache: Arc<dyn ExistenceCache> = if config.cache.enabled {
            Arc::new(InMemoryExistenceCache::new(config.cache.max_entries))
        } else {
            Arc::new(NoopExistenceCache)
        };
        let validator = ReferenceValidator::new(
            Arc::clone(&repository),
            Arc::clone(&cache),
            config.validation.descriptor_policy,
        );
        let projector =
            SearchIndexProjector::new(Arc::clone(&repository), sink, &config.projection);

        info!(
            target: "edstore::engine",
            backend = repository.name(),
            policy = ?config.validation.descriptor_policy,
            query_source = ?config.query.source,
            "Document service started"
        );

        Ok(DocumentService {
            repository,
            cache,
            validator,
            projector,
            index,
            config,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Active configuration
    pub fn config(&self) -> &EdstoreConfig {
        &self.config
    }

    /// The repository requests are committed through
    pub fn repository(&self) -> &Arc<dyn DocumentRepository> {
        &self.repository
    }

    /// The search index queries may be served from
    pub fn search_index(&self) -> &Arc<SearchIndex> {
        &self.index
    }

    /// The existence cache
    pub fn existence_cache(&self) -> &Arc<dyn ExistenceCache> {
        &self.cache
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Insert a document, or replace the one with the same identity
    pub fn upsert(&self, request: UpsertRequest) -> UpsertResult {
        let span = info_span!(target: "edstore::engine", "upsert", trace_id = %request.trace_id);
        let _enter = span.enter();

        if !request.body.is_object() {
            debug!(target: "edstore::engine", "Rejected non-object body");
            return UpsertResult::failure(UpsertResponse::InvalidBody, None, BODY_NOT_OBJECT);
        }

        let document = match build_document(
            &request.resource,
            &request.identity,
            request.body,
            &request.references,
            request.superclass.as_ref(),
            &request.security,
        ) {
            Ok(document) => document,
            Err(e) => {
                debug!(target: "edstore::engine", error = %e, "Rejected identity");
                return UpsertResult::failure(UpsertResponse::InvalidIdentity, None, e.to_string());
            }
        };
        let id = document.id.clone();

        if let Some(expected) = &request.id {
            if *expected != id {
                return UpsertResult::failure(
                    UpsertResponse::Conflict,
                    Some(id.clone()),
                    format!("request id {} does not match derived id {}", expected, id),
                );
            }
        }

        match self.check_ownership(&id, &request.security) {
            Ownership::Permitted(_) => {}
            Ownership::Denied => {
                return UpsertResult::failure(
                    UpsertResponse::Forbidden,
                    Some(id),
                    "document belongs to another client",
                )
            }
            Ownership::Failed(message) => {
                return UpsertResult::failure(
                    UpsertResponse::UnknownFailure,
                    Some(id.clone()),
                    self.unknown_failure("upsert", &id, &message),
                )
            }
        }

        let write = match self.check_references(document) {
            Ok(Checked::Ready(write)) => write,
            Ok(Checked::Invalid(invalid_refs)) => return upsert_invalid(id, invalid_refs),
            Err(e) => {
                return UpsertResult::failure(
                    UpsertResponse::UnknownFailure,
                    Some(id.clone()),
                    self.unknown_failure("upsert", &id, &e.to_string()),
                )
            }
        };

        match self.repository.upsert(&write) {
            UpsertOutcome::InsertSuccess => {
                self.cache.add(&write.document.existence_ids());
                self.projector
                    .on_committed(&write.document, ChangeKind::Upsert);
                debug!(target: "edstore::engine", id = %id, "Inserted document");
                UpsertResult::success(UpsertResponse::InsertSuccess, id)
            }
            UpsertOutcome::UpdateSuccess => {
                self.projector
                    .on_committed(&write.document, ChangeKind::Upsert);
                debug!(target: "edstore::engine", id = %id, "Replaced document");
                UpsertResult::success(UpsertResponse::UpdateSuccess, id)
            }
            UpsertOutcome::ValidationFailure(invalid_refs) => upsert_invalid(id, invalid_refs),
            UpsertOutcome::Conflict(message) => {
                warn!(target: "edstore::engine", id = %id, reason = %message, "Upsert conflict");
                UpsertResult::failure(UpsertResponse::Conflict, Some(id), message)
            }
            UpsertOutcome::UnknownFailure(message) => UpsertResult::failure(
                UpsertResponse::UnknownFailure,
                Some(id.clone()),
                self.unknown_failure("upsert", &id, &message),
            ),
        }
    }

    /// Replace an existing document addressed by id
    ///
    /// The new body must derive the same id; identity is immutable.
    pub fn update(&self, request: UpdateRequest) -> UpdateResult {
        let span = info_span!(target: "edstore::engine", "update", trace_id = %request.trace_id, id = %request.id);
        let _enter = span.enter();

        if !request.body.is_object() {
            debug!(target: "edstore::engine", "Rejected non-object body");
            return UpdateResult::failure(UpdateResponse::InvalidBody, BODY_NOT_OBJECT);
        }

        let document = match build_document(
            &request.resource,
            &request.identity,
            request.body,
            &request.references,
            request.superclass.as_ref(),
            &request.security,
        ) {
            Ok(document) => document,
            Err(e) => return UpdateResult::failure(UpdateResponse::InvalidIdentity, e.to_string()),
        };

        if document.id != request.id {
            return UpdateResult::failure(
                UpdateResponse::ImmutableIdentity,
                format!(
                    "identity change would move document {} to {}",
                    request.id, document.id
                ),
            );
        }
        let id = request.id;

        match self.repository.get_by_id(&id) {
            GetOutcome::Success(existing) if request.security.permits(&existing) => {}
            GetOutcome::Success(_) => {
                return UpdateResult::failure(
                    UpdateResponse::Forbidden,
                    "document belongs to another client",
                )
            }
            GetOutcome::NotExists => return UpdateResult::new(UpdateResponse::NotExists),
            GetOutcome::UnknownFailure(message) => {
                return UpdateResult::failure(
                    UpdateResponse::UnknownFailure,
                    self.unknown_failure("update", &id, &message),
                )
            }
        }

        let write = match self.check_references(document) {
            Ok(Checked::Ready(write)) => write,
            Ok(Checked::Invalid(invalid_refs)) => return update_invalid(invalid_refs),
            Err(e) => {
                return UpdateResult::failure(
                    UpdateResponse::UnknownFailure,
                    self.unknown_failure("update", &id, &e.to_string()),
                )
            }
        };

        match self.repository.update(&write) {
            UpdateOutcome::Success => {
                self.projector
                    .on_committed(&write.document, ChangeKind::Upsert);
                debug!(target: "edstore::engine", id = %id, "Updated document");
                UpdateResult::new(UpdateResponse::UpdateSuccess)
            }
            UpdateOutcome::NotExists => UpdateResult::new(UpdateResponse::NotExists),
            UpdateOutcome::ValidationFailure(invalid_refs) => update_invalid(invalid_refs),
            UpdateOutcome::Conflict(message) => {
                warn!(target: "edstore::engine", id = %id, reason = %message, "Update conflict");
                UpdateResult::failure(UpdateResponse::Conflict, message)
            }
            UpdateOutcome::UnknownFailure(message) => UpdateResult::failure(
                UpdateResponse::UnknownFailure,
                self.unknown_failure("update", &id, &message),
            ),
        }
    }

    /// Fetch a document by id
    ///
    /// Documents an ownership-scoped client did not create are reported as
    /// not existing.
    pub fn get(&self, request: GetRequest) -> GetResult {
        let span = info_span!(target: "edstore::engine", "get", trace_id = %request.trace_id, id = %request.id);
        let _enter = span.enter();

        match self.repository.get_by_id(&request.id) {
            GetOutcome::Success(document) if request.security.permits(&document) => GetResult {
                result: GetResponse::GetSuccess,
                document: Some(document),
            },
            GetOutcome::Success(_) => {
                debug!(target: "edstore::engine", "Document hidden from client");
                not_found()
            }
            GetOutcome::NotExists => not_found(),
            GetOutcome::UnknownFailure(message) => {
                self.unknown_failure("get", &request.id, &message);
                GetResult {
                    result: GetResponse::UnknownFailure,
                    document: None,
                }
            }
        }
    }

    /// Documents of a resource matching every filter, in id order
    pub fn query(&self, request: QueryRequest) -> QueryResult {
        let span = info_span!(
            target: "edstore::engine",
            "query",
            trace_id = %request.trace_id,
            resource = %request.resource.resource_name
        );
        let _enter = span.enter();

        if let Err(e) = request.filters.validate() {
            return QueryResult::failure(QueryResponse::QueryFailureInvalidQuery, e.to_string());
        }

        // Ownership filtering must run before the window is applied
        let scoped = request.security.strategy == AuthorizationStrategy::OwnershipBased;
        let window = if scoped {
            Pagination::default()
        } else {
            request.pagination
        };

        let found = match self.config.query.source {
            QuerySource::Primary => {
                match self
                    .repository
                    .query(&request.resource, &request.filters, &window)
                {
                    QueryOutcome::Success(documents) => Ok(documents),
                    QueryOutcome::InvalidQuery(message) => {
                        return QueryResult::failure(
                            QueryResponse::QueryFailureInvalidQuery,
                            message,
                        )
                    }
                    QueryOutcome::UnknownFailure(message) => Err(message),
                }
            }
            QuerySource::SearchIndex => self
                .index
                .search(&request.resource, &request.filters, &window)
                .map_err(|e| e.to_string()),
        };

        let mut documents = match found {
            Ok(documents) => documents,
            Err(message) => {
                error!(target: "edstore::engine", error = %message, "Query failed");
                return QueryResult::failure(QueryResponse::UnknownFailure, UNKNOWN_FAILURE_MESSAGE);
            }
        };

        if scoped {
            documents.retain(|document| request.security.permits(document));
            documents = request.pagination.apply(documents);
        }

        debug!(target: "edstore::engine", matches = documents.len(), "Query complete");
        QueryResult {
            result: QueryResponse::QuerySuccess,
            documents,
            failure_message: None,
        }
    }

    /// Delete a document by id
    pub fn delete(&self, request: DeleteRequest) -> DeleteResult {
        let span = info_span!(
            target: "edstore::engine",
            "delete",
            trace_id = %request.trace_id,
            id = %request.id,
            force = request.force
        );
        let _enter = span.enter();
        let id = &request.id;

        match self.check_ownership(id, &request.security) {
            Ownership::Permitted(Some(_)) => {}
            Ownership::Permitted(None) if request.security.strategy == AuthorizationStrategy::OwnershipBased => {
                return DeleteResult::new(DeleteResponse::DeleteFailureNotExists)
            }
            Ownership::Permitted(None) => {}
            Ownership::Denied => {
                return DeleteResult {
                    failure_message: Some("document belongs to another client".to_string()),
                    ..DeleteResult::new(DeleteResponse::Forbidden)
                }
            }
            Ownership::Failed(message) => {
                return DeleteResult {
                    failure_message: Some(self.unknown_failure("delete", id, &message)),
                    ..DeleteResult::new(DeleteResponse::UnknownFailure)
                }
            }
        }

        match self.repository.delete_by_id(id, request.force) {
            DeleteOutcome::Success(document) => {
                self.cache.remove(&document.existence_ids());
                self.projector.on_committed(&document, ChangeKind::Delete);
                debug!(target: "edstore::engine", id = %id, "Deleted document");
                DeleteResult::new(DeleteResponse::DeleteSuccess)
            }
            DeleteOutcome::NotExists => DeleteResult::new(DeleteResponse::DeleteFailureNotExists),
            DeleteOutcome::ReferenceConflict(referencing_ids) => {
                debug!(
                    target: "edstore::engine",
                    id = %id,
                    referencing = referencing_ids.len(),
                    "Delete blocked by references"
                );
                DeleteResult {
                    result: DeleteResponse::DeleteFailureReference,
                    failure_message: Some(format!(
                        "document {} is referenced by {} other document(s)",
                        id,
                        referencing_ids.len()
                    )),
                    referencing_ids,
                }
            }
            DeleteOutcome::UnknownFailure(message) => DeleteResult {
                failure_message: Some(self.unknown_failure("delete", id, &message)),
                ..DeleteResult::new(DeleteResponse::UnknownFailure)
            },
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Rebuild the search index from the primary store
    pub fn reindex(&self) -> EngineResult<ReindexReport> {
        self.projector.reindex()
    }

    /// Block until every queued projection has been applied or abandoned
    pub fn drain_projections(&self) {
        self.projector.drain();
    }

    /// Projector metrics snapshot
    pub fn projection_stats(&self) -> ProjectionStats {
        self.projector.stats()
    }

    /// Most recent projections that ran out of attempts
    pub fn projection_failures(&self) -> Vec<ProjectionFailure> {
        self.projector.recent_failures()
    }

    /// Stop projection workers after they finish queued work
    pub fn shutdown(&self) {
        self.projector.shutdown();
        info!(target: "edstore::engine", "Document service shut down");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_ownership(&self, id: &DocumentId, security: &Security) -> Ownership {
        if security.strategy == AuthorizationStrategy::FullAccess {
            return Ownership::Permitted(None);
        }
        match self.repository.get_by_id(id) {
            GetOutcome::Success(existing) if security.permits(&existing) => {
                Ownership::Permitted(Some(existing))
            }
            GetOutcome::Success(_) => Ownership::Denied,
            GetOutcome::NotExists => Ownership::Permitted(None),
            GetOutcome::UnknownFailure(message) => Ownership::Failed(message),
        }
    }

    fn check_references(&self, mut document: Document) -> StoreResult<Checked> {
        if !self.config.validation.validate_references {
            document.validated = false;
            return Ok(Checked::Ready(DocumentWrite {
                document,
                enforced_refs: Vec::new(),
            }));
        }

        let result = self.validator.validate(&document)?;
        if !result.is_valid() {
            return Ok(Checked::Invalid(result.invalid_refs));
        }
        document.validated = result.fully_checked();
        Ok(Checked::Ready(DocumentWrite {
            document,
            enforced_refs: result.enforced,
        }))
    }

    /// Log an engine failure and return the message safe to hand out
    fn unknown_failure(&self, operation: &str, id: &DocumentId, message: &str) -> String {
        error!(
            target: "edstore::engine",
            operation,
            id = %id,
            backend = self.repository.name(),
            error = %message,
            "Storage failure"
        );
        UNKNOWN_FAILURE_MESSAGE.to_string()
    }
}

impl std::fmt::Debug for DocumentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentService")
            .field("backend", &self.repository.name())
            .field("config", &self.config)
            .finish()
    }
}

/// Derive everything a write needs from the request's parts
fn build_document(
    resource: &ResourceInfo,
    identity: &DocumentIdentity,
    body: Value,
    references: &[DocumentReference],
    superclass: Option<&SuperclassInfo>,
    security: &Security,
) -> edstore_core::Result<Document> {
    let id = derive_checked(resource, identity)?;
    let out_refs = references
        .iter()
        .map(DocumentReference::resolve)
        .collect::<edstore_core::Result<Vec<_>>>()?;
    let mut alias_ids = Vec::new();
    if let Some(superclass) = superclass {
        let alias = alias_id(superclass)?;
        if alias != id {
            alias_ids.push(alias);
        }
    }
    Ok(Document {
        id,
        resource: resource.clone(),
        identity: identity.clone(),
        body,
        out_refs: Document::normalize_out_refs(out_refs),
        alias_ids,
        validated: false,
        created_by: Some(security.client_id.clone()),
    })
}

fn upsert_invalid(id: DocumentId, invalid_refs: Vec<DocumentId>) -> UpsertResult {
    debug!(target: "edstore::engine", id = %id, missing = invalid_refs.len(), "References do not resolve");
    UpsertResult {
        result: UpsertResponse::ValidationFailure,
        id: Some(id),
        failure_message: Some(format!(
            "{} reference(s) do not resolve",
            invalid_refs.len()
        )),
        invalid_refs,
    }
}

fn update_invalid(invalid_refs: Vec<DocumentId>) -> UpdateResult {
    UpdateResult {
        result: UpdateResponse::ValidationFailure,
        failure_message: Some(format!(
            "{} reference(s) do not resolve",
            invalid_refs.len()
        )),
        invalid_refs,
    }
}

fn not_found() -> GetResult {
    GetResult {
        result: GetResponse::GetFailureNotExists,
        document: None,
    }
}
