//! Requests and results exchanged with the request-handling collaborator
//!
//! Requests arrive already authenticated; the `Security` they carry is the
//! only authorization input. Results never carry engine error detail: an
//! unknown failure has a generic message and the real cause goes to logs.

use crate::query::{FilterParameters, Pagination};
use crate::types::{
    Document, DocumentId, DocumentIdentity, DocumentReference, ResourceInfo, Security,
    SuperclassInfo, TraceId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Upsert
// ============================================================================

/// Insert-or-replace a document by identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertRequest {
    /// Id the caller expects; must equal the derived id when present
    pub id: Option<DocumentId>,
    /// Resource coordinates
    pub resource: ResourceInfo,
    /// Natural key
    pub identity: DocumentIdentity,
    /// Document body
    pub body: Value,
    /// References extracted from the body
    #[serde(default)]
    pub references: Vec<DocumentReference>,
    /// Superclass identity, for subclass resources
    #[serde(default)]
    pub superclass: Option<SuperclassInfo>,
    /// Caller's security context
    pub security: Security,
    /// Correlation id
    #[serde(default)]
    pub trace_id: TraceId,
}

impl UpsertRequest {
    /// Request with no references, no superclass and a fresh trace id
    pub fn new(
        resource: ResourceInfo,
        identity: DocumentIdentity,
        body: Value,
        security: Security,
    ) -> Self {
        UpsertRequest {
            id: None,
            resource,
            identity,
            body,
            references: Vec::new(),
            superclass: None,
            security,
            trace_id: TraceId::new(),
        }
    }

    /// Builder: expected id
    pub fn with_id(mut self, id: DocumentId) -> Self {
        self.id = Some(id);
        self
    }

    /// Builder: add one reference
    pub fn with_reference(mut self, reference: DocumentReference) -> Self {
        self.references.push(reference);
        self
    }

    /// Builder: replace all references
    pub fn with_references(mut self, references: Vec<DocumentReference>) -> Self {
        self.references = references;
        self
    }

    /// Builder: superclass identity
    pub fn with_superclass(mut self, superclass: SuperclassInfo) -> Self {
        self.superclass = Some(superclass);
        self
    }

    /// Builder: trace id
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }
}

/// Outcome of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpsertResponse {
    /// A new document was stored
    InsertSuccess,
    /// An existing document was replaced
    UpdateSuccess,
    /// One or more references do not resolve
    ValidationFailure,
    /// Identity or reference coordinates are unusable
    InvalidIdentity,
    /// Body is not a JSON object
    InvalidBody,
    /// Id mismatch or alias already claimed
    Conflict,
    /// Existing document belongs to another client
    Forbidden,
    /// Storage engine failure
    UnknownFailure,
}

/// Result of an upsert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResult {
    /// Outcome
    pub result: UpsertResponse,
    /// Derived id, when derivation succeeded
    pub id: Option<DocumentId>,
    /// Unresolved references, sorted
    pub invalid_refs: Vec<DocumentId>,
    /// Human readable reason for failures
    pub failure_message: Option<String>,
}

impl UpsertResult {
    /// Successful result for an id
    pub fn success(result: UpsertResponse, id: DocumentId) -> Self {
        UpsertResult {
            result,
            id: Some(id),
            invalid_refs: Vec::new(),
            failure_message: None,
        }
    }

    /// Failure with a message
    pub fn failure(result: UpsertResponse, id: Option<DocumentId>, message: impl Into<String>) -> Self {
        UpsertResult {
            result,
            id,
            invalid_refs: Vec::new(),
            failure_message: Some(message.into()),
        }
    }

    /// Whether a document was written
    pub fn is_success(&self) -> bool {
        matches!(
            self.result,
            UpsertResponse::InsertSuccess | UpsertResponse::UpdateSuccess
        )
    }
}

// ============================================================================
// Update
// ============================================================================

/// Replace an existing document, addressed by id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// Target document
    pub id: DocumentId,
    /// Resource coordinates
    pub resource: ResourceInfo,
    /// Natural key carried by the new body
    pub identity: DocumentIdentity,
    /// New body
    pub body: Value,
    /// References extracted from the new body
    #[serde(default)]
    pub references: Vec<DocumentReference>,
    /// Superclass identity, for subclass resources
    #[serde(default)]
    pub superclass: Option<SuperclassInfo>,
    /// Caller's security context
    pub security: Security,
    /// Correlation id
    #[serde(default)]
    pub trace_id: TraceId,
}

impl UpdateRequest {
    /// Request with no references, no superclass and a fresh trace id
    pub fn new(
        id: DocumentId,
        resource: ResourceInfo,
        identity: DocumentIdentity,
        body: Value,
        security: Security,
    ) -> Self {
        UpdateRequest {
            id,
            resource,
            identity,
            body,
            references: Vec::new(),
            superclass: None,
            security,
            trace_id: TraceId::new(),
        }
    }

    /// Builder: add one reference
    pub fn with_reference(mut self, reference: DocumentReference) -> Self {
        self.references.push(reference);
        self
    }

    /// Builder: superclass identity
    pub fn with_superclass(mut self, superclass: SuperclassInfo) -> Self {
        self.superclass = Some(superclass);
        self
    }
}

/// Outcome of an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateResponse {
    /// Document replaced
    UpdateSuccess,
    /// No document with the target id
    NotExists,
    /// New body derives a different id than the target
    ImmutableIdentity,
    /// One or more references do not resolve
    ValidationFailure,
    /// Identity or reference coordinates are unusable
    InvalidIdentity,
    /// Body is not a JSON object
    InvalidBody,
    /// New superclass identity is claimed by another document
    Conflict,
    /// Document belongs to another client
    Forbidden,
    /// Storage engine failure
    UnknownFailure,
}

/// Result of an update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    /// Outcome
    pub result: UpdateResponse,
    /// Unresolved references, sorted
    pub invalid_refs: Vec<DocumentId>,
    /// Human readable reason for failures
    pub failure_message: Option<String>,
}

impl UpdateResult {
    /// Result with no detail
    pub fn new(result: UpdateResponse) -> Self {
        UpdateResult {
            result,
            invalid_refs: Vec::new(),
            failure_message: None,
        }
    }

    /// Failure with a message
    pub fn failure(result: UpdateResponse, message: impl Into<String>) -> Self {
        UpdateResult {
            failure_message: Some(message.into()),
            ..UpdateResult::new(result)
        }
    }
}

// ============================================================================
// Get
// ============================================================================

/// Fetch one document by id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequest {
    /// Target document
    pub id: DocumentId,
    /// Caller's security context
    pub security: Security,
    /// Correlation id
    #[serde(default)]
    pub trace_id: TraceId,
}

impl GetRequest {
    /// Request with a fresh trace id
    pub fn new(id: DocumentId, security: Security) -> Self {
        GetRequest {
            id,
            security,
            trace_id: TraceId::new(),
        }
    }
}

/// Outcome of a get
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GetResponse {
    /// Document found
    GetSuccess,
    /// No visible document with that id
    GetFailureNotExists,
    /// Storage engine failure
    UnknownFailure,
}

/// Result of a get
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetResult {
    /// Outcome
    pub result: GetResponse,
    /// The document on success
    pub document: Option<Document>,
}

// ============================================================================
// Query
// ============================================================================

/// Find documents of one resource by body field equality
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Resource to search
    pub resource: ResourceInfo,
    /// Equality filters
    #[serde(default)]
    pub filters: FilterParameters,
    /// Result window
    #[serde(default)]
    pub pagination: Pagination,
    /// Caller's security context
    pub security: Security,
    /// Correlation id
    #[serde(default)]
    pub trace_id: TraceId,
}

impl QueryRequest {
    /// Unfiltered, unpaginated request with a fresh trace id
    pub fn new(resource: ResourceInfo, security: Security) -> Self {
        QueryRequest {
            resource,
            filters: FilterParameters::new(),
            pagination: Pagination::default(),
            security,
            trace_id: TraceId::new(),
        }
    }

    /// Builder: filters
    pub fn with_filters(mut self, filters: FilterParameters) -> Self {
        self.filters = filters;
        self
    }

    /// Builder: pagination
    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }
}

/// Outcome of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryResponse {
    /// Query ran; documents may be empty
    QuerySuccess,
    /// A filter field is malformed
    QueryFailureInvalidQuery,
    /// Storage engine failure
    UnknownFailure,
}

/// Result of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Outcome
    pub result: QueryResponse,
    /// Matching documents in id order
    pub documents: Vec<Document>,
    /// Human readable reason for failures
    pub failure_message: Option<String>,
}

impl QueryResult {
    /// Failure with a message
    pub fn failure(result: QueryResponse, message: impl Into<String>) -> Self {
        QueryResult {
            result,
            documents: Vec::new(),
            failure_message: Some(message.into()),
        }
    }
}

// ============================================================================
// Delete
// ============================================================================

/// Delete one document by id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    /// Target document
    pub id: DocumentId,
    /// Delete even while other documents reference it
    #[serde(default)]
    pub force: bool,
    /// Caller's security context
    pub security: Security,
    /// Correlation id
    #[serde(default)]
    pub trace_id: TraceId,
}

impl DeleteRequest {
    /// Non-forced request with a fresh trace id
    pub fn new(id: DocumentId, security: Security) -> Self {
        DeleteRequest {
            id,
            force: false,
            security,
            trace_id: TraceId::new(),
        }
    }

    /// Builder: force deletion past inbound references
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Outcome of a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeleteResponse {
    /// Document removed
    DeleteSuccess,
    /// No document with that id
    DeleteFailureNotExists,
    /// Other documents still reference it
    DeleteFailureReference,
    /// Document belongs to another client
    Forbidden,
    /// Storage engine failure
    UnknownFailure,
}

/// Result of a delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    /// Outcome
    pub result: DeleteResponse,
    /// Referencing documents, for reference failures; sorted
    pub referencing_ids: Vec<DocumentId>,
    /// Human readable reason for failures
    pub failure_message: Option<String>,
}

impl DeleteResult {
    /// Result with no detail
    pub fn new(result: DeleteResponse) -> Self {
        DeleteResult {
            result,
            referencing_ids: Vec::new(),
            failure_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_wire_names() {
        assert_eq!(
            serde_json::to_string(&UpsertResponse::InsertSuccess).unwrap(),
            "\"INSERT_SUCCESS\""
        );
        assert_eq!(
            serde_json::to_string(&DeleteResponse::DeleteFailureReference).unwrap(),
            "\"DELETE_FAILURE_REFERENCE\""
        );
        assert_eq!(
            serde_json::to_string(&QueryResponse::QueryFailureInvalidQuery).unwrap(),
            "\"QUERY_FAILURE_INVALID_QUERY\""
        );
    }

    #[test]
    fn test_upsert_request_builders() {
        let school = ResourceInfo::new("Ed-Fi", "School", "3.3.1-b");
        let identity = DocumentIdentity::from_pairs([("schoolId", "123")]).unwrap();
        let request = UpsertRequest::new(
            school.clone(),
            identity.clone(),
            json!({"schoolId": 123}),
            Security::full_access("c"),
        )
        .with_reference(DocumentReference::new(school, identity))
        .with_trace_id(TraceId::from("trace-1"));

        assert_eq!(request.references.len(), 1);
        assert_eq!(request.trace_id.as_str(), "trace-1");
        assert!(request.id.is_none());
    }

    #[test]
    fn test_upsert_request_deserializes_with_defaults() {
        let request: UpsertRequest = serde_json::from_value(json!({
            "id": null,
            "resource": {
                "projectName": "Ed-Fi",
                "resourceName": "School",
                "resourceVersion": "3.3.1-b",
                "isDescriptor": false
            },
            "identity": {"schoolId": "123"},
            "body": {"schoolId": 123},
            "security": {"clientId": "c", "strategy": "full_access"}
        }))
        .unwrap();

        assert!(request.references.is_empty());
        assert!(request.superclass.is_none());
        assert!(!request.trace_id.as_str().is_empty());
    }

    #[test]
    fn test_upsert_result_is_success() {
        let id = DocumentId::parse(&"a".repeat(56)).unwrap();
        assert!(UpsertResult::success(UpsertResponse::UpdateSuccess, id.clone()).is_success());
        assert!(!UpsertResult::failure(UpsertResponse::Conflict, Some(id), "x").is_success());
    }
}
