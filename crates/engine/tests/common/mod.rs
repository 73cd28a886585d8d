//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use edstore_core::{
    DocumentId, DocumentIdentity, DocumentReference, ResourceInfo, Security, SuperclassInfo,
    UpsertRequest, UpsertResponse,
};
use edstore_engine::{DocumentService, EdstoreConfig};
use serde_json::json;
use tempfile::TempDir;

pub const PROJECT: &str = "Ed-Fi";
pub const VERSION: &str = "3.3.1-b";

/// A service over a backend, with its files in a temp dir
pub struct TestService {
    pub service: DocumentService,
    _dir: TempDir,
}

impl std::ops::Deref for TestService {
    type Target = DocumentService;

    fn deref(&self) -> &DocumentService {
        &self.service
    }
}

/// Config for `backend` with files under `dir` and fast retries
pub fn config_for(backend: &str, dir: &TempDir) -> EdstoreConfig {
    let mut config = EdstoreConfig::for_backend(backend);
    config.sqlite.path = dir.path().join("edstore.sqlite3");
    config.sqlite.pool_size = 4;
    config.redb.path = Some(dir.path().join("edstore.redb"));
    config.projection.retry_backoff_ms = 1;
    config
}

pub fn open(backend: &str) -> TestService {
    open_with(backend, |_| {})
}

pub fn open_with(backend: &str, adjust: impl FnOnce(&mut EdstoreConfig)) -> TestService {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(backend, &dir);
    adjust(&mut config);
    TestService {
        service: DocumentService::open(&config).unwrap(),
        _dir: dir,
    }
}

pub fn admin() -> Security {
    Security::full_access("admin")
}

pub fn resource(name: &str) -> ResourceInfo {
    ResourceInfo::new(PROJECT, name, VERSION)
}

pub fn identity(name: &str, value: impl ToString) -> DocumentIdentity {
    DocumentIdentity::from_pairs([(name, value.to_string())]).unwrap()
}

pub fn school_ref(school_id: u32) -> DocumentReference {
    DocumentReference::new(resource("School"), identity("schoolId", school_id))
}

pub fn education_organization_ref(id: u32) -> DocumentReference {
    DocumentReference::new(
        resource("EducationOrganization"),
        identity("educationOrganizationId", id),
    )
}

pub fn grade_level_ref(value: &str) -> DocumentReference {
    DocumentReference::new(
        ResourceInfo::descriptor(PROJECT, "GradeLevelDescriptor", VERSION),
        identity("descriptor", value),
    )
}

/// School with its EducationOrganization superclass identity
pub fn school(school_id: u32) -> UpsertRequest {
    UpsertRequest::new(
        resource("School"),
        identity("schoolId", school_id),
        json!({
            "schoolId": school_id,
            "nameOfInstitution": format!("School {}", school_id),
            "address": {"city": "Austin"}
        }),
        admin(),
    )
    .with_superclass(school_superclass(school_id))
}

/// EducationOrganization form of a school's identity
pub fn school_superclass(school_id: u32) -> SuperclassInfo {
    SuperclassInfo {
        resource: resource("EducationOrganization"),
        identity: identity("educationOrganizationId", school_id),
    }
}

/// Student referencing a school
pub fn student(unique_id: &str, school_id: u32) -> UpsertRequest {
    UpsertRequest::new(
        resource("Student"),
        identity("studentUniqueId", unique_id),
        json!({
            "studentUniqueId": unique_id,
            "firstName": "Jane",
            "schoolReference": {"schoolId": school_id}
        }),
        admin(),
    )
    .with_reference(school_ref(school_id))
}

pub fn grade_level(value: &str) -> UpsertRequest {
    UpsertRequest::new(
        ResourceInfo::descriptor(PROJECT, "GradeLevelDescriptor", VERSION),
        identity("descriptor", value),
        json!({"codeValue": value, "namespace": "uri://ed-fi.org/GradeLevelDescriptor"}),
        admin(),
    )
}

/// Upsert that must insert; returns the id
pub fn insert(service: &DocumentService, request: UpsertRequest) -> DocumentId {
    let result = service.upsert(request);
    assert_eq!(
        result.result,
        UpsertResponse::InsertSuccess,
        "unexpected upsert result: {:?}",
        result
    );
    result.id.unwrap()
}
