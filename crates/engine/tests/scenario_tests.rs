//! End-to-end service scenarios
//!
//! Each scenario runs against every built-in backend through
//! `DocumentService::open`, so the same request sequence must produce the
//! same results whichever engine is configured.

mod common;

use common::*;
use edstore_core::{
    derive_document_id, DeleteRequest, DeleteResponse, DocumentIdentity, FilterParameters,
    GetRequest, GetResponse, Pagination, QueryRequest, QueryResponse, Security, UpdateRequest,
    UpdateResponse, UpsertResponse,
};
use edstore_engine::DescriptorPolicy;
use serde_json::json;

mod scenarios {
    use super::*;

    /// School/Student lifecycle from the API's point of view
    pub fn school_student_lifecycle(backend: &str) {
        let service = open(backend);

        let school_id = insert(&service, school(123));
        assert_eq!(
            school_id,
            derive_document_id("Ed-Fi", "School", "3.3.1-b", &identity("schoolId", 123))
        );
        let student_id = insert(&service, student("s-1", 123));

        let blocked = service.delete(DeleteRequest::new(school_id.clone(), admin()));
        assert_eq!(blocked.result, DeleteResponse::DeleteFailureReference);
        assert_eq!(blocked.referencing_ids, vec![student_id.clone()]);

        let removed = service.delete(DeleteRequest::new(student_id.clone(), admin()));
        assert_eq!(removed.result, DeleteResponse::DeleteSuccess);
        let removed = service.delete(DeleteRequest::new(school_id.clone(), admin()));
        assert_eq!(removed.result, DeleteResponse::DeleteSuccess);

        let gone = service.get(GetRequest::new(school_id, admin()));
        assert_eq!(gone.result, GetResponse::GetFailureNotExists);
        service.shutdown();
    }

    pub fn missing_references_listed(backend: &str) {
        let service = open(backend);
        insert(&service, school(1));

        let request = student("s-1", 1)
            .with_reference(school_ref(2))
            .with_reference(school_ref(3));
        let result = service.upsert(request);
        assert_eq!(result.result, UpsertResponse::ValidationFailure);

        let mut expected = vec![
            derive_document_id("Ed-Fi", "School", "3.3.1-b", &identity("schoolId", 2)),
            derive_document_id("Ed-Fi", "School", "3.3.1-b", &identity("schoolId", 3)),
        ];
        expected.sort();
        assert_eq!(result.invalid_refs, expected);
        service.shutdown();
    }

    pub fn repeat_upsert_keeps_body(backend: &str) {
        let service = open(backend);
        let first = service.upsert(school(7));
        let second = service.upsert(school(7));
        assert_eq!(first.result, UpsertResponse::InsertSuccess);
        assert_eq!(second.result, UpsertResponse::UpdateSuccess);

        let stored = service
            .get(GetRequest::new(first.id.unwrap(), admin()))
            .document
            .unwrap();
        assert_eq!(stored.body["nameOfInstitution"], "School 7");
        assert!(stored.validated);
        service.shutdown();
    }

    pub fn forced_delete_dangles(backend: &str) {
        let service = open(backend);
        let school_id = insert(&service, school(5));
        let student_id = insert(&service, student("s-5", 5));

        let forced = service.delete(DeleteRequest::new(school_id.clone(), admin()).forced());
        assert_eq!(forced.result, DeleteResponse::DeleteSuccess);

        // The student survives but its reference no longer resolves
        let stored = service
            .get(GetRequest::new(student_id, admin()))
            .document
            .unwrap();
        assert_eq!(stored.out_refs[0].id, school_id);
        let retry = service.upsert(student("s-5", 5));
        assert_eq!(retry.result, UpsertResponse::ValidationFailure);
        assert_eq!(retry.invalid_refs, vec![school_id]);
        service.shutdown();
    }

    pub fn superclass_alias(backend: &str) {
        let service = open(backend);
        insert(&service, school(123));

        // Reference to EducationOrganization 123 resolves to School 123
        let association = edstore_core::UpsertRequest::new(
            resource("StaffEducationOrganizationAssignmentAssociation"),
            identity("staffUniqueId", "t-1"),
            json!({"staffUniqueId": "t-1", "educationOrganizationReference": {"educationOrganizationId": 123}}),
            admin(),
        )
        .with_reference(education_organization_ref(123));
        insert(&service, association);

        // A second subclass claiming the same superclass identity conflicts
        let agency = edstore_core::UpsertRequest::new(
            resource("LocalEducationAgency"),
            identity("localEducationAgencyId", 123),
            json!({"localEducationAgencyId": 123}),
            admin(),
        )
        .with_superclass(school_superclass(123));
        assert_eq!(service.upsert(agency).result, UpsertResponse::Conflict);
        service.shutdown();
    }

    pub fn descriptor_strict(backend: &str) {
        let service = open(backend);
        insert(&service, school(1));
        let request = student("s-1", 1).with_reference(grade_level_ref("Ninth grade"));
        let result = service.upsert(request);
        assert_eq!(result.result, UpsertResponse::ValidationFailure);
        assert_eq!(result.invalid_refs.len(), 1);

        insert(&service, grade_level("Ninth grade"));
        let result =
            service.upsert(student("s-1", 1).with_reference(grade_level_ref("Ninth grade")));
        assert_eq!(result.result, UpsertResponse::InsertSuccess);
        service.shutdown();
    }

    pub fn descriptor_bootstrap(backend: &str) {
        let service = open_with(backend, |config| {
            config.validation.descriptor_policy = DescriptorPolicy::Bootstrap;
        });
        insert(&service, school(1));

        let id = insert(
            &service,
            student("s-1", 1).with_reference(grade_level_ref("Ninth grade")),
        );
        let stored = service.get(GetRequest::new(id, admin())).document.unwrap();
        assert!(!stored.validated);

        // School references are still enforced
        let result = service.upsert(student("s-2", 404));
        assert_eq!(result.result, UpsertResponse::ValidationFailure);
        service.shutdown();
    }

    pub fn update_by_id(backend: &str) {
        let service = open(backend);
        let id = insert(&service, school(9));

        let mut body = school(9).body;
        body["nameOfInstitution"] = json!("Renamed");
        let request = UpdateRequest::new(
            id.clone(),
            resource("School"),
            identity("schoolId", 9),
            body,
            admin(),
        )
        .with_superclass(school_superclass(9));
        assert_eq!(service.update(request).result, UpdateResponse::UpdateSuccess);
        let stored = service.get(GetRequest::new(id.clone(), admin())).document.unwrap();
        assert_eq!(stored.body["nameOfInstitution"], "Renamed");

        // New identity would move the document
        let moved = UpdateRequest::new(
            id.clone(),
            resource("School"),
            identity("schoolId", 10),
            json!({"schoolId": 10}),
            admin(),
        );
        assert_eq!(service.update(moved).result, UpdateResponse::ImmutableIdentity);

        // Unknown target
        let missing_id =
            derive_document_id("Ed-Fi", "School", "3.3.1-b", &identity("schoolId", 11));
        let missing = UpdateRequest::new(
            missing_id,
            resource("School"),
            identity("schoolId", 11),
            json!({"schoolId": 11}),
            admin(),
        );
        assert_eq!(service.update(missing).result, UpdateResponse::NotExists);

        // Invalid references are reported
        let dangling = UpdateRequest::new(
            id,
            resource("School"),
            identity("schoolId", 9),
            json!({"schoolId": 9}),
            admin(),
        )
        .with_superclass(school_superclass(9))
        .with_reference(education_organization_ref(77));
        let result = service.update(dangling);
        assert_eq!(result.result, UpdateResponse::ValidationFailure);
        assert_eq!(result.invalid_refs.len(), 1);
        service.shutdown();
    }

    pub fn ownership(backend: &str) {
        let service = open(backend);
        let alice = Security::ownership_based("alice");
        let bob = Security::ownership_based("bob");

        let mut request = school(1);
        request.security = alice.clone();
        let alice_school = insert(&service, request);
        let mut request = school(2);
        request.security = bob.clone();
        insert(&service, request);

        // Bob cannot see, replace, update or delete Alice's school
        let hidden = service.get(GetRequest::new(alice_school.clone(), bob.clone()));
        assert_eq!(hidden.result, GetResponse::GetFailureNotExists);

        let mut replace = school(1);
        replace.security = bob.clone();
        assert_eq!(service.upsert(replace).result, UpsertResponse::Forbidden);

        let update = UpdateRequest::new(
            alice_school.clone(),
            resource("School"),
            identity("schoolId", 1),
            json!({"schoolId": 1}),
            bob.clone(),
        );
        assert_eq!(service.update(update).result, UpdateResponse::Forbidden);

        let delete = service.delete(DeleteRequest::new(alice_school.clone(), bob.clone()));
        assert_eq!(delete.result, DeleteResponse::Forbidden);

        // Queries only return the caller's documents
        service.drain_projections();
        let mine = service.query(QueryRequest::new(resource("School"), alice.clone()));
        assert_eq!(mine.result, QueryResponse::QuerySuccess);
        assert_eq!(mine.documents.len(), 1);
        assert_eq!(mine.documents[0].id, alice_school);

        let everything = service.query(QueryRequest::new(resource("School"), admin()));
        assert_eq!(everything.documents.len(), 2);

        // Alice replaces her own document; creator is kept
        let mut replace = school(1);
        replace.security = alice.clone();
        assert_eq!(service.upsert(replace).result, UpsertResponse::UpdateSuccess);
        let stored = service
            .get(GetRequest::new(alice_school.clone(), alice.clone()))
            .document
            .unwrap();
        assert_eq!(stored.created_by.as_deref(), Some("alice"));

        let delete = service.delete(DeleteRequest::new(alice_school, alice));
        assert_eq!(delete.result, DeleteResponse::DeleteSuccess);
        service.shutdown();
    }

    pub fn query_filters_and_pages(backend: &str) {
        let service = open(backend);
        for id in 1..=6 {
            insert(&service, school(id));
        }
        service.drain_projections();

        let filtered = service.query(
            QueryRequest::new(resource("School"), admin())
                .with_filters(FilterParameters::new().with("schoolId", "4")),
        );
        assert_eq!(filtered.result, QueryResponse::QuerySuccess);
        assert_eq!(filtered.documents.len(), 1);
        assert_eq!(filtered.documents[0].body["schoolId"], 4);

        let nested = service.query(
            QueryRequest::new(resource("School"), admin())
                .with_filters(FilterParameters::new().with("address.city", "Austin")),
        );
        assert_eq!(nested.documents.len(), 6);

        let all = service.query(QueryRequest::new(resource("School"), admin()));
        let page = service.query(
            QueryRequest::new(resource("School"), admin()).with_pagination(Pagination::new(2, 3)),
        );
        assert_eq!(page.documents.len(), 3);
        assert_eq!(page.documents[..], all.documents[2..5]);

        let other_resource = service.query(QueryRequest::new(resource("Student"), admin()));
        assert!(other_resource.documents.is_empty());
        service.shutdown();
    }

    pub fn invalid_identity(backend: &str) {
        let service = open(backend);
        let mut request = school(1);
        request.identity = DocumentIdentity::new();
        assert_eq!(service.upsert(request).result, UpsertResponse::InvalidIdentity);

        let mut request = school(1);
        request.resource.resource_name = String::new();
        assert_eq!(service.upsert(request).result, UpsertResponse::InvalidIdentity);
        service.shutdown();
    }
}

macro_rules! scenario_tests {
    ($($backend:ident),* $(,)?) => {
        $(
            mod $backend {
                use super::scenarios;

                #[test]
                fn school_student_lifecycle() { scenarios::school_student_lifecycle(stringify!($backend)) }
                #[test]
                fn missing_references_listed() { scenarios::missing_references_listed(stringify!($backend)) }
                #[test]
                fn repeat_upsert_keeps_body() { scenarios::repeat_upsert_keeps_body(stringify!($backend)) }
                #[test]
                fn forced_delete_dangles() { scenarios::forced_delete_dangles(stringify!($backend)) }
                #[test]
                fn superclass_alias() { scenarios::superclass_alias(stringify!($backend)) }
                #[test]
                fn descriptor_strict() { scenarios::descriptor_strict(stringify!($backend)) }
                #[test]
                fn descriptor_bootstrap() { scenarios::descriptor_bootstrap(stringify!($backend)) }
                #[test]
                fn update_by_id() { scenarios::update_by_id(stringify!($backend)) }
                #[test]
                fn ownership() { scenarios::ownership(stringify!($backend)) }
                #[test]
                fn query_filters_and_pages() { scenarios::query_filters_and_pages(stringify!($backend)) }
                #[test]
                fn invalid_identity() { scenarios::invalid_identity(stringify!($backend)) }
            }
        )*
    };
}

scenario_tests!(memory, sqlite, redb);
