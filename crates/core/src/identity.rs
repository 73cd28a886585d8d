//! Document id derivation
//!
//! A document id is the SHA-224 digest of the resource coordinates and the
//! identity pairs, rendered as 56 lowercase hex characters. Every field is
//! written with a length prefix so that no two distinct inputs share an
//! encoding ("ab" + "c" never collides with "a" + "bc").
//!
//! Pairs are hashed in field-name order; `DocumentIdentity` already keeps
//! them sorted, so derivation is insensitive to the order the caller
//! supplied them in.

use crate::error::{Error, Result};
use crate::types::{DocumentId, DocumentIdentity, DocumentReference, ResourceInfo, SuperclassInfo};
use sha2::{Digest, Sha224};

fn write_field(hasher: &mut Sha224, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

/// Derive the id of a document
///
/// Pure and total: the same coordinates and identity always give the
/// same id.
pub fn derive_document_id(
    project_name: &str,
    resource_name: &str,
    resource_version: &str,
    identity: &DocumentIdentity,
) -> DocumentId {
    let mut hasher = Sha224::new();
    write_field(&mut hasher, project_name);
    write_field(&mut hasher, resource_name);
    write_field(&mut hasher, resource_version);
    hasher.update((identity.len() as u64).to_le_bytes());
    for (name, value) in identity.iter() {
        write_field(&mut hasher, name);
        write_field(&mut hasher, value);
    }
    DocumentId::from_hex_digest(format!("{:x}", hasher.finalize()))
}

/// Derive an id after checking coordinates and identity are usable
///
/// # Errors
///
/// `Error::InvalidReference` for empty coordinates, `Error::InvalidIdentity`
/// for an empty identity.
pub fn derive_checked(resource: &ResourceInfo, identity: &DocumentIdentity) -> Result<DocumentId> {
    resource.validate()?;
    if identity.is_empty() {
        return Err(Error::InvalidIdentity(format!(
            "{} identity has no fields",
            resource.resource_name
        )));
    }
    Ok(derive_document_id(
        &resource.project_name,
        &resource.resource_name,
        &resource.resource_version,
        identity,
    ))
}

/// Id a reference points at
pub fn reference_id(reference: &DocumentReference) -> Result<DocumentId> {
    derive_checked(&reference.resource, &reference.identity)
}

/// Alias id a subclass document claims through its superclass identity
pub fn alias_id(superclass: &SuperclassInfo) -> Result<DocumentId> {
    derive_checked(&superclass.resource, &superclass.identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn school(id: &str) -> DocumentIdentity {
        DocumentIdentity::from_pairs([("schoolId", id)]).unwrap()
    }

    #[test]
    fn test_derive_is_deterministic() {
        let a = derive_document_id("Ed-Fi", "School", "3.3.1-b", &school("123"));
        let b = derive_document_id("Ed-Fi", "School", "3.3.1-b", &school("123"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), DocumentId::LEN);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c)));
    }

    #[test]
    fn test_derive_depends_on_every_coordinate() {
        let base = derive_document_id("Ed-Fi", "School", "3.3.1-b", &school("123"));
        assert_ne!(base, derive_document_id("TPDM", "School", "3.3.1-b", &school("123")));
        assert_ne!(base, derive_document_id("Ed-Fi", "Student", "3.3.1-b", &school("123")));
        assert_ne!(base, derive_document_id("Ed-Fi", "School", "5.0.0", &school("123")));
        assert_ne!(base, derive_document_id("Ed-Fi", "School", "3.3.1-b", &school("124")));
    }

    #[test]
    fn test_length_prefix_prevents_concatenation_collisions() {
        let a = DocumentIdentity::from_pairs([("ab", "c")]).unwrap();
        let b = DocumentIdentity::from_pairs([("a", "bc")]).unwrap();
        assert_ne!(
            derive_document_id("p", "r", "v", &a),
            derive_document_id("p", "r", "v", &b)
        );
        assert_ne!(
            derive_document_id("pr", "", "v", &a),
            derive_document_id("p", "r", "v", &a)
        );
    }

    #[test]
    fn test_derive_checked_rejects_empty_identity() {
        let resource = ResourceInfo::new("Ed-Fi", "School", "3.3.1-b");
        let err = derive_checked(&resource, &DocumentIdentity::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity(_)));
    }

    #[test]
    fn test_derive_checked_rejects_missing_coordinates() {
        let resource = ResourceInfo::new("Ed-Fi", "", "3.3.1-b");
        assert!(matches!(
            derive_checked(&resource, &school("1")),
            Err(Error::InvalidReference(_))
        ));
    }

    #[test]
    fn test_reference_id_matches_document_id() {
        let resource = ResourceInfo::new("Ed-Fi", "School", "3.3.1-b");
        let reference = DocumentReference::new(resource.clone(), school("123"));
        assert_eq!(
            reference_id(&reference).unwrap(),
            derive_checked(&resource, &school("123")).unwrap()
        );
    }

    #[test]
    fn test_descriptor_flag_does_not_change_id() {
        let plain = ResourceInfo::new("Ed-Fi", "GradeLevelDescriptor", "3.3.1-b");
        let descriptor = ResourceInfo::descriptor("Ed-Fi", "GradeLevelDescriptor", "3.3.1-b");
        let identity = DocumentIdentity::from_pairs([("descriptor", "uri://ed-fi.org/GradeLevelDescriptor#First")]).unwrap();
        assert_eq!(
            derive_checked(&plain, &identity).unwrap(),
            derive_checked(&descriptor, &identity).unwrap()
        );
    }

    #[test]
    fn test_alias_id_uses_superclass_coordinates() {
        let superclass = SuperclassInfo {
            resource: ResourceInfo::new("Ed-Fi", "EducationOrganization", "3.3.1-b"),
            identity: DocumentIdentity::from_pairs([("educationOrganizationId", "123")]).unwrap(),
        };
        let alias = alias_id(&superclass).unwrap();
        let reference = DocumentReference::new(superclass.resource.clone(), superclass.identity.clone());
        assert_eq!(alias, reference_id(&reference).unwrap());
        assert_ne!(
            alias,
            derive_checked(&ResourceInfo::new("Ed-Fi", "School", "3.3.1-b"), &school("123")).unwrap()
        );
    }

    proptest! {
        #[test]
        fn prop_order_insensitive(pairs in proptest::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9]{0,8}", 1..6)) {
            let forward: Vec<(String, String)> = pairs.clone().into_iter().collect();
            let mut reversed = forward.clone();
            reversed.reverse();

            let a = DocumentIdentity::from_pairs(forward).unwrap();
            let b = DocumentIdentity::from_pairs(reversed).unwrap();
            prop_assert_eq!(
                derive_document_id("Ed-Fi", "Student", "3.3.1-b", &a),
                derive_document_id("Ed-Fi", "Student", "3.3.1-b", &b)
            );
        }

        #[test]
        fn prop_distinct_values_give_distinct_ids(a in "[0-9]{1,9}", b in "[0-9]{1,9}") {
            prop_assume!(a != b);
            let ia = DocumentIdentity::from_pairs([("studentUniqueId", a)]).unwrap();
            let ib = DocumentIdentity::from_pairs([("studentUniqueId", b)]).unwrap();
            prop_assert_ne!(
                derive_document_id("Ed-Fi", "Student", "3.3.1-b", &ia),
                derive_document_id("Ed-Fi", "Student", "3.3.1-b", &ib)
            );
        }
    }
}
