//! Core types for edstore
//!
//! This module defines the document model shared by every storage engine:
//! - DocumentId: 56 character lowercase hex id (224 bits)
//! - DocumentIdentity: natural-key pairs, canonically sorted by field name
//! - ResourceInfo: schema coordinates of a resource
//! - DocumentReference / SuperclassInfo: identity-bearing pointers
//! - Document: the stored unit
//! - Security: the collaborator-supplied ownership predicate
//! - TraceId: correlation id carried into logs

use crate::error::{Error, Result};
use crate::identity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// DocumentId
// ============================================================================

/// Identifier of a stored document
///
/// Always 56 lowercase hex characters. Produced by identity derivation,
/// or parsed from a caller-supplied string with [`DocumentId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    /// Length of a rendered id in hex characters
    pub const LEN: usize = 56;

    /// Parse and normalize an id
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidDocumentId` unless the input is exactly 56 hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() == Self::LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(DocumentId(s.to_ascii_lowercase()))
        } else {
            Err(Error::InvalidDocumentId(s.to_string()))
        }
    }

    /// Wrap a digest already rendered as lowercase hex
    pub(crate) fn from_hex_digest(hex: String) -> Self {
        debug_assert_eq!(hex.len(), Self::LEN);
        DocumentId(hex)
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DocumentId::parse(s)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        DocumentId::parse(&s)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

// ============================================================================
// DocumentIdentity
// ============================================================================

/// Natural-key name/value pairs that make a document unique in its resource
///
/// Pairs are kept sorted by field name, so two identities built from the
/// same pairs in different orders are equal and derive the same id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentIdentity(BTreeMap<String, String>);

impl DocumentIdentity {
    /// Create an empty identity
    pub fn new() -> Self {
        DocumentIdentity(BTreeMap::new())
    }

    /// Build an identity from name/value pairs
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` for an empty field name, or for a
    /// field name repeated with a different value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut identity = DocumentIdentity::new();
        for (name, value) in pairs {
            identity.insert(name.into(), value.into())?;
        }
        Ok(identity)
    }

    /// Build an identity from a JSON object of scalar values
    ///
    /// Strings are taken as-is; numbers and booleans use their JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` if the value is not an object or
    /// holds a null, array or object value.
    pub fn from_json_object(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::InvalidIdentity("identity must be a JSON object".to_string()))?;
        let mut identity = DocumentIdentity::new();
        for (name, value) in object {
            let rendered = crate::query::render_scalar(value).ok_or_else(|| {
                Error::InvalidIdentity(format!("identity field '{}' is not a scalar", name))
            })?;
            identity.insert(name.clone(), rendered)?;
        }
        Ok(identity)
    }

    fn insert(&mut self, name: String, value: String) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidIdentity("empty field name".to_string()));
        }
        match self.0.get(&name) {
            Some(existing) if existing != &value => Err(Error::InvalidIdentity(format!(
                "field '{}' given conflicting values",
                name
            ))),
            _ => {
                self.0.insert(name, value);
                Ok(())
            }
        }
    }

    /// Get the value of a field
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterate pairs in canonical (field name) order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of identity fields
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the identity has no fields
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Resource coordinates and references
// ============================================================================

/// Schema coordinates of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    /// Project the resource is defined in, e.g. "Ed-Fi"
    pub project_name: String,
    /// Resource name, e.g. "School"
    pub resource_name: String,
    /// Resource version, e.g. "3.3.1-b"
    pub resource_version: String,
    /// Whether the resource is a descriptor (leaf/enumeration value)
    pub is_descriptor: bool,
}

impl ResourceInfo {
    /// Coordinates of a non-descriptor resource
    pub fn new(
        project_name: impl Into<String>,
        resource_name: impl Into<String>,
        resource_version: impl Into<String>,
    ) -> Self {
        ResourceInfo {
            project_name: project_name.into(),
            resource_name: resource_name.into(),
            resource_version: resource_version.into(),
            is_descriptor: false,
        }
    }

    /// Coordinates of a descriptor resource
    pub fn descriptor(
        project_name: impl Into<String>,
        resource_name: impl Into<String>,
        resource_version: impl Into<String>,
    ) -> Self {
        ResourceInfo {
            is_descriptor: true,
            ..ResourceInfo::new(project_name, resource_name, resource_version)
        }
    }

    /// Check that every coordinate is present
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidReference` naming the first empty coordinate.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("projectName", &self.project_name),
            ("resourceName", &self.resource_name),
            ("resourceVersion", &self.resource_version),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidReference(format!("{} is empty", field)));
            }
        }
        Ok(())
    }

    /// Check whether a stored document belongs to this resource
    pub fn matches(&self, other: &ResourceInfo) -> bool {
        self.project_name == other.project_name
            && self.resource_name == other.resource_name
            && self.resource_version == other.resource_version
    }
}

/// A reference from one document to another, by identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    /// Coordinates of the referenced resource
    pub resource: ResourceInfo,
    /// Identity of the referenced document
    pub identity: DocumentIdentity,
}

impl DocumentReference {
    /// Create a reference
    pub fn new(resource: ResourceInfo, identity: DocumentIdentity) -> Self {
        DocumentReference { resource, identity }
    }

    /// Derive the id this reference points at
    ///
    /// # Errors
    ///
    /// Fails when the coordinates or identity are incomplete.
    pub fn resolve(&self) -> Result<OutboundRef> {
        Ok(OutboundRef {
            id: identity::reference_id(self)?,
            is_descriptor: self.resource.is_descriptor,
        })
    }
}

/// Superclass form of a subclass document's identity
///
/// A School with `schoolId=123` is also an EducationOrganization with
/// `educationOrganizationId=123`; the superclass id becomes an alias of the
/// School document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperclassInfo {
    /// Coordinates of the superclass resource
    pub resource: ResourceInfo,
    /// Identity of the document in superclass form
    pub identity: DocumentIdentity,
}

/// Resolved outbound reference stored with a document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRef {
    /// Referenced document id
    pub id: DocumentId,
    /// Whether the referenced resource is a descriptor
    pub is_descriptor: bool,
}

// ============================================================================
// Document
// ============================================================================

/// The unit of storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Derived id
    pub id: DocumentId,
    /// Schema coordinates
    pub resource: ResourceInfo,
    /// Natural key
    pub identity: DocumentIdentity,
    /// The API document itself
    pub body: Value,
    /// Referenced documents, sorted and unique by id
    pub out_refs: Vec<OutboundRef>,
    /// Superclass-form ids this document also satisfies
    #[serde(default)]
    pub alias_ids: Vec<DocumentId>,
    /// Whether every outbound reference was checked for this body
    pub validated: bool,
    /// Client that created the document
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Document {
    /// Sort outbound references by id and drop repeats
    pub fn normalize_out_refs(mut refs: Vec<OutboundRef>) -> Vec<OutboundRef> {
        refs.sort();
        refs.dedup_by(|a, b| a.id == b.id);
        refs
    }

    /// Ids of referenced documents
    pub fn out_ref_ids(&self) -> Vec<DocumentId> {
        self.out_refs.iter().map(|r| r.id.clone()).collect()
    }

    /// Ids that resolve to this document: its own id plus aliases
    pub fn existence_ids(&self) -> Vec<DocumentId> {
        let mut ids = Vec::with_capacity(1 + self.alias_ids.len());
        ids.push(self.id.clone());
        ids.extend(self.alias_ids.iter().cloned());
        ids
    }
}

// ============================================================================
// Security
// ============================================================================

/// How the authorization collaborator scoped this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStrategy {
    /// Client may act on every document
    FullAccess,
    /// Client may only act on documents it created
    OwnershipBased,
}

/// Security context supplied with every request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Security {
    /// Authenticated client id
    pub client_id: String,
    /// Ownership scope
    pub strategy: AuthorizationStrategy,
}

impl Security {
    /// Full-access context for a client
    pub fn full_access(client_id: impl Into<String>) -> Self {
        Security {
            client_id: client_id.into(),
            strategy: AuthorizationStrategy::FullAccess,
        }
    }

    /// Ownership-scoped context for a client
    pub fn ownership_based(client_id: impl Into<String>) -> Self {
        Security {
            client_id: client_id.into(),
            strategy: AuthorizationStrategy::OwnershipBased,
        }
    }

    /// Whether this client may see or change the given document
    pub fn permits(&self, document: &Document) -> bool {
        match self.strategy {
            AuthorizationStrategy::FullAccess => true,
            AuthorizationStrategy::OwnershipBased => {
                document.created_by.as_deref() == Some(self.client_id.as_str())
            }
        }
    }
}

// ============================================================================
// TraceId
// ============================================================================

/// Correlation id for one request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Generate a fresh random trace id
    pub fn new() -> Self {
        TraceId(Uuid::new_v4().to_string())
    }

    /// Borrow the trace id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        TraceId::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TraceId {
    fn from(s: &str) -> Self {
        TraceId(s.to_string())
    }
}
