//! Relational engine: SQLite through an r2d2 connection pool
//!
//! # Schema
//!
//! - documents: one row per document, body in `edfi_doc` as JSON text
//! - existence: existence id (document id or alias) -> owning document
//! - document_references: one row per (parent, referenced) pair
//!
//! Every write runs in a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front. Concurrent writers queue on the busy
//! timeout instead of failing at commit, and the second of two racing
//! inserts of one id sees the first one's row.

use crate::error::{StoreError, StoreResult};
use crate::repository::{
    claimed_message, referenced_alias_message, sorted_unique, Applied, DeleteOutcome,
    DocumentRepository, DocumentWrite, GetOutcome, QueryOutcome, UpdateOutcome, UpsertOutcome,
};
use crate::sql::ParameterizedQuery;
use edstore_core::{
    Document, DocumentId, DocumentIdentity, FilterParameters, OutboundRef, Pagination,
    ResourceInfo,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS documents (
    document_id TEXT PRIMARY KEY NOT NULL,
    document_identity TEXT NOT NULL,
    project_name TEXT NOT NULL,
    resource_name TEXT NOT NULL,
    resource_version TEXT NOT NULL,
    is_descriptor INTEGER NOT NULL,
    validated INTEGER NOT NULL,
    created_by TEXT,
    alias_ids TEXT NOT NULL,
    edfi_doc TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS documents_by_resource
    ON documents (project_name, resource_name, resource_version, document_id);

CREATE TABLE IF NOT EXISTS existence (
    existence_id TEXT PRIMARY KEY NOT NULL,
    document_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS existence_by_document ON existence (document_id);

CREATE TABLE IF NOT EXISTS document_references (
    parent_document_id TEXT NOT NULL,
    referenced_document_id TEXT NOT NULL,
    is_descriptor INTEGER NOT NULL,
    PRIMARY KEY (parent_document_id, referenced_document_id)
);
CREATE INDEX IF NOT EXISTS references_by_referenced
    ON document_references (referenced_document_id);
";

const SELECT_DOCUMENT: &str = "SELECT document_id, document_identity, project_name, resource_name, \
     resource_version, is_descriptor, validated, created_by, alias_ids, edfi_doc FROM documents";

/// Ids per `IN (...)` list; stays well under SQLite's variable limit
const IN_CHUNK: usize = 500;

/// Options for opening a [`SqliteRepository`]
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Database file
    pub path: PathBuf,
    /// Maximum pooled connections
    pub pool_size: u32,
    /// How long a connection waits on the write lock
    pub busy_timeout: Duration,
}

impl SqliteOptions {
    /// Options for a file with default pool size and timeout
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteOptions {
            path: path.into(),
            pool_size: 8,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// Row of the documents table, before references are attached
struct DocumentRow {
    id: String,
    identity: String,
    project_name: String,
    resource_name: String,
    resource_version: String,
    is_descriptor: bool,
    validated: bool,
    created_by: Option<String>,
    alias_ids: String,
    body: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(DocumentRow {
            id: row.get(0)?,
            identity: row.get(1)?,
            project_name: row.get(2)?,
            resource_name: row.get(3)?,
            resource_version: row.get(4)?,
            is_descriptor: row.get(5)?,
            validated: row.get(6)?,
            created_by: row.get(7)?,
            alias_ids: row.get(8)?,
            body: row.get(9)?,
        })
    }

    fn into_document(self, conn: &Connection) -> StoreResult<Document> {
        let id = DocumentId::parse(&self.id)
            .map_err(|_| StoreError::Corruption(format!("bad document_id {:?}", self.id)))?;
        let identity: DocumentIdentity = serde_json::from_str(&self.identity)?;
        let alias_ids: Vec<DocumentId> = serde_json::from_str(&self.alias_ids)?;
        let out_refs = load_out_refs(conn, &id)?;
        Ok(Document {
            id,
            resource: ResourceInfo {
                project_name: self.project_name,
                resource_name: self.resource_name,
                resource_version: self.resource_version,
                is_descriptor: self.is_descriptor,
            },
            identity,
            body: serde_json::from_str(&self.body)?,
            out_refs,
            alias_ids,
            validated: self.validated,
            created_by: self.created_by,
        })
    }
}

fn load_out_refs(conn: &Connection, id: &DocumentId) -> StoreResult<Vec<OutboundRef>> {
    let mut stmt = conn.prepare_cached(
        "SELECT referenced_document_id, is_descriptor FROM document_references \
         WHERE parent_document_id = ?1 ORDER BY referenced_document_id",
    )?;
    let rows = stmt.query_map([id.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
    })?;
    let mut refs = Vec::new();
    for row in rows {
        let (referenced, is_descriptor) = row?;
        refs.push(OutboundRef {
            id: DocumentId::parse(&referenced)?,
            is_descriptor,
        });
    }
    Ok(refs)
}

fn load_document(conn: &Connection, id: &DocumentId) -> StoreResult<Option<Document>> {
    let mut q = ParameterizedQuery::new(SELECT_DOCUMENT);
    q.push(" WHERE document_id = ").bind(id.to_string());
    let row = conn
        .query_row(q.sql(), rusqlite::params_from_iter(q.params().iter()), DocumentRow::from_row)
        .optional()?;
    row.map(|r| r.into_document(conn)).transpose()
}

fn existing_in(conn: &Connection, ids: &[DocumentId]) -> StoreResult<Vec<DocumentId>> {
    let mut found = Vec::new();
    for chunk in ids.chunks(IN_CHUNK) {
        let mut q = ParameterizedQuery::new("SELECT existence_id FROM existence WHERE existence_id IN ");
        q.bind_list(chunk.iter().map(|id| id.to_string()));
        for existence_id in q.query_map(conn, |row| row.get::<_, String>(0))? {
            found.push(DocumentId::parse(&existence_id)?);
        }
    }
    Ok(sorted_unique(found))
}

/// First existence id of `ids` that belongs to a document other than `owner`
fn claimed_elsewhere(
    conn: &Connection,
    ids: &[DocumentId],
    owner: &DocumentId,
) -> StoreResult<Option<(DocumentId, DocumentId)>> {
    let mut q = ParameterizedQuery::new("SELECT existence_id, document_id FROM existence WHERE existence_id IN ");
    q.bind_list(ids.iter().map(|id| id.to_string()))
        .push(" AND document_id <> ")
        .bind(owner.to_string())
        .push(" ORDER BY existence_id LIMIT 1");
    let rows = q.query_map(conn, |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    match rows.into_iter().next() {
        Some((existence_id, other)) => Ok(Some((
            DocumentId::parse(&existence_id)?,
            DocumentId::parse(&other)?,
        ))),
        None => Ok(None),
    }
}

/// Documents other than `owner` referencing any of `ids`, sorted
fn referencing(
    conn: &Connection,
    ids: &[DocumentId],
    owner: &DocumentId,
) -> StoreResult<Vec<DocumentId>> {
    let mut q = ParameterizedQuery::new(
        "SELECT DISTINCT parent_document_id FROM document_references WHERE referenced_document_id IN ",
    );
    q.bind_list(ids.iter().map(|e| e.to_string()))
        .push(" AND parent_document_id <> ")
        .bind(owner.to_string())
        .push(" ORDER BY parent_document_id");
    let mut parents = Vec::new();
    for parent in q.query_map(conn, |row| row.get::<_, String>(0))? {
        parents.push(DocumentId::parse(&parent)?);
    }
    Ok(parents)
}

/// Relational engine adapter
pub struct SqliteRepository {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteRepository {
    /// Open (creating if needed) a database file and its schema
    ///
    /// # Errors
    ///
    /// Fails if the pool cannot be built or the schema cannot be created.
    pub fn open(options: &SqliteOptions) -> StoreResult<Self> {
        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(&options.path).with_init(move |conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(busy_timeout)
        });
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .build(manager)?;

        pool.get()?.execute_batch(SCHEMA)?;
        info!(
            target: "edstore::storage",
            path = %options.path.display(),
            pool_size = options.pool_size,
            "Opened SQLite repository"
        );
        Ok(SqliteRepository { pool })
    }

    fn write(&self, write: &DocumentWrite, insert_allowed: bool) -> StoreResult<Applied> {
        let new = &write.document;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let old = load_document(&tx, &new.id)?;
        if old.is_none() && !insert_allowed {
            return Ok(Applied::NotExists);
        }

        let existence_ids = new.existence_ids();
        if let Some((existence_id, owner)) = claimed_elsewhere(&tx, &existence_ids, &new.id)? {
            return Ok(Applied::Conflict(claimed_message(&existence_id, &owner)));
        }

        let enforced = sorted_unique(write.enforced_refs.clone());
        let found = existing_in(&tx, &enforced)?;
        let missing: Vec<DocumentId> = enforced
            .into_iter()
            .filter(|id| found.binary_search(id).is_err())
            .collect();
        if !missing.is_empty() {
            return Ok(Applied::Missing(missing));
        }

        if let Some(old) = &old {
            for alias in old.alias_ids.iter().filter(|a| !new.alias_ids.contains(a)) {
                let parents = referencing(&tx, std::slice::from_ref(alias), &new.id)?;
                if !parents.is_empty() {
                    return Ok(Applied::Conflict(referenced_alias_message(alias, &parents)));
                }
            }
        }

        let created_by = old
            .as_ref()
            .and_then(|o| o.created_by.clone())
            .or_else(|| new.created_by.clone());
        let identity = serde_json::to_string(&new.identity)?;
        let alias_ids = serde_json::to_string(&new.alias_ids)?;
        let body = serde_json::to_string(&new.body)?;

        if old.is_some() {
            tx.execute(
                "UPDATE documents SET document_identity = ?2, project_name = ?3, resource_name = ?4, \
                 resource_version = ?5, is_descriptor = ?6, validated = ?7, created_by = ?8, \
                 alias_ids = ?9, edfi_doc = ?10 WHERE document_id = ?1",
                rusqlite::params![
                    new.id.as_str(),
                    identity,
                    new.resource.project_name,
                    new.resource.resource_name,
                    new.resource.resource_version,
                    new.resource.is_descriptor,
                    new.validated,
                    created_by,
                    alias_ids,
                    body,
                ],
            )?;
            tx.execute("DELETE FROM existence WHERE document_id = ?1", [new.id.as_str()])?;
            tx.execute(
                "DELETE FROM document_references WHERE parent_document_id = ?1",
                [new.id.as_str()],
            )?;
        } else {
            tx.execute(
                "INSERT INTO documents (document_id, document_identity, project_name, resource_name, \
                 resource_version, is_descriptor, validated, created_by, alias_ids, edfi_doc) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    new.id.as_str(),
                    identity,
                    new.resource.project_name,
                    new.resource.resource_name,
                    new.resource.resource_version,
                    new.resource.is_descriptor,
                    new.validated,
                    created_by,
                    alias_ids,
                    body,
                ],
            )?;
        }

        {
            let mut insert_existence = tx.prepare_cached(
                "INSERT INTO existence (existence_id, document_id) VALUES (?1, ?2)",
            )?;
            for existence_id in &existence_ids {
                insert_existence.execute([existence_id.as_str(), new.id.as_str()])?;
            }
            let mut insert_reference = tx.prepare_cached(
                "INSERT OR IGNORE INTO document_references \
                 (parent_document_id, referenced_document_id, is_descriptor) VALUES (?1, ?2, ?3)",
            )?;
            for r in &new.out_refs {
                insert_reference.execute(rusqlite::params![
                    new.id.as_str(),
                    r.id.as_str(),
                    r.is_descriptor
                ])?;
            }
        }
        tx.commit()?;

        Ok(if old.is_some() {
            Applied::Updated
        } else {
            Applied::Inserted
        })
    }

    fn try_delete(&self, id: &DocumentId, force: bool) -> StoreResult<DeleteOutcome> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let document = match load_document(&tx, id)? {
            Some(document) => document,
            None => return Ok(DeleteOutcome::NotExists),
        };

        let parents = referencing(&tx, &document.existence_ids(), id)?;
        if !parents.is_empty() && !force {
            return Ok(DeleteOutcome::ReferenceConflict(parents));
        }

        tx.execute("DELETE FROM documents WHERE document_id = ?1", [id.as_str()])?;
        tx.execute("DELETE FROM existence WHERE document_id = ?1", [id.as_str()])?;
        tx.execute(
            "DELETE FROM document_references WHERE parent_document_id = ?1",
            [id.as_str()],
        )?;
        tx.commit()?;
        Ok(DeleteOutcome::Success(document))
    }

    fn try_query(
        &self,
        resource: &ResourceInfo,
        filters: &FilterParameters,
        pagination: &Pagination,
    ) -> StoreResult<Vec<Document>> {
        let conn = self.pool.get()?;
        let mut q = ParameterizedQuery::new(SELECT_DOCUMENT);
        q.push(" WHERE project_name = ")
            .bind(resource.project_name.clone())
            .push(" AND resource_name = ")
            .bind(resource.resource_name.clone())
            .push(" AND resource_version = ")
            .bind(resource.resource_version.clone());
        for (path, value) in filters.iter() {
            q.push(" AND ")
                .push_body_scalar_eq(format!("$.{}", path), value.to_string());
        }
        q.push(" ORDER BY document_id LIMIT ")
            .bind(pagination.limit.map_or(-1, |l| l as i64))
            .push(" OFFSET ")
            .bind(pagination.offset as i64);

        let rows = q.query_map(&conn, DocumentRow::from_row)?;
        rows.into_iter().map(|r| r.into_document(&conn)).collect()
    }
}

impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository")
            .field("pool_state", &self.pool.state())
            .finish()
    }
}

impl DocumentRepository for SqliteRepository {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn upsert(&self, write: &DocumentWrite) -> UpsertOutcome {
        Applied::upsert_outcome(self.write(write, true))
    }

    fn update(&self, write: &DocumentWrite) -> UpdateOutcome {
        Applied::update_outcome(self.write(write, false))
    }

    fn get_by_id(&self, id: &DocumentId) -> GetOutcome {
        let loaded = self
            .pool
            .get()
            .map_err(StoreError::from)
            .and_then(|conn| load_document(&conn, id));
        match loaded {
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
        match self.try_query(resource, filters, pagination) {
            Ok(documents) => QueryOutcome::Success(documents),
            Err(e) => QueryOutcome::UnknownFailure(e.to_string()),
        }
    }

    fn find_existing(&self, ids: &[DocumentId]) -> StoreResult<Vec<DocumentId>> {
        let conn = self.pool.get()?;
        existing_in(&conn, ids)
    }

    fn scan(&self, after: Option<&DocumentId>, limit: usize) -> StoreResult<Vec<Document>> {
        let conn = self.pool.get()?;
        let mut q = ParameterizedQuery::new(SELECT_DOCUMENT);
        q.push(" WHERE document_id > ")
            .bind(after.map_or_else(String::new, |a| a.to_string()))
            .push(" ORDER BY document_id LIMIT ")
            .bind(limit as i64);
        let rows = q.query_map(&conn, DocumentRow::from_row)?;
        rows.into_iter().map(|r| r.into_document(&conn)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edstore_core::derive_document_id;
    use serde_json::json;

    fn open(dir: &tempfile::TempDir) -> SqliteRepository {
        SqliteRepository::open(&SqliteOptions::new(dir.path().join("edstore.sqlite3"))).unwrap()
    }

    fn school(key: &str) -> Document {
        let identity = DocumentIdentity::from_pairs([("schoolId", key)]).unwrap();
        Document {
            id: derive_document_id("Ed-Fi", "School", "3.3.1-b", &identity),
            resource: ResourceInfo::new("Ed-Fi", "School", "3.3.1-b"),
            identity,
            body: json!({"schoolId": key, "nameOfInstitution": "A"}),
            out_refs: vec![],
            alias_ids: vec![],
            validated: true,
            created_by: Some("c".to_string()),
        }
    }

    #[test]
    fn test_roundtrip_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open(&dir);
        let doc = school("1");
        assert_eq!(
            repo.upsert(&DocumentWrite::enforcing_all(doc.clone())),
            UpsertOutcome::InsertSuccess
        );
        assert_eq!(repo.get_by_id(&doc.id), GetOutcome::Success(doc));
    }

    #[test]
    fn test_reopen_sees_committed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let doc = school("7");
        {
            let repo = open(&dir);
            repo.upsert(&DocumentWrite::enforcing_all(doc.clone()));
        }
        let repo = open(&dir);
        assert!(matches!(repo.get_by_id(&doc.id), GetOutcome::Success(_)));
        assert_eq!(repo.find_existing(&[doc.id.clone()]).unwrap(), vec![doc.id]);
    }

    #[test]
    fn test_scan_pages_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let repo = open(&dir);
        for n in 0..5 {
            repo.upsert(&DocumentWrite::enforcing_all(school(&n.to_string())));
        }
        let first = repo.scan(None, 3).unwrap();
        let rest = repo.scan(Some(&first[2].id), 3).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(rest.len(), 2);
        assert!(first[2].id < rest[0].id);
    }
}
