//! Local document store — durable, network-free storage of documents and assets.
//!
//! DESIGN
//! ======
//! `LocalStore` wraps a SQLite pool. Documents are upserted by id with no
//! merge logic: the last writer wins at this layer and merge policy lives in
//! the access layer. Asset metadata and payload bytes sit in separate tables
//! and are only ever written or removed together inside one transaction.
//!
//! ERROR HANDLING
//! ==============
//! Store failures propagate to the caller. A failed save means the operation
//! is not durable; nothing here retries or swallows errors.

mod assets;
mod queue;

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;

use sqlx::SqlitePool;
use sqlx::types::Json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::model::{Document, DocumentId};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("timestamp format error: {0}")]
    Timestamp(#[from] time::error::Format),
}

impl crate::error::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_STORE_UNAVAILABLE",
            Self::Corrupt { .. } => "E_STORE_CORRUPT",
            Self::Serialize(_) => "E_STORE_SERIALIZE",
            Self::Timestamp(_) => "E_STORE_TIMESTAMP",
        }
    }
}

/// Handle to the local store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    name: String,
    owner_id: String,
    is_public: bool,
    is_favorite: bool,
    data: Json<serde_json::Value>,
    snapshot: Option<Json<serde_json::Value>>,
    created_at: String,
    updated_at: String,
    synced: bool,
    deleted: bool,
}

const DOCUMENT_COLUMNS: &str =
    "id, name, owner_id, is_public, is_favorite, data, snapshot, created_at, updated_at, synced, deleted";

pub(crate) fn format_ts(ts: OffsetDateTime) -> Result<String, StoreError> {
    Ok(ts.to_offset(time::UtcOffset::UTC).format(&Rfc3339)?)
}

pub(crate) fn parse_ts(id: &str, raw: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| StoreError::Corrupt { id: id.to_owned(), reason: e.to_string() })
}

pub(crate) fn parse_owner(id: &str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt { id: id.to_owned(), reason: e.to_string() })
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let owner_id = parse_owner(&row.id, &row.owner_id)?;
        let created_at = parse_ts(&row.id, &row.created_at)?;
        let updated_at = parse_ts(&row.id, &row.updated_at)?;
        Ok(Document {
            id: DocumentId::new(row.id),
            name: row.name,
            owner_id,
            is_public: row.is_public,
            is_favorite: row.is_favorite,
            data: row.data.0,
            snapshot: row.snapshot.map(|s| s.0),
            created_at,
            updated_at,
            synced: row.synced,
            deleted: row.deleted,
        })
    }
}

fn rows_to_documents(rows: Vec<DocumentRow>) -> Result<Vec<Document>, StoreError> {
    rows.into_iter().map(Document::try_from).collect()
}

// =============================================================================
// DOCUMENTS
// =============================================================================

impl LocalStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace a document by id.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub async fn save_document(&self, doc: &Document) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents (id, name, owner_id, is_public, is_favorite, data, snapshot, created_at, updated_at, synced, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner_id = excluded.owner_id,
                is_public = excluded.is_public,
                is_favorite = excluded.is_favorite,
                data = excluded.data,
                snapshot = excluded.snapshot,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                synced = excluded.synced,
                deleted = excluded.deleted",
        )
        .bind(doc.id.as_str())
        .bind(&doc.name)
        .bind(doc.owner_id.to_string())
        .bind(doc.is_public)
        .bind(doc.is_favorite)
        .bind(Json(&doc.data))
        .bind(doc.snapshot.as_ref().map(Json))
        .bind(format_ts(doc.created_at)?)
        .bind(format_ts(doc.updated_at)?)
        .bind(doc.synced)
        .bind(doc.deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one document by id, tombstones included.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails or the row is corrupt.
    pub async fn get_document(&self, id: &DocumentId) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Document::try_from).transpose()
    }

    /// List an owner's live documents, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails or a row is corrupt.
    pub async fn get_all_documents(&self, owner_id: Uuid) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE owner_id = ?1 AND deleted = 0
             ORDER BY updated_at DESC"
        ))
        .bind(owner_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows_to_documents(rows)
    }

    /// List an owner's favorite documents, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails or a row is corrupt.
    pub async fn get_favorite_documents(&self, owner_id: Uuid) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE owner_id = ?1 AND is_favorite = 1 AND deleted = 0
             ORDER BY updated_at DESC"
        ))
        .bind(owner_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows_to_documents(rows)
    }

    /// List every document of an owner whose local copy differs from the server,
    /// tombstones included.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails or a row is corrupt.
    pub async fn get_unsynced_documents(&self, owner_id: Uuid) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE owner_id = ?1 AND synced = 0
             ORDER BY updated_at ASC"
        ))
        .bind(owner_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows_to_documents(rows)
    }

    /// Hard-delete a document. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a store error if the delete fails.
    pub async fn delete_document(&self, id: &DocumentId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark a document synced, but only if it still carries `updated_at`.
    /// A newer local edit made while the remote write was in flight stays unsynced.
    ///
    /// # Errors
    ///
    /// Returns a store error if the update fails.
    pub async fn mark_synced(&self, id: &DocumentId, updated_at: OffsetDateTime) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE documents SET synced = 1 WHERE id = ?1 AND updated_at = ?2")
            .bind(id.as_str())
            .bind(format_ts(updated_at)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a document from a temporary id to its server-issued id.
    ///
    /// The temporary row is taken and the new one written in one transaction,
    /// so an edit saved under the temporary id is either carried over or
    /// finds no row afterwards. The moved copy is marked synced only if it is
    /// no newer than `sent_at`, the version the server received.
    ///
    /// Returns the moved document, or `None` if the temporary row is gone.
    ///
    /// # Errors
    ///
    /// Returns a store error if either write fails; nothing is committed then.
    pub async fn migrate_document_id(
        &self,
        from: &DocumentId,
        to: &DocumentId,
        sent_at: OffsetDateTime,
    ) -> Result<Option<Document>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let taken = sqlx::query_as::<_, DocumentRow>(&format!(
            "DELETE FROM documents WHERE id = ?1 RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(from.as_str())
        .fetch_optional(tx.as_mut())
        .await?;
        let Some(taken) = taken else {
            return Ok(None);
        };
        let mut doc = Document::try_from(taken)?;
        doc.id = to.clone();
        doc.synced = doc.updated_at <= sent_at;

        sqlx::query(
            "INSERT OR REPLACE INTO documents (id, name, owner_id, is_public, is_favorite, data, snapshot, created_at, updated_at, synced, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(doc.id.as_str())
        .bind(&doc.name)
        .bind(doc.owner_id.to_string())
        .bind(doc.is_public)
        .bind(doc.is_favorite)
        .bind(Json(&doc.data))
        .bind(doc.snapshot.as_ref().map(Json))
        .bind(format_ts(doc.created_at)?)
        .bind(format_ts(doc.updated_at)?)
        .bind(doc.synced)
        .bind(doc.deleted)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(Some(doc))
    }

    /// Overwrite an existing document. Returns false, writing nothing, if no
    /// row with that id exists.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub async fn overwrite_document(&self, doc: &Document) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE documents SET
                name = ?2, owner_id = ?3, is_public = ?4, is_favorite = ?5, data = ?6, snapshot = ?7,
                created_at = ?8, updated_at = ?9, synced = ?10, deleted = ?11
             WHERE id = ?1",
        )
        .bind(doc.id.as_str())
        .bind(&doc.name)
        .bind(doc.owner_id.to_string())
        .bind(doc.is_public)
        .bind(doc.is_favorite)
        .bind(Json(&doc.data))
        .bind(doc.snapshot.as_ref().map(Json))
        .bind(format_ts(doc.created_at)?)
        .bind(format_ts(doc.updated_at)?)
        .bind(doc.synced)
        .bind(doc.deleted)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
