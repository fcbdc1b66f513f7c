//! Remote store contract — the hosted relational tables reachable only online.
//!
//! DESIGN
//! ======
//! `RemoteStore` is the seam between the sync core and the hosted backend.
//! The production implementation speaks the PostgREST dialect over HTTP
//! (`rest::RestRemoteStore`); tests substitute an in-memory double. Every
//! document returned by a remote call is marked `synced`, since it is by
//! definition what the server has.
//!
//! ERROR HANDLING
//! ==============
//! `RemoteError::retryable` separates transient failures (timeouts, transport
//! errors, 5xx, 408, 429) from rejections. Callers queue the former for the
//! next drain and surface the latter without retrying.

pub mod rest;

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{Document, DocumentId, DocumentPatch};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("http client build failed: {0}")]
    HttpClientBuild(String),
    #[error("remote request failed: {0}")]
    Request(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote rejected request (status {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("document not found on server: {0}")]
    NotFound(DocumentId),
    #[error("malformed remote response: {0}")]
    Parse(String),
}

impl crate::error::ErrorCode for RemoteError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::HttpClientBuild(_) => "E_REMOTE_CLIENT",
            Self::Request(_) => "E_REMOTE_UNREACHABLE",
            Self::Timeout(_) => "E_REMOTE_TIMEOUT",
            Self::Rejected { .. } => "E_REMOTE_REJECTED",
            Self::NotFound(_) => "E_REMOTE_NOT_FOUND",
            Self::Parse(_) => "E_REMOTE_PARSE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Request(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::HttpClientBuild(_) | Self::NotFound(_) | Self::Parse(_) => false,
        }
    }
}

/// One row of the `document_operations` relay table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRow {
    pub document_id: DocumentId,
    pub user_id: Uuid,
    /// Serialized relay message.
    pub operation: serde_json::Value,
}

/// Row shape of the remote `documents` table. Local-only flags never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRow {
    /// Omitted on insert so the server assigns the id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub owner_id: Uuid,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub snapshot: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DocumentRow {
    /// Row for an insert: temporary ids are dropped so the server mints one.
    #[must_use]
    pub fn for_insert(doc: &Document) -> Self {
        let mut row = Self::from(doc);
        if doc.id.is_temporary() {
            row.id = None;
        }
        row
    }

    /// Convert a server row into a synced local document.
    ///
    /// # Errors
    ///
    /// Returns `Parse` if the server omitted the id.
    pub fn into_document(self) -> Result<Document, RemoteError> {
        let id = self.id.ok_or_else(|| RemoteError::Parse("document row without id".into()))?;
        let data = if self.data.is_null() { crate::model::empty_canvas_data() } else { self.data };
        Ok(Document {
            id: DocumentId::new(id),
            name: self.name,
            owner_id: self.owner_id,
            is_public: self.is_public,
            is_favorite: self.is_favorite,
            data,
            snapshot: self.snapshot,
            created_at: self.created_at,
            updated_at: self.updated_at,
            synced: true,
            deleted: false,
        })
    }
}

impl From<&Document> for DocumentRow {
    fn from(doc: &Document) -> Self {
        Self {
            id: Some(doc.id.to_string()),
            name: doc.name.clone(),
            owner_id: doc.owner_id,
            is_public: doc.is_public,
            is_favorite: doc.is_favorite,
            data: doc.data.clone(),
            snapshot: doc.snapshot.clone(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

// =============================================================================
// REMOTE STORE TRAIT
// =============================================================================

/// Backend-neutral async contract for the hosted document tables. Enables mocking in tests.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// List the owner's documents, most recently updated first.
    async fn list_documents(&self, owner_id: Uuid) -> Result<Vec<Document>, RemoteError>;

    /// Fetch one document. `Ok(None)` means the server has no such row.
    async fn fetch_document(&self, id: &DocumentId) -> Result<Option<Document>, RemoteError>;

    /// Insert a new document. A temporary id is replaced by a server-issued one.
    async fn insert_document(&self, doc: &Document) -> Result<Document, RemoteError>;

    /// Insert or overwrite a document by id (whole-row last write wins).
    async fn upsert_document(&self, doc: &Document) -> Result<Document, RemoteError>;

    /// Apply a sparse patch to an existing row.
    async fn update_document(&self, id: &DocumentId, patch: &DocumentPatch) -> Result<Document, RemoteError>;

    /// Delete a row. Deleting a row that does not exist succeeds.
    async fn delete_document(&self, id: &DocumentId) -> Result<(), RemoteError>;

    /// Append a row to the operation relay table.
    async fn insert_operation(&self, row: &OperationRow) -> Result<(), RemoteError>;

    /// Cheap reachability check.
    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Race a remote call against a fixed deadline. Expiry is reported as
/// `RemoteError::Timeout` and the call is not retried.
///
/// # Errors
///
/// Returns the call's own error, or `Timeout` if `limit` elapses first.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}

// =============================================================================
// DISCONNECTED
// =============================================================================

/// Stand-in for sessions with no remote configured. Every call fails as unreachable.
pub struct Disconnected;

impl Disconnected {
    fn unreachable<T>() -> Result<T, RemoteError> {
        Err(RemoteError::Request("no remote store configured".into()))
    }
}

#[async_trait::async_trait]
impl RemoteStore for Disconnected {
    async fn list_documents(&self, _owner_id: Uuid) -> Result<Vec<Document>, RemoteError> {
        Self::unreachable()
    }

    async fn fetch_document(&self, _id: &DocumentId) -> Result<Option<Document>, RemoteError> {
        Self::unreachable()
    }

    async fn insert_document(&self, _doc: &Document) -> Result<Document, RemoteError> {
        Self::unreachable()
    }

    async fn upsert_document(&self, _doc: &Document) -> Result<Document, RemoteError> {
        Self::unreachable()
    }

    async fn update_document(&self, _id: &DocumentId, _patch: &DocumentPatch) -> Result<Document, RemoteError> {
        Self::unreachable()
    }

    async fn delete_document(&self, _id: &DocumentId) -> Result<(), RemoteError> {
        Self::unreachable()
    }

    async fn insert_operation(&self, _row: &OperationRow) -> Result<(), RemoteError> {
        Self::unreachable()
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Self::unreachable()
    }
}
