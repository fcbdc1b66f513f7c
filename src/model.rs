//! Data model: documents, pending mutations, and asset metadata.
//!
//! DESIGN
//! ======
//! A `Document` carries both the columns the remote `documents` table stores
//! and two local-only flags (`synced`, `deleted`). The remote wire type lives
//! in `remote` so the local flags never leak onto the network.
//!
//! A document's persistence state is derived once via [`Document::sync_state`]
//! instead of being re-computed from scattered booleans at every call site.

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Prefix marking an id that was minted locally and never seen by the server.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Name given to documents created without an explicit title.
pub const DEFAULT_DOCUMENT_NAME: &str = "Untitled Drawing";

// =============================================================================
// TIME
// =============================================================================

/// Current wall-clock time in UTC.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// DOCUMENT ID
// =============================================================================

/// Document identity: a server-issued UUID or a locally minted temporary id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap an id received from storage or the network.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a temporary id of the form `temp-<unix-ms>-<8 hex chars>`.
    #[must_use]
    pub fn temporary() -> Self {
        let suffix: u32 = rand::rng().random();
        Self(format!("{TEMP_ID_PREFIX}{}-{suffix:08x}", now_ms()))
    }

    /// True if the server has never issued this id.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for DocumentId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

// =============================================================================
// SYNC STATE
// =============================================================================

/// Persistence state of one document, relative to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Exists only locally under a temporary id.
    LocalOnly,
    /// Known to the server, but the local copy has unsent changes.
    PendingSync,
    /// Local copy matches what the server has.
    Synced,
}

// =============================================================================
// DOCUMENT
// =============================================================================

/// A drawing document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    pub owner_id: Uuid,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_favorite: bool,
    /// Serialized canvas record set (JSON array of records).
    #[serde(default = "empty_canvas_data")]
    pub data: serde_json::Value,
    /// Redundant copy of `data` used for recovery.
    #[serde(default)]
    pub snapshot: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// True iff the local copy matches what the server has.
    #[serde(default)]
    pub synced: bool,
    /// Tombstone for a local delete awaiting remote confirmation.
    #[serde(default)]
    pub deleted: bool,
}

/// Empty-state sentinel for a document's canvas payload.
#[must_use]
pub fn empty_canvas_data() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

impl Document {
    /// Build a fresh, unsynced document under a temporary id.
    #[must_use]
    pub fn new_local(name: &str, owner_id: Uuid) -> Self {
        let now = now_utc();
        Self {
            id: DocumentId::temporary(),
            name: name.to_owned(),
            owner_id,
            is_public: false,
            is_favorite: false,
            data: empty_canvas_data(),
            snapshot: None,
            created_at: now,
            updated_at: now,
            synced: false,
            deleted: false,
        }
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        if self.id.is_temporary() {
            SyncState::LocalOnly
        } else if self.synced {
            SyncState::Synced
        } else {
            SyncState::PendingSync
        }
    }

    /// Apply a sparse patch and bump `updated_at`. Returns true if any field changed.
    pub fn apply_patch(&mut self, patch: &DocumentPatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(is_public) = patch.is_public {
            self.is_public = is_public;
        }
        if let Some(is_favorite) = patch.is_favorite {
            self.is_favorite = is_favorite;
        }
        if let Some(data) = &patch.data {
            self.data = data.clone();
        }
        if let Some(snapshot) = &patch.snapshot {
            self.snapshot = Some(snapshot.clone());
        }
        self.updated_at = now_utc();
        true
    }
}

// =============================================================================
// PATCH
// =============================================================================

/// Sparse update for a document. Only present fields are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
}

impl DocumentPatch {
    /// Content-only patch carrying a new canvas payload and its recovery copy.
    #[must_use]
    pub fn content(data: serde_json::Value) -> Self {
        Self { snapshot: Some(data.clone()), data: Some(data), ..Self::default() }
    }

    #[must_use]
    pub fn rename(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.is_public.is_none()
            && self.is_favorite.is_none()
            && self.data.is_none()
            && self.snapshot.is_none()
    }

    /// True if the patch touches nothing but the serialized canvas payload.
    #[must_use]
    pub fn is_content_only(&self) -> bool {
        !self.is_empty() && self.name.is_none() && self.is_public.is_none() && self.is_favorite.is_none()
    }
}

// =============================================================================
// PENDING MUTATION
// =============================================================================

/// Kind of a queued remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Parse the stored column value.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Sync queue entry: a mutation plus the document as it was at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub kind: MutationKind,
    pub document: Document,
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl PendingMutation {
    #[must_use]
    pub fn new(kind: MutationKind, document: Document) -> Self {
        Self { kind, document, enqueued_at: now_utc() }
    }

    #[must_use]
    pub fn document_id(&self) -> &DocumentId {
        &self.document.id
    }
}

// =============================================================================
// ASSET
// =============================================================================

/// Metadata for a binary asset referenced by a document. The payload bytes
/// are stored separately under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMeta {
    pub id: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    pub size: i64,
    pub owner_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
