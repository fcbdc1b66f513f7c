//! Shared test doubles and state builders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::config::{AccessConfig, AutosaveConfig, RelayConfig};
use crate::connectivity::Connectivity;
use crate::db::init_memory_pool;
use crate::model::{Document, DocumentId, DocumentPatch};
use crate::remote::{OperationRow, RemoteError, RemoteStore};
use crate::state::{AppState, Timings};
use crate::store::LocalStore;

// =============================================================================
// MOCK REMOTE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Connection-level failure; retryable.
    Transport,
    /// Server answered with this status.
    Status(u16),
}

impl MockFailure {
    fn to_error(self) -> RemoteError {
        match self {
            Self::Transport => RemoteError::Request("connection refused".into()),
            Self::Status(status) => RemoteError::Rejected { status, body: "mock rejection".into() },
        }
    }
}

#[derive(Default)]
struct MockState {
    rows: HashMap<String, Document>,
    fail_all: Option<MockFailure>,
    fail_ids: HashMap<String, MockFailure>,
    /// One-shot failures keyed by call prefix, e.g. `"upsert:"`.
    fail_once: Vec<(String, MockFailure)>,
    delay: Option<Duration>,
    calls: Vec<String>,
    operations: Vec<OperationRow>,
}

/// In-memory remote store with scripted failures.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_row(&self, doc: &Document) {
        let mut row = doc.clone();
        row.synced = true;
        row.deleted = false;
        self.state.lock().unwrap().rows.insert(row.id.to_string(), row);
    }

    pub fn row(&self, id: &DocumentId) -> Option<Document> {
        self.state.lock().unwrap().rows.get(id.as_str()).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    pub fn fail_all(&self, failure: Option<MockFailure>) {
        self.state.lock().unwrap().fail_all = failure;
    }

    pub fn fail_id(&self, id: &DocumentId, failure: MockFailure) {
        self.state.lock().unwrap().fail_ids.insert(id.to_string(), failure);
    }

    /// Fail the next call whose name starts with `prefix`, then recover.
    pub fn fail_next(&self, prefix: &str, failure: MockFailure) {
        self.state.lock().unwrap().fail_once.push((prefix.to_owned(), failure));
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn operations(&self) -> Vec<OperationRow> {
        self.state.lock().unwrap().operations.clone()
    }

    async fn enter(&self, call: String, id: Option<&str>) -> Result<(), RemoteError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call.clone());
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.fail_all {
            return Err(failure.to_error());
        }
        if let Some(pos) = state.fail_once.iter().position(|(prefix, _)| call.starts_with(prefix.as_str())) {
            let (_, failure) = state.fail_once.remove(pos);
            return Err(failure.to_error());
        }
        if let Some(failure) = id.and_then(|id| state.fail_ids.get(id)) {
            return Err(failure.to_error());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteStore for MockRemote {
    async fn list_documents(&self, owner_id: Uuid) -> Result<Vec<Document>, RemoteError> {
        self.enter("list".into(), None).await?;
        let mut docs: Vec<Document> =
            self.state.lock().unwrap().rows.values().filter(|d| d.owner_id == owner_id).cloned().collect();
        docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(docs)
    }

    async fn fetch_document(&self, id: &DocumentId) -> Result<Option<Document>, RemoteError> {
        self.enter(format!("fetch:{id}"), Some(id.as_str())).await?;
        Ok(self.row(id))
    }

    async fn insert_document(&self, doc: &Document) -> Result<Document, RemoteError> {
        self.enter(format!("insert:{}", doc.id), Some(doc.id.as_str())).await?;
        let mut row = doc.clone();
        if row.id.is_temporary() {
            row.id = DocumentId::from(Uuid::new_v4());
        }
        self.put_row(&row);
        Ok(self.row(&row.id).unwrap())
    }

    async fn upsert_document(&self, doc: &Document) -> Result<Document, RemoteError> {
        self.enter(format!("upsert:{}", doc.id), Some(doc.id.as_str())).await?;
        self.put_row(doc);
        Ok(self.row(&doc.id).unwrap())
    }

    async fn update_document(&self, id: &DocumentId, patch: &DocumentPatch) -> Result<Document, RemoteError> {
        self.enter(format!("update:{id}"), Some(id.as_str())).await?;
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.rows.get_mut(id.as_str()) else {
            return Err(RemoteError::NotFound(id.clone()));
        };
        row.apply_patch(patch);
        Ok(row.clone())
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<(), RemoteError> {
        self.enter(format!("delete:{id}"), Some(id.as_str())).await?;
        self.state.lock().unwrap().rows.remove(id.as_str());
        Ok(())
    }

    async fn insert_operation(&self, row: &OperationRow) -> Result<(), RemoteError> {
        self.enter("operation".into(), None).await?;
        self.state.lock().unwrap().operations.push(row.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.enter("ping".into(), None).await
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

pub async fn memory_store() -> LocalStore {
    LocalStore::new(init_memory_pool().await.unwrap())
}

/// Timings shrunk so tests run in milliseconds.
pub fn fast_timings() -> Timings {
    Timings {
        access: AccessConfig {
            remote_timeout: Duration::from_millis(200),
            fetch_min_interval: Duration::from_secs(1),
        },
        relay: RelayConfig {
            batch_window: Duration::from_millis(20),
            batch_max_wait: Duration::from_millis(60),
            settle_delay: Duration::from_millis(20),
            reconnect_base: Duration::from_millis(10),
            max_reconnect_attempts: 3,
            subscribe_timeout: Duration::from_millis(200),
        },
        autosave: AutosaveConfig { debounce: Duration::from_millis(40) },
    }
}

pub struct Harness {
    pub state: AppState,
    pub remote: Arc<MockRemote>,
}

pub async fn harness(online: bool) -> Harness {
    let remote = MockRemote::new();
    let state = AppState::new(
        Uuid::new_v4(),
        memory_store().await,
        remote.clone(),
        Connectivity::new(online),
        fast_timings(),
    )
    .await
    .unwrap();
    Harness { state, remote }
}

/// A document the server already knows, owned by `owner`.
pub fn server_document(owner: Uuid, name: &str) -> Document {
    let mut doc = Document::new_local(name, owner);
    doc.id = DocumentId::from(Uuid::new_v4());
    doc.synced = true;
    doc
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
