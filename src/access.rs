//! Document access layer — the single entry point the host UI talks to.
//!
//! DESIGN
//! ======
//! Every operation decides once where it goes: `Route::select` maps the
//! connectivity flag and the document's `SyncState` to `Local` or `Remote`.
//! The local store is always written first, so an operation that returns
//! success is durable even if the remote half never happens.
//!
//! `DocumentAccess` also owns the view state the UI renders: the document
//! list, the current document, and loading flags. Documents are handed out
//! as `Arc<Document>`; replacing the `Arc` is how a change is signalled, so
//! content-only updates (autosave ticks) keep the existing `Arc` in place.
//!
//! ERROR HANDLING
//! ==============
//! Operations return `bool` / `Option` and never propagate errors. Each
//! failure is logged and converted at the boundary:
//! - transient remote failure: keep the local write, queue it, info notice
//! - remote rejection: error notice, not retried
//! - read failure: fall back to the cached copy silently; notify only when
//!   nothing is cached
//! - malformed payload: abort the load, nothing is applied

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::canvas::parse_records;
use crate::debounce::MinInterval;
use crate::error::ErrorCode;
use crate::model::{DEFAULT_DOCUMENT_NAME, Document, DocumentId, DocumentPatch, MutationKind, SyncState};
use crate::remote::{RemoteError, with_timeout};
use crate::state::AppState;
use crate::sync::IdRemap;

// =============================================================================
// ROUTING
// =============================================================================

/// Where an operation on an existing document is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Remote,
}

impl Route {
    /// Remote only when online and the server has seen the id.
    #[must_use]
    pub fn select(online: bool, state: SyncState) -> Self {
        if online && state != SyncState::LocalOnly { Self::Remote } else { Self::Local }
    }
}

// =============================================================================
// VIEW STATE
// =============================================================================

struct ViewState {
    documents: Vec<Arc<Document>>,
    current: Option<Arc<Document>>,
    is_loading: bool,
    is_fetching: bool,
    fetch_gate: MinInterval,
}

impl ViewState {
    /// Replace an existing list entry and the current document if ids match.
    fn replace(&mut self, doc: &Arc<Document>) {
        if let Some(slot) = self.documents.iter_mut().find(|d| d.id == doc.id) {
            *slot = Arc::clone(doc);
        }
        if self.current.as_ref().is_some_and(|c| c.id == doc.id) {
            self.current = Some(Arc::clone(doc));
        }
    }

    fn remove(&mut self, id: &DocumentId) {
        self.documents.retain(|d| &d.id != id);
        if self.current.as_ref().is_some_and(|c| &c.id == id) {
            self.current = None;
        }
    }

    fn remap(&mut self, remap: &IdRemap) {
        let repoint = |doc: &Arc<Document>| {
            let mut moved = Document::clone(doc);
            moved.id = remap.to.clone();
            moved.synced = true;
            Arc::new(moved)
        };
        for slot in &mut self.documents {
            if slot.id == remap.from {
                *slot = repoint(slot);
            }
        }
        if let Some(current) = &self.current
            && current.id == remap.from
        {
            self.current = Some(repoint(current));
        }
    }
}

/// Resets a view flag when the operation that set it ends.
struct FlagGuard<'a> {
    view: &'a Mutex<ViewState>,
    clear: fn(&mut ViewState),
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        (self.clear)(&mut self.view.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

// =============================================================================
// ACCESS LAYER
// =============================================================================

#[derive(Clone)]
pub struct DocumentAccess {
    state: AppState,
    view: Arc<Mutex<ViewState>>,
}

impl DocumentAccess {
    #[must_use]
    pub fn new(state: AppState) -> Self {
        let view = ViewState {
            documents: Vec::new(),
            current: None,
            is_loading: false,
            is_fetching: false,
            fetch_gate: MinInterval::new(state.timings.access.fetch_min_interval),
        };
        Self { state, view: Arc::new(Mutex::new(view)) }
    }

    fn view(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loading(&self) -> FlagGuard<'_> {
        self.view().is_loading = true;
        FlagGuard { view: &self.view, clear: |v| v.is_loading = false }
    }

    async fn remote<T, F>(&self, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        with_timeout(self.state.timings.access.remote_timeout, call).await
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    #[must_use]
    pub fn documents(&self) -> Vec<Arc<Document>> {
        self.view().documents.clone()
    }

    #[must_use]
    pub fn current_document(&self) -> Option<Arc<Document>> {
        self.view().current.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.view().is_loading
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.state.queue.is_syncing()
    }

    #[must_use]
    pub fn pending_changes(&self) -> usize {
        self.state.queue.pending_count()
    }

    /// Drop the current-document pointer.
    pub fn close_document(&self) {
        self.view().current = None;
    }

    // =========================================================================
    // CREATE
    // =========================================================================

    /// Create a document. Offline it gets a temporary id and is queued;
    /// online it is inserted remotely and a failure is reported, not hidden.
    pub async fn create_document(&self, name: &str) -> Option<Arc<Document>> {
        let name = match name.trim() {
            "" => DEFAULT_DOCUMENT_NAME,
            trimmed => trimmed,
        };
        let draft = Document::new_local(name, self.state.user_id);

        let doc = if self.is_online() {
            match self.remote(self.state.remote.insert_document(&draft)).await {
                Ok(created) => {
                    if let Err(e) = self.state.local.save_document(&created).await {
                        warn!(document_id = %created.id, error = %e, "create: failed to cache new document locally");
                    }
                    created
                }
                Err(e) => {
                    self.state.notifier.error_from("create", "Could not create document", &e);
                    return None;
                }
            }
        } else {
            if let Err(e) = self.state.local.save_document(&draft).await {
                self.state.notifier.error_from("create", "Could not save document", &e);
                return None;
            }
            if let Err(e) = self.state.queue.add_to_sync_queue(MutationKind::Create, draft.clone()).await {
                warn!(document_id = %draft.id, error = %e, "create: failed to queue offline document");
            }
            draft
        };

        info!(document_id = %doc.id, name = %doc.name, synced = doc.synced, "document created");
        let doc = Arc::new(doc);
        self.view().documents.insert(0, Arc::clone(&doc));
        Some(doc)
    }

    // =========================================================================
    // UPDATE
    // =========================================================================

    /// Apply a sparse update. The local copy is written first; the remote
    /// write follows when the document is known to the server and we are online.
    pub async fn update_document(&self, id: &DocumentId, patch: DocumentPatch) -> bool {
        if patch.is_empty() {
            return true;
        }
        let Some((existing, mut merged)) = self.write_update(id, &patch).await else {
            return false;
        };
        let id = merged.id.clone();

        let content_only = patch.is_content_only();
        match Route::select(self.is_online(), existing.sync_state()) {
            Route::Local => {
                if existing.sync_state() != SyncState::LocalOnly {
                    self.enqueue(MutationKind::Update, &merged).await;
                }
                self.show_update(merged, content_only);
                true
            }
            Route::Remote => {
                let pushed = if existing.sync_state() == SyncState::Synced {
                    self.remote(self.state.remote.update_document(&id, &patch)).await
                } else {
                    self.remote(self.state.remote.upsert_document(&merged)).await
                };
                match pushed {
                    Ok(_) => {
                        match self.state.local.mark_synced(&id, merged.updated_at).await {
                            Ok(marked) => merged.synced = marked,
                            Err(e) => warn!(document_id = %id, error = %e, "update: failed to mark synced"),
                        }
                        self.show_update(merged, content_only);
                        true
                    }
                    Err(e) if e.retryable() => {
                        debug!(document_id = %id, error = %e, "update: remote unavailable, queued");
                        self.enqueue(MutationKind::Update, &merged).await;
                        self.state.notifier.info("update", "Saved locally; changes will sync when the connection returns");
                        self.show_update(merged, content_only);
                        true
                    }
                    Err(e) => {
                        self.state.notifier.error_from("update", "Server rejected changes", &e);
                        self.show_update(merged, content_only);
                        false
                    }
                }
            }
        }
    }

    /// Write the merged update locally and return `(before, after)`.
    ///
    /// A temporary id whose create lands mid-write has its row moved to the
    /// server id; the write then finds no row and is redone there, so no
    /// stray copy is left under the temporary id.
    async fn write_update(&self, id: &DocumentId, patch: &DocumentPatch) -> Option<(Document, Document)> {
        let mut target = id.clone();
        loop {
            let written = match self.state.local.get_document(&target).await {
                Ok(Some(existing)) if !existing.deleted => {
                    let mut merged = existing.clone();
                    merged.apply_patch(patch);
                    merged.synced = false;
                    self.state.local.overwrite_document(&merged).await.map(|saved| saved.then_some((existing, merged)))
                }
                Ok(_) => Ok(None),
                Err(e) => Err(e),
            };
            match written {
                Ok(Some(pair)) => return Some(pair),
                Ok(None) => match self.state.queue.migrated_id(&target) {
                    Some(to) => {
                        debug!(from = %target, %to, "update: document migrated mid-write, retrying");
                        target = to;
                    }
                    None => {
                        self.state.notifier.error("update", "Document not found");
                        return None;
                    }
                },
                Err(e) => {
                    self.state.notifier.error_from("update", "Could not save changes", &e);
                    return None;
                }
            }
        }
    }

    pub async fn set_favorite(&self, id: &DocumentId, favorite: bool) -> bool {
        self.update_document(id, DocumentPatch { is_favorite: Some(favorite), ..DocumentPatch::default() }).await
    }

    pub async fn set_public(&self, id: &DocumentId, public: bool) -> bool {
        self.update_document(id, DocumentPatch { is_public: Some(public), ..DocumentPatch::default() }).await
    }

    /// Content-only updates keep the existing `Arc` so observers see no change.
    fn show_update(&self, doc: Document, content_only: bool) {
        if content_only {
            return;
        }
        self.view().replace(&Arc::new(doc));
    }

    // =========================================================================
    // RENAME
    // =========================================================================

    /// Rename a document. Tries the server first and degrades to a local,
    /// unsynced rename on any remote failure.
    pub async fn rename_document(&self, id: &DocumentId, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            self.state.notifier.error("rename", "Document name cannot be empty");
            return false;
        }
        let Some(existing) = self.cached("rename", id).await else {
            return false;
        };
        let patch = DocumentPatch::rename(name);
        let mut renamed = existing.clone();
        renamed.apply_patch(&patch);

        let route = Route::select(self.is_online(), existing.sync_state());
        if route == Route::Remote {
            match self.remote(self.state.remote.update_document(id, &patch)).await {
                Ok(_) if existing.synced => {
                    renamed.synced = true;
                    return self.store_rename(renamed, false).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(document_id = %id, error = %e, "rename: remote failed, renaming locally");
                    self.state.notifier.info("rename", "Renamed locally; the new name will sync later");
                }
            }
        }

        renamed.synced = false;
        let enqueue = existing.sync_state() != SyncState::LocalOnly;
        self.store_rename(renamed, enqueue).await
    }

    async fn store_rename(&self, doc: Document, enqueue: bool) -> bool {
        if let Err(e) = self.state.local.save_document(&doc).await {
            self.state.notifier.error_from("rename", "Could not save new name", &e);
            return false;
        }
        if enqueue {
            self.enqueue(MutationKind::Update, &doc).await;
        }
        info!(document_id = %doc.id, name = %doc.name, synced = doc.synced, "document renamed");
        self.view().replace(&Arc::new(doc));
        true
    }

    // =========================================================================
    // DELETE
    // =========================================================================

    /// Delete a document. Temporary documents vanish locally; known ones are
    /// deleted remotely when online, or tombstoned and queued otherwise.
    pub async fn delete_document(&self, id: &DocumentId) -> bool {
        if id.is_temporary() {
            return self.delete_local(id).await;
        }

        if self.is_online() {
            match self.remote(self.state.remote.delete_document(id)).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => return self.delete_local(id).await,
                Err(e) if e.retryable() => {
                    debug!(document_id = %id, error = %e, "delete: remote unavailable, tombstoning");
                    self.state.notifier.info("delete", "Deleted locally; the server will be updated later");
                }
                Err(e) => {
                    self.state.notifier.error_from("delete", "Could not delete document", &e);
                    return false;
                }
            }
        }

        let known = match self.state.local.get_document(id).await {
            Ok(Some(doc)) => Some(doc),
            Ok(None) => self.view().documents.iter().find(|d| &d.id == id).map(|d| Document::clone(d)),
            Err(e) => {
                self.state.notifier.error_from("delete", "Could not delete document", &e);
                return false;
            }
        };
        let Some(mut tombstone) = known else {
            self.state.notifier.error("delete", "Document not found");
            return false;
        };
        tombstone.deleted = true;
        tombstone.synced = false;
        if let Err(e) = self.state.local.save_document(&tombstone).await {
            self.state.notifier.error_from("delete", "Could not delete document", &e);
            return false;
        }
        self.enqueue(MutationKind::Delete, &tombstone).await;
        info!(document_id = %id, "document tombstoned");
        self.view().remove(id);
        true
    }

    async fn delete_local(&self, id: &DocumentId) -> bool {
        if let Err(e) = self.state.local.delete_document(id).await {
            self.state.notifier.error_from("delete", "Could not delete document", &e);
            return false;
        }
        if let Err(e) = self.state.queue.discard_for(id).await {
            warn!(document_id = %id, error = %e, "delete: failed to discard queued changes");
        }
        info!(document_id = %id, "document deleted");
        self.view().remove(id);
        true
    }

    // =========================================================================
    // LOAD
    // =========================================================================

    /// Open a document and make it current. A newer unsynced local copy wins
    /// over the server row; a malformed payload aborts the load.
    pub async fn load_document(&self, id: &DocumentId) -> Option<Arc<Document>> {
        let _loading = self.loading();

        let cached = match self.state.local.get_document(id).await {
            Ok(doc) => doc.filter(|d| !d.deleted),
            Err(e) => {
                warn!(document_id = %id, error = %e, "load: local store unavailable");
                None
            }
        };

        let chosen = if !self.is_online() || id.is_temporary() {
            cached
        } else {
            match self.remote(self.state.remote.fetch_document(id)).await {
                Ok(Some(server)) => Some(self.reconcile(server, cached).await),
                Ok(None) => cached.filter(|d| !d.synced),
                Err(e) => {
                    if cached.is_some() {
                        debug!(document_id = %id, error = %e, "load: remote failed, using cached copy");
                    } else {
                        self.state.notifier.error_from("load", "Could not load document", &e);
                        return None;
                    }
                    cached
                }
            }
        };

        let Some(doc) = chosen else {
            self.state.notifier.error("load", "Document not found");
            return None;
        };

        if let Err(e) = parse_records(&doc.data) {
            error!(document_id = %id, error = %e, "load: malformed document data, aborting");
            self.state.notifier.error_from("load", "Document data is corrupt", &e);
            return None;
        }

        let doc = Arc::new(doc);
        self.view().current = Some(Arc::clone(&doc));
        Some(doc)
    }

    /// Last write wins by `updated_at`; only an unsynced local copy competes.
    async fn reconcile(&self, server: Document, cached: Option<Document>) -> Document {
        if let Some(local) = cached
            && !local.synced
            && local.updated_at > server.updated_at
        {
            debug!(document_id = %local.id, "load: keeping newer local copy");
            return local;
        }
        if let Err(e) = self.state.local.save_document(&server).await {
            warn!(document_id = %server.id, error = %e, "load: failed to cache server copy");
        }
        server
    }

    // =========================================================================
    // FETCH
    // =========================================================================

    /// Refresh the document list. Throttled, never overlapping, and falls
    /// back to the local list when the server cannot be reached.
    pub async fn fetch_documents(&self) {
        {
            let mut view = self.view();
            if view.is_fetching || !view.fetch_gate.try_acquire_at(Instant::now()) {
                debug!("fetch: throttled");
                return;
            }
            view.is_fetching = true;
        }
        let _fetching = FlagGuard { view: &self.view, clear: |v| v.is_fetching = false };
        let _loading = self.loading();

        let user_id = self.state.user_id;
        let local = match self.state.local.get_all_documents(user_id).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, "fetch: local store unavailable");
                Vec::new()
            }
        };

        let list = if self.is_online() {
            match self.remote(self.state.remote.list_documents(user_id)).await {
                Ok(server) => {
                    let unsynced = match self.state.local.get_unsynced_documents(user_id).await {
                        Ok(docs) => docs,
                        Err(e) => {
                            warn!(error = %e, "fetch: could not read unsynced documents");
                            Vec::new()
                        }
                    };
                    let merged = merge_document_lists(server, unsynced);
                    self.cache_synced(&merged).await;
                    merged
                }
                Err(e) => {
                    if local.is_empty() {
                        self.state.notifier.error_from("fetch", "Could not load documents", &e);
                    } else {
                        debug!(error = %e, "fetch: remote failed, showing local list");
                    }
                    local
                }
            }
        } else {
            local
        };

        debug!(count = list.len(), "fetch: document list refreshed");
        self.view().documents = list.into_iter().map(Arc::new).collect();
    }

    async fn cache_synced(&self, docs: &[Document]) {
        for doc in docs.iter().filter(|d| d.synced) {
            if let Err(e) = self.state.local.save_document(doc).await {
                warn!(document_id = %doc.id, error = %e, "fetch: failed to cache document");
            }
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Local copy of a live document, with a notice when it is missing.
    async fn cached(&self, action: &'static str, id: &DocumentId) -> Option<Document> {
        match self.state.local.get_document(id).await {
            Ok(Some(doc)) if !doc.deleted => Some(doc),
            Ok(_) => {
                self.state.notifier.error(action, "Document not found");
                None
            }
            Err(e) => {
                self.state.notifier.error_from(action, "Could not read document", &e);
                None
            }
        }
    }

    async fn enqueue(&self, kind: MutationKind, doc: &Document) {
        if let Err(e) = self.state.queue.add_to_sync_queue(kind, doc.clone()).await {
            warn!(document_id = %doc.id, kind = kind.as_str(), error = %e, "failed to persist queued change");
        }
    }

    /// Repoint view entries from a temporary id to its server id.
    pub fn apply_remap(&self, remap: &IdRemap) {
        self.view().remap(remap);
    }

    #[must_use]
    pub fn subscribe_remaps(&self) -> broadcast::Receiver<IdRemap> {
        self.state.queue.subscribe_remaps()
    }

    /// Follow id migrations published by the sync queue.
    #[must_use]
    pub fn spawn_remap_listener(&self) -> JoinHandle<()> {
        let access = self.clone();
        let mut remaps = self.subscribe_remaps();
        tokio::spawn(async move {
            loop {
                match remaps.recv().await {
                    Ok(remap) => access.apply_remap(&remap),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "remap listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Merge the server list with local unsynced documents.
///
/// Tombstoned ids are dropped, local-only documents are kept, and for a
/// document both sides have, a newer unsynced local copy wins. The result is
/// ordered most recently updated first.
#[must_use]
pub fn merge_document_lists(server: Vec<Document>, unsynced: Vec<Document>) -> Vec<Document> {
    let tombstones: HashSet<DocumentId> = unsynced.iter().filter(|d| d.deleted).map(|d| d.id.clone()).collect();
    let mut local: HashMap<DocumentId, Document> =
        unsynced.into_iter().filter(|d| !d.deleted).map(|d| (d.id.clone(), d)).collect();

    let mut merged: Vec<Document> = server
        .into_iter()
        .filter(|d| !tombstones.contains(&d.id))
        .map(|remote| match local.remove(&remote.id) {
            Some(mine) if mine.updated_at > remote.updated_at => mine,
            _ => remote,
        })
        .collect();
    merged.extend(local.into_values());
    merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    merged
}

#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
