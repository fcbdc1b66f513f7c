//! Sync queue — eventual delivery of mutations made offline or after a failed remote write.
//!
//! DESIGN
//! ======
//! One `SyncQueue` exists per process, constructed at session start and
//! handed to every component through `AppState`. The in-memory list is the
//! working copy; every change is persisted to the local store before anything
//! else happens, so a restart never loses pending work.
//!
//! A drain takes the whole current list, replays it serially against the
//! remote store, and then writes back `failed ++ enqueued-during-drain`.
//! Only one drain runs at a time (`syncing` flag); concurrent triggers
//! return immediately with a skipped report.
//!
//! TEMPORARY IDS
//! =============
//! A document created offline is queued under its temporary id. When its
//! create succeeds the local record is migrated to the server id in one
//! transaction, the remap is broadcast, and every later queue entry for the
//! temporary id is rewritten. An edit saved under the temporary id while the
//! create was in flight is carried over unsynced and replayed as an update.
//!
//! ORDERING
//! ========
//! Entries for one document replay in the order they were queued. Once an
//! entry fails, later entries for the same document are held back without
//! being attempted, so neither an update can overtake its create nor a delete
//! overtake an earlier update. A push whose local copy is gone or tombstoned
//! sends nothing; the delete that follows it carries the intent.
//!
//! ERROR HANDLING
//! ==============
//! Failed items stay queued in their original relative order; no backoff is
//! applied here. The next online/visibility/explicit trigger retries them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connectivity::{Connectivity, ConnectivityEvent};
use crate::error::ErrorCode;
use crate::model::{Document, DocumentId, MutationKind, PendingMutation};
use crate::remote::{RemoteError, RemoteStore, with_timeout};
use crate::store::{LocalStore, StoreError};

const REMAP_CAPACITY: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("held back behind an earlier failed entry for {0}")]
    Blocked(DocumentId),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_code(),
            Self::Remote(e) => e.error_code(),
            Self::Blocked(_) => "E_SYNC_BLOCKED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::Remote(e) => e.retryable(),
            Self::Blocked(_) => true,
        }
    }
}

/// A temporary id that was replaced by its server-issued id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRemap {
    pub from: DocumentId,
    pub to: DocumentId,
}

/// What replaying one entry did beyond reaching the server.
enum Replayed {
    Done,
    Migrated {
        remap: IdRemap,
        /// Newer local copy saved while the create was in flight.
        follow_up: Option<Document>,
    },
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// True if the pass did not run (already draining, or offline).
    pub skipped: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub remapped: Vec<IdRemap>,
    /// Queue length after the pass.
    pub remaining: usize,
}

impl SyncReport {
    fn skipped(remaining: usize) -> Self {
        Self { skipped: true, remaining, ..Self::default() }
    }
}

struct Inner {
    local: LocalStore,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
    remote_timeout: Duration,
    items: Mutex<Vec<PendingMutation>>,
    /// Every temporary id migrated this session, to its server id.
    migrated: Mutex<HashMap<DocumentId, DocumentId>>,
    /// Serializes queue writes so a stale snapshot never overwrites a newer one.
    persist: tokio::sync::Mutex<()>,
    syncing: AtomicBool,
    remaps: broadcast::Sender<IdRemap>,
}

/// Process-wide queue handle. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<Inner>,
}

/// Clears the `syncing` flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// QUEUE
// =============================================================================

impl SyncQueue {
    /// Build the queue, restoring any entries persisted by a previous run.
    ///
    /// # Errors
    ///
    /// Returns a store error if the persisted queue cannot be read.
    pub async fn restore(
        local: LocalStore,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
        remote_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let items = local.load_queue().await?;
        if !items.is_empty() {
            info!(pending = items.len(), "sync queue restored");
        }
        let (remaps, _) = broadcast::channel(REMAP_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                local,
                remote,
                connectivity,
                remote_timeout,
                items: Mutex::new(items),
                migrated: Mutex::new(HashMap::new()),
                persist: tokio::sync::Mutex::new(()),
                syncing: AtomicBool::new(false),
                remaps,
            }),
        })
    }

    /// Append a mutation and persist the queue. Starts a background drain if online.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue could not be persisted; the entry
    /// is still held in memory and will be written with the next change.
    pub async fn add_to_sync_queue(&self, kind: MutationKind, document: Document) -> Result<(), StoreError> {
        let document_id = document.id.clone();
        self.lock_items().push(PendingMutation::new(kind, document));
        self.persist().await?;
        info!(%document_id, kind = kind.as_str(), pending = self.pending_count(), "sync queue: enqueued");

        if self.inner.connectivity.is_online() {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.sync_pending_changes().await;
            });
        }
        Ok(())
    }

    /// Replay every queued mutation against the remote store, serially.
    pub async fn sync_pending_changes(&self) -> SyncReport {
        if self.inner.syncing.swap(true, Ordering::AcqRel) {
            debug!("sync queue: drain already in progress");
            return SyncReport::skipped(self.pending_count());
        }
        let _guard = DrainGuard(&self.inner.syncing);

        if !self.inner.connectivity.is_online() {
            debug!("sync queue: offline, drain skipped");
            return SyncReport::skipped(self.pending_count());
        }

        let mut batch: VecDeque<PendingMutation> = std::mem::take(&mut *self.lock_items()).into();
        if batch.is_empty() {
            return SyncReport::default();
        }

        info!(pending = batch.len(), "sync queue: drain started");
        let mut report = SyncReport { attempted: batch.len(), ..SyncReport::default() };
        let mut remaps: HashMap<DocumentId, DocumentId> = HashMap::new();
        let mut blocked: HashSet<DocumentId> = HashSet::new();
        let mut failed: Vec<PendingMutation> = Vec::new();

        while let Some(mut item) = batch.pop_front() {
            remap_item(&mut item, &remaps);
            let document_id = item.document_id().clone();

            let outcome = if blocked.contains(&document_id) {
                Err(SyncError::Blocked(document_id.clone()))
            } else {
                self.process(&item).await
            };

            match outcome {
                Ok(Replayed::Migrated { remap, follow_up }) => {
                    report.succeeded += 1;
                    if let Some(doc) = follow_up {
                        report.attempted += 1;
                        batch.push_back(PendingMutation::new(MutationKind::Update, doc));
                    }
                    remaps.insert(remap.from.clone(), remap.to.clone());
                    report.remapped.push(remap);
                }
                Ok(Replayed::Done) => report.succeeded += 1,
                Err(e) => {
                    warn!(%document_id, kind = item.kind.as_str(), code = e.error_code(), error = %e, "sync queue: item failed");
                    blocked.insert(document_id);
                    report.failed += 1;
                    failed.push(item);
                }
            }
        }

        {
            let mut items = self.lock_items();
            let mut arrived = std::mem::take(&mut *items);
            for item in &mut arrived {
                remap_item(item, &remaps);
            }
            failed.append(&mut arrived);
            *items = failed;
            report.remaining = items.len();
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "sync queue: failed to persist after drain");
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            remaining = report.remaining,
            "sync queue: drain finished"
        );
        report
    }

    /// Enqueue every unsynced local document of `user_id` not already queued, then drain.
    ///
    /// # Errors
    ///
    /// Returns a store error if the local scan or the queue write fails.
    pub async fn force_sync_all(&self, user_id: Uuid) -> Result<SyncReport, StoreError> {
        let unsynced = self.inner.local.get_unsynced_documents(user_id).await?;
        let mut added = 0usize;
        {
            let mut items = self.lock_items();
            let queued: HashSet<DocumentId> = items.iter().map(|m| m.document_id().clone()).collect();
            for doc in unsynced {
                if queued.contains(&doc.id) {
                    continue;
                }
                let kind = if doc.deleted {
                    MutationKind::Delete
                } else if doc.id.is_temporary() {
                    MutationKind::Create
                } else {
                    MutationKind::Update
                };
                items.push(PendingMutation::new(kind, doc));
                added += 1;
            }
        }
        self.persist().await?;
        info!(%user_id, added, "sync queue: force sync");
        Ok(self.sync_pending_changes().await)
    }

    /// Drop every queued entry for `id`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue could not be persisted.
    pub async fn discard_for(&self, id: &DocumentId) -> Result<usize, StoreError> {
        let removed = {
            let mut items = self.lock_items();
            let before = items.len();
            items.retain(|m| m.document_id() != id);
            before - items.len()
        };
        if removed > 0 {
            self.persist().await?;
            debug!(document_id = %id, removed, "sync queue: discarded entries");
        }
        Ok(removed)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_items().len()
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Copy of the queued entries in FIFO order.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingMutation> {
        self.lock_items().clone()
    }

    #[must_use]
    pub fn subscribe_remaps(&self) -> broadcast::Receiver<IdRemap> {
        self.inner.remaps.subscribe()
    }

    /// Server id a temporary id was migrated to, if its create has succeeded.
    ///
    /// Recorded before the local record moves, so a writer that finds the
    /// temporary row gone can always learn where it went.
    #[must_use]
    pub fn migrated_id(&self, id: &DocumentId) -> Option<DocumentId> {
        if !id.is_temporary() {
            return None;
        }
        self.inner.migrated.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Drain whenever connectivity returns or the host becomes visible again.
    #[must_use]
    pub fn spawn_sync_triggers(&self) -> JoinHandle<()> {
        let queue = self.clone();
        let mut events = self.inner.connectivity.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectivityEvent::Online | ConnectivityEvent::Visible) => {
                        if queue.pending_count() > 0 {
                            queue.sync_pending_changes().await;
                        }
                    }
                    Ok(ConnectivityEvent::Offline) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "sync triggers lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn lock_items(&self) -> std::sync::MutexGuard<'_, Vec<PendingMutation>> {
        self.inner.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _write = self.inner.persist.lock().await;
        let snapshot = self.pending();
        self.inner.local.write_queue(&snapshot).await
    }

    async fn process(&self, item: &PendingMutation) -> Result<Replayed, SyncError> {
        match item.kind {
            MutationKind::Create | MutationKind::Update => self.push(item).await,
            MutationKind::Delete => self.push_delete(item).await.map(|()| Replayed::Done),
        }
    }

    /// Send the freshest known copy of a document to the remote store.
    async fn push(&self, item: &PendingMutation) -> Result<Replayed, SyncError> {
        let local = &self.inner.local;
        let queued = &item.document;
        let Some(current) = local.get_document(&queued.id).await? else {
            debug!(document_id = %queued.id, "sync queue: local copy gone, nothing to push");
            return Ok(Replayed::Done);
        };
        if current.deleted {
            debug!(document_id = %queued.id, "sync queue: tombstoned, push skipped");
            return Ok(Replayed::Done);
        }
        let payload = if current.updated_at >= queued.updated_at { current } else { queued.clone() };

        if payload.id.is_temporary() {
            return self.push_create(payload).await;
        }

        with_timeout(self.inner.remote_timeout, self.inner.remote.upsert_document(&payload)).await?;
        local.mark_synced(&payload.id, payload.updated_at).await?;
        debug!(document_id = %payload.id, "sync queue: pushed document");
        Ok(Replayed::Done)
    }

    async fn push_create(&self, payload: Document) -> Result<Replayed, SyncError> {
        let local = &self.inner.local;
        let from = payload.id.clone();
        let created = with_timeout(self.inner.remote_timeout, self.inner.remote.insert_document(&payload)).await?;

        self.inner.migrated.lock().unwrap_or_else(PoisonError::into_inner).insert(from.clone(), created.id.clone());
        let Some(moved) = local.migrate_document_id(&from, &created.id, payload.updated_at).await? else {
            // Deleted locally while the insert was in flight.
            info!(document_id = %from, remote_id = %created.id, "sync queue: create superseded by delete");
            with_timeout(self.inner.remote_timeout, self.inner.remote.delete_document(&created.id)).await?;
            return Ok(Replayed::Done);
        };

        let remap = IdRemap { from, to: created.id };
        info!(from = %remap.from, to = %remap.to, synced = moved.synced, "sync queue: temporary id migrated");
        if self.inner.remaps.send(remap.clone()).is_err() {
            debug!("sync queue: no remap subscribers");
        }
        let follow_up = (!moved.synced).then_some(moved);
        Ok(Replayed::Migrated { remap, follow_up })
    }

    async fn push_delete(&self, item: &PendingMutation) -> Result<(), SyncError> {
        let id = item.document_id();
        if !id.is_temporary() {
            match with_timeout(self.inner.remote_timeout, self.inner.remote.delete_document(id)).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(doc) = self.inner.local.get_document(id).await?
            && doc.deleted
        {
            self.inner.local.delete_document(id).await?;
        }
        debug!(document_id = %id, "sync queue: delete confirmed");
        Ok(())
    }
}

fn remap_item(item: &mut PendingMutation, remaps: &HashMap<DocumentId, DocumentId>) {
    if let Some(to) = remaps.get(&item.document.id) {
        item.document.id = to.clone();
    }
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
