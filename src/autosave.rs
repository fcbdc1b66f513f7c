//! Debounced persistence of the open canvas.
//!
//! DESIGN
//! ======
//! A task listens to user-originated canvas changes and restarts a trailing
//! debounce on each one. When the debounce fires, the whole record set is
//! written through [`DocumentAccess::update_document`] as a content patch,
//! so it follows the same local-first route as any other edit.
//!
//! Remote-applied changes do not arm the timer; the peer that made them
//! saves them. When the sync queue migrates a temporary id, the task keeps
//! saving under the server id.
//!
//! Shutting down cancels a pending timer without writing. Call
//! [`Autosaver::flush`] first to keep the last edits.

use std::time::Instant;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::DocumentAccess;
use crate::canvas::{Canvas, CanvasChange, ChangeSource};
use crate::config::AutosaveConfig;
use crate::debounce::{Debounce, sleep_until};
use crate::model::{DocumentId, DocumentPatch};
use crate::sync::IdRemap;

pub struct Autosaver {
    document_id: DocumentId,
    flush: mpsc::Sender<oneshot::Sender<bool>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Autosaver {
    #[must_use]
    pub fn spawn(access: DocumentAccess, canvas: Canvas, document_id: DocumentId, config: AutosaveConfig) -> Self {
        let (flush, flush_rx) = mpsc::channel(4);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let remaps = access.subscribe_remaps();
        let changes = canvas.subscribe();
        let worker = AutosaveWorker {
            access,
            canvas,
            document_id: document_id.clone(),
            debounce: Debounce::new(config.debounce),
        };
        let task = tokio::spawn(worker.run(flush_rx, shutdown_rx, changes, remaps));
        Self { document_id, flush, shutdown, task }
    }

    /// Write pending changes now. Returns `true` if nothing was pending or
    /// the write succeeded.
    pub async fn flush(&self) -> bool {
        let (reply, done) = oneshot::channel();
        if self.flush.send(reply).await.is_err() {
            warn!(document_id = %self.document_id, "autosave: flush after task ended");
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Stop listening. A pending save is cancelled, not written.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(document_id = %self.document_id, error = %e, "autosave: task ended abnormally");
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        debug!("autosave: handle dropped");
    }
}

struct AutosaveWorker {
    access: DocumentAccess,
    canvas: Canvas,
    document_id: DocumentId,
    debounce: Debounce,
}

impl AutosaveWorker {
    async fn run(
        mut self,
        mut flush: mpsc::Receiver<oneshot::Sender<bool>>,
        mut shutdown: watch::Receiver<bool>,
        mut changes: broadcast::Receiver<CanvasChange>,
        mut remaps: broadcast::Receiver<IdRemap>,
    ) {
        loop {
            tokio::select! {
                () = shutdown_requested(&mut shutdown) => break,
                change = changes.recv() => match change {
                    Ok(change) => self.note(&change),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(document_id = %self.document_id, skipped, "autosave: changes lagged");
                        self.debounce.touch_at(Instant::now());
                    }
                    Err(RecvError::Closed) => break,
                },
                remap = remaps.recv() => match remap {
                    Ok(remap) if remap.from == self.document_id => {
                        info!(from = %remap.from, to = %remap.to, "autosave: following id migration");
                        self.document_id = remap.to;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(document_id = %self.document_id, skipped, "autosave: remaps lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
                request = flush.recv() => {
                    let Some(reply) = request else {
                        break;
                    };
                    self.absorb_queued(&mut changes);
                    let saved = if self.debounce.is_pending() {
                        self.debounce.cancel();
                        self.save().await
                    } else {
                        true
                    };
                    if reply.send(saved).is_err() {
                        debug!(document_id = %self.document_id, "autosave: flush caller went away");
                    }
                }
                () = sleep_until(self.debounce.deadline()) => {
                    if self.debounce.fire_at(Instant::now()) {
                        self.save().await;
                    }
                }
            }
        }
        if self.debounce.is_pending() {
            info!(document_id = %self.document_id, "autosave: pending save cancelled");
        }
    }

    fn note(&mut self, change: &CanvasChange) {
        if change.source == ChangeSource::User {
            self.debounce.touch_at(Instant::now());
        }
    }

    /// Take in changes already sent but not yet received, so a flush sees
    /// every edit made before it was requested.
    fn absorb_queued(&mut self, changes: &mut broadcast::Receiver<CanvasChange>) {
        loop {
            match changes.try_recv() {
                Ok(change) => self.note(&change),
                Err(TryRecvError::Lagged(_)) => self.debounce.touch_at(Instant::now()),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    async fn save(&self) -> bool {
        let patch = DocumentPatch::content(self.canvas.snapshot());
        let saved = self.access.update_document(&self.document_id, patch).await;
        if saved {
            debug!(document_id = %self.document_id, records = self.canvas.len(), "autosave: saved");
        } else {
            warn!(document_id = %self.document_id, "autosave: save failed");
        }
        saved
    }
}

#[cfg(test)]
#[path = "autosave_test.rs"]
mod tests;
