//! Realtime operation relay.
//!
//! DESIGN
//! ======
//! One relay task runs per open document. It owns a transport subscription
//! and a canvas change receiver and multiplexes them in a `select!` loop:
//!
//! - user-originated canvas changes are coalesced in an [`OutboundBatch`]
//!   and flushed as at most two operations per batch window
//! - inbound peer operations are filtered (own session, other document,
//!   malformed records) and applied to the canvas tagged as remote
//! - after an inbound apply, user changes are ignored for a short settle
//!   window so the apply is never re-broadcast as a local edit
//!
//! The relay is not the system of record. Durability comes from the save
//! path; a dropped connection only changes [`ConnectionStatus`].
//!
//! ERROR HANDLING
//! ==============
//! Subscribe failures and timeouts schedule a reconnect after
//! `attempt * reconnect_base`. A successful subscribe resets the counter.
//! Once the attempt cap is exceeded the status becomes `Offline` and the
//! task ends; local editing is unaffected.

pub mod batch;
pub mod hub;
pub mod transport;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use batch::OutboundBatch;
pub use hub::LoopbackHub;
pub use transport::{RelayTransport, Subscription};
pub use ws::WsTransport;

use crate::canvas::{Canvas, ChangeSource, is_valid_record};
use crate::config::RelayConfig;
use crate::debounce::sleep_until;
use crate::model::{DocumentId, now_ms};

// =============================================================================
// WIRE TYPES
// =============================================================================

/// A record-level delta. Not persisted beyond transit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    PutRecords {
        records: Vec<Value>,
        timestamp: i64,
    },
    RemoveRecords {
        #[serde(rename = "recordIds")]
        record_ids: Vec<String>,
        timestamp: i64,
    },
}

/// An operation addressed to one document, stamped with its origin session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub document_id: DocumentId,
    pub operation: Operation,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("relay subscribe timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay transport unavailable: {0}")]
    Unavailable(String),
}

impl crate::error::ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "E_RELAY_CONNECT",
            Self::Timeout(_) => "E_RELAY_TIMEOUT",
            Self::Unavailable(_) => "E_RELAY_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Reconnect attempts exhausted. Local editing continues unrelayed.
    Offline,
}

/// Who this relay speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayIdentity {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub document_id: DocumentId,
}

// =============================================================================
// INBOUND
// =============================================================================

/// Apply a peer message to the canvas. Returns the number of records changed.
///
/// Messages from this session (transport echo) or for another document are
/// ignored. Malformed records are dropped; the rest still apply.
pub fn apply_inbound(canvas: &Canvas, identity: &RelayIdentity, message: RelayMessage) -> usize {
    if message.session_id == identity.session_id {
        debug!(document_id = %identity.document_id, "relay: ignoring own echo");
        return 0;
    }
    if message.document_id != identity.document_id {
        debug!(expected = %identity.document_id, got = %message.document_id, "relay: ignoring other document");
        return 0;
    }
    match message.operation {
        Operation::PutRecords { records, .. } => {
            let total = records.len();
            let valid: Vec<Value> = records.into_iter().filter(is_valid_record).collect();
            if valid.len() < total {
                warn!(
                    document_id = %identity.document_id,
                    dropped = total - valid.len(),
                    "relay: dropping malformed inbound records"
                );
            }
            canvas.put_records(valid, ChangeSource::Remote)
        }
        Operation::RemoveRecords { record_ids, .. } => canvas.remove_records(&record_ids, ChangeSource::Remote),
    }
}

// =============================================================================
// RELAY TASK
// =============================================================================

/// Handle to a running relay. Dropping it stops the task.
pub struct RealtimeRelay {
    identity: RelayIdentity,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RealtimeRelay {
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn RelayTransport>,
        canvas: Canvas,
        identity: RelayIdentity,
        config: RelayConfig,
    ) -> Self {
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = RelayWorker {
            transport,
            canvas,
            identity: identity.clone(),
            config,
            status: status_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run());
        Self { identity, status, shutdown, task }
    }

    #[must_use]
    pub fn identity(&self) -> &RelayIdentity {
        &self.identity
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stop the task. A pending outbound batch is discarded.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "relay: task ended abnormally");
        }
    }
}

enum Outcome {
    Shutdown,
    Lost,
}

struct RelayWorker {
    transport: Arc<dyn RelayTransport>,
    canvas: Canvas,
    identity: RelayIdentity,
    config: RelayConfig,
    status: watch::Sender<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
}

/// Resolves once shutdown is requested or the handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        debug!("relay: handle dropped");
    }
}

impl RelayWorker {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    async fn run(mut self) {
        let document_id = self.identity.document_id.clone();
        let limit = self.config.subscribe_timeout;
        let mut attempt: u32 = 0;
        loop {
            self.set_status(ConnectionStatus::Connecting);
            let subscribed = tokio::select! {
                () = shutdown_requested(&mut self.shutdown) => break,
                result = tokio::time::timeout(limit, self.transport.subscribe(&document_id)) => {
                    result.unwrap_or(Err(RelayError::Timeout(limit)))
                }
            };
            match subscribed {
                Ok(subscription) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);
                    info!(%document_id, session_id = %self.identity.session_id, "relay: connected");
                    match self.pump(subscription).await {
                        Outcome::Shutdown => break,
                        Outcome::Lost => warn!(%document_id, "relay: connection lost"),
                    }
                }
                Err(e) => warn!(%document_id, error = %e, "relay: subscribe failed"),
            }

            self.set_status(ConnectionStatus::Disconnected);
            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                info!(%document_id, attempts = attempt - 1, "relay: giving up, collaboration offline");
                self.set_status(ConnectionStatus::Offline);
                return;
            }
            let delay = self.config.reconnect_delay(attempt);
            info!(%document_id, attempt, delay_ms = delay.as_millis(), "relay: reconnect scheduled");
            tokio::select! {
                () = shutdown_requested(&mut self.shutdown) => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
        debug!(%document_id, "relay: stopped");
    }

    async fn pump(&mut self, subscription: Subscription) -> Outcome {
        let Subscription { outbound, mut inbound } = subscription;
        let mut changes = self.canvas.subscribe();
        let mut batch = OutboundBatch::new();
        let mut flush_at: Option<Instant> = None;
        let mut settle_until: Option<Instant> = None;

        loop {
            tokio::select! {
                () = shutdown_requested(&mut self.shutdown) => return Outcome::Shutdown,
                change = changes.recv() => match change {
                    Ok(change) => {
                        if change.source != ChangeSource::User {
                            continue;
                        }
                        if settle_until.is_some_and(|until| Instant::now() < until) {
                            debug!(document_id = %self.identity.document_id, "relay: change inside settle window not broadcast");
                            continue;
                        }
                        batch.record(&change);
                        flush_at = Some(batch.deadline_at(
                            Instant::now(),
                            self.config.batch_window,
                            self.config.batch_max_wait,
                        ));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(document_id = %self.identity.document_id, skipped, "relay: canvas changes lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Outcome::Shutdown,
                },
                message = inbound.recv() => match message {
                    Some(message) => {
                        if apply_inbound(&self.canvas, &self.identity, message) > 0 {
                            settle_until = Some(Instant::now() + self.config.settle_delay);
                        }
                    }
                    None => return Outcome::Lost,
                },
                () = sleep_until(flush_at) => {
                    flush_at = None;
                    if !self.flush(&mut batch, &outbound).await {
                        return Outcome::Lost;
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: &mut OutboundBatch, outbound: &mpsc::Sender<RelayMessage>) -> bool {
        for operation in batch.flush(now_ms()) {
            let message = RelayMessage {
                session_id: self.identity.session_id,
                user_id: self.identity.user_id,
                document_id: self.identity.document_id.clone(),
                operation,
            };
            if outbound.send(message).await.is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
