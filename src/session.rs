//! Session assembly.
//!
//! DESIGN
//! ======
//! A session is one signed-in user working against one local database. It
//! owns the shared [`AppState`], the [`DocumentAccess`] facade and the
//! background tasks that keep them current: the sync triggers (drain on
//! reconnect and on visibility) and the id-remap listener.
//!
//! Opening a document loads its records into a fresh [`Canvas`] and attaches
//! an [`Autosaver`] and, when a relay transport is configured and the id is
//! server-issued, a [`RealtimeRelay`]. Nobody else can know a temporary id,
//! so local-only documents are edited unrelayed.
//!
//! SYSTEM CONTEXT
//! ==============
//! Without a remote config the session runs fully offline against the
//! [`Disconnected`] stand-in. With one, connectivity starts from a
//! reachability check of the remote store.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::DocumentAccess;
use crate::autosave::Autosaver;
use crate::canvas::Canvas;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::db::init_pool;
use crate::error::ErrorCode;
use crate::model::{Document, DocumentId};
use crate::relay::{ConnectionStatus, RealtimeRelay, RelayIdentity, RelayTransport, WsTransport};
use crate::remote::rest::RestRemoteStore;
use crate::remote::{Disconnected, RemoteError, RemoteStore};
use crate::state::{AppState, Timings};
use crate::store::{LocalStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("local database unavailable: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_SESSION_DATABASE",
            Self::Store(e) => e.error_code(),
            Self::Remote(e) => e.error_code(),
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct Session {
    session_id: Uuid,
    state: AppState,
    access: DocumentAccess,
    transport: Option<Arc<dyn RelayTransport>>,
    background: Vec<JoinHandle<()>>,
}

impl Session {
    /// Open the local database, connect the remote store if configured and
    /// start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the database cannot be opened or migrated,
    /// the persisted queue cannot be read, or the HTTP client cannot be built.
    pub async fn start(config: &SyncConfig, user_id: Uuid) -> Result<Self, SessionError> {
        let local = LocalStore::new(init_pool(&config.db_path).await?);
        let timings = Timings { access: config.access, relay: config.relay, autosave: config.autosave };

        let (remote, transport, connectivity): (Arc<dyn RemoteStore>, Option<Arc<dyn RelayTransport>>, _) =
            match &config.remote {
                Some(remote_config) => {
                    let remote: Arc<dyn RemoteStore> =
                        Arc::new(RestRemoteStore::new(remote_config, config.access.remote_timeout)?);
                    let transport: Arc<dyn RelayTransport> =
                        Arc::new(WsTransport::new(remote_config, Arc::clone(&remote)));
                    let connectivity = Connectivity::new(false);
                    connectivity.check_reachability(remote.as_ref(), config.access.remote_timeout).await;
                    (remote, Some(transport), connectivity)
                }
                None => {
                    info!("session: no remote configured, running offline");
                    (Arc::new(Disconnected), None, Connectivity::new(false))
                }
            };

        let state = AppState::new(user_id, local, remote, connectivity, timings).await?;
        Ok(Self::from_state(state, transport))
    }

    /// Build a session over an existing state and start its background tasks.
    #[must_use]
    pub fn from_state(state: AppState, transport: Option<Arc<dyn RelayTransport>>) -> Self {
        let access = DocumentAccess::new(state.clone());
        let background = vec![state.queue.spawn_sync_triggers(), access.spawn_remap_listener()];
        let session_id = Uuid::new_v4();
        info!(%session_id, user_id = %state.user_id, online = state.is_online(), "session: started");
        Self { session_id, state, access, transport, background }
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    #[must_use]
    pub fn access(&self) -> &DocumentAccess {
        &self.access
    }

    /// Load a document and attach autosave and, where possible, the relay.
    ///
    /// Returns `None` if the document cannot be loaded; the access layer has
    /// already notified the user then.
    pub async fn open_document(&self, id: &DocumentId) -> Option<OpenDocument> {
        let document = self.access.load_document(id).await?;
        let canvas = Canvas::new();
        if let Err(e) = canvas.load_snapshot(&document.data) {
            warn!(document_id = %document.id, error = %e, "session: canvas payload rejected");
            self.state.notifier.error_from("load", "Could not open document", &e);
            return None;
        }

        let relay = match &self.transport {
            Some(transport) if !document.id.is_temporary() => {
                let identity = RelayIdentity {
                    session_id: self.session_id,
                    user_id: self.state.user_id,
                    document_id: document.id.clone(),
                };
                Some(RealtimeRelay::spawn(Arc::clone(transport), canvas.clone(), identity, self.state.timings.relay))
            }
            _ => None,
        };
        let autosaver =
            Autosaver::spawn(self.access.clone(), canvas.clone(), document.id.clone(), self.state.timings.autosave);
        info!(document_id = %document.id, records = canvas.len(), relayed = relay.is_some(), "session: document opened");
        Some(OpenDocument { document, canvas, relay, autosaver })
    }

    /// Save pending edits, detach the document and clear the current selection.
    /// Returns whether the final save succeeded.
    pub async fn close_document(&self, open: OpenDocument) -> bool {
        let saved = open.close().await;
        self.access.close_document();
        saved
    }

    /// Stop the background tasks.
    pub fn shutdown(self) {
        for task in self.background {
            task.abort();
        }
        info!(session_id = %self.session_id, "session: stopped");
    }
}

// =============================================================================
// OPEN DOCUMENT
// =============================================================================

/// A document being edited: its record set plus the tasks persisting and
/// relaying it.
pub struct OpenDocument {
    pub document: Arc<Document>,
    pub canvas: Canvas,
    relay: Option<RealtimeRelay>,
    autosaver: Autosaver,
}

impl OpenDocument {
    /// `None` when the document is edited without a relay.
    #[must_use]
    pub fn relay_status(&self) -> Option<ConnectionStatus> {
        self.relay.as_ref().map(RealtimeRelay::status)
    }

    /// Write pending edits now.
    pub async fn save(&self) -> bool {
        self.autosaver.flush().await
    }

    async fn close(self) -> bool {
        let saved = self.autosaver.flush().await;
        self.autosaver.shutdown().await;
        if let Some(relay) = self.relay {
            relay.shutdown().await;
        }
        saved
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
