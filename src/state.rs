//! Shared session context.
//!
//! DESIGN
//! ======
//! `AppState` is built once per session and cloned into every component
//! that needs storage, the remote store, connectivity, notices, or the sync
//! queue. All fields are cheap handles over shared state, so the single
//! `SyncQueue` is reachable from anywhere without a module-level global and
//! tests can assemble a state around in-memory doubles.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::{AccessConfig, AutosaveConfig, RelayConfig};
use crate::connectivity::Connectivity;
use crate::notice::Notifier;
use crate::remote::RemoteStore;
use crate::store::{LocalStore, StoreError};
use crate::sync::SyncQueue;

// =============================================================================
// APP STATE
// =============================================================================

/// Tuning for the components built on top of the state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub access: AccessConfig,
    pub relay: RelayConfig,
    pub autosave: AutosaveConfig,
}

#[derive(Clone)]
pub struct AppState {
    /// Owner of every document this session lists or creates.
    pub user_id: Uuid,
    pub local: LocalStore,
    pub remote: Arc<dyn RemoteStore>,
    pub connectivity: Connectivity,
    pub notifier: Notifier,
    pub queue: SyncQueue,
    pub timings: Timings,
}

impl AppState {
    /// Assemble the context, restoring the persisted sync queue.
    ///
    /// # Errors
    ///
    /// Returns a store error if the persisted queue cannot be read.
    pub async fn new(
        user_id: Uuid,
        local: LocalStore,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
        timings: Timings,
    ) -> Result<Self, StoreError> {
        let queue =
            SyncQueue::restore(local.clone(), remote.clone(), connectivity.clone(), timings.access.remote_timeout)
                .await?;
        Ok(Self { user_id, local, remote, connectivity, notifier: Notifier::new(), queue, timings })
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }
}
