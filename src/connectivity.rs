//! Connectivity signal — the single source of truth for "are we online".
//!
//! DESIGN
//! ======
//! The current state lives in a `watch` channel so readers always see the
//! latest value; transitions and visibility changes fan out over a
//! `broadcast` channel so the sync queue can react to them. Host code (the
//! CLI, an embedding app) reports network and visibility changes through
//! `set_online` and `page_visible`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::remote::{RemoteStore, with_timeout};

const EVENT_CAPACITY: usize = 16;

/// A change the sync layer may want to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
    /// The host surface became visible again (tab focus, app resume).
    Visible,
}

struct Inner {
    online: watch::Sender<bool>,
    events: broadcast::Sender<ConnectivityEvent>,
}

/// Shared connectivity handle. Clones observe and drive the same state.
#[derive(Clone)]
pub struct Connectivity {
    inner: Arc<Inner>,
}

impl Connectivity {
    #[must_use]
    pub fn new(initially_online: bool) -> Self {
        let (online, _) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { inner: Arc::new(Inner { online, events }) }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Record the current network state. Only real transitions emit an event.
    pub fn set_online(&self, online: bool) {
        let changed = self.inner.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if !changed {
            return;
        }
        info!(online, "connectivity changed");
        let event = if online { ConnectivityEvent::Online } else { ConnectivityEvent::Offline };
        self.emit(event);
    }

    /// Report that the host surface became visible again.
    pub fn page_visible(&self) {
        self.emit(ConnectivityEvent::Visible);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.online.subscribe()
    }

    /// Ping the remote store and record the outcome. Returns the new state.
    pub async fn check_reachability(&self, remote: &dyn RemoteStore, limit: Duration) -> bool {
        let online = match with_timeout(limit, remote.ping()).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "reachability check failed");
                false
            }
        };
        self.set_online(online);
        online
    }

    fn emit(&self, event: ConnectivityEvent) {
        if self.inner.events.send(event).is_err() {
            debug!(?event, "connectivity event dropped: no subscribers");
        }
    }
}

#[cfg(test)]
#[path = "connectivity_test.rs"]
mod tests;
