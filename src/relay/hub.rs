//! In-process relay transport.
//!
//! Every subscriber of a document shares one broadcast channel, and a
//! published message reaches every subscriber including its sender, the
//! same way the hosted realtime service reflects a session's own writes.
//! Used by tests and by single-process demos.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transport::CHANNEL_CAPACITY;
use super::{RelayError, RelayMessage, RelayTransport, Subscription};
use crate::model::DocumentId;

#[derive(Default)]
struct HubState {
    channels: HashMap<DocumentId, broadcast::Sender<RelayMessage>>,
    tasks: Vec<JoinHandle<()>>,
    refuse_next: u32,
    subscribes: u32,
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `count` subscribe calls.
    pub fn refuse_subscribes(&self, count: u32) {
        self.lock().refuse_next = count;
    }

    /// Total subscribe calls seen, refused ones included.
    #[must_use]
    pub fn subscribe_count(&self) -> u32 {
        self.lock().subscribes
    }

    /// Drop every live subscription. Subscribers see their inbound channel close.
    pub fn disconnect_all(&self) {
        let tasks = std::mem::take(&mut self.lock().tasks);
        for task in tasks {
            task.abort();
        }
    }

    /// Deliver a message to every subscriber of its document.
    /// Returns the number of subscribers reached.
    pub fn inject(&self, message: RelayMessage) -> usize {
        let sender = self.lock().channels.get(&message.document_id).cloned();
        sender.map_or(0, |sender| sender.send(message).unwrap_or(0))
    }
}

#[async_trait]
impl RelayTransport for LoopbackHub {
    async fn subscribe(&self, document_id: &DocumentId) -> Result<Subscription, RelayError> {
        let mut state = self.lock();
        state.subscribes += 1;
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(RelayError::Unavailable("loopback hub refused subscribe".into()));
        }

        let channel = state
            .channels
            .entry(document_id.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        let (outbound, mut outbound_rx) = mpsc::channel::<RelayMessage>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);

        let publish = channel.clone();
        let forward_out = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if publish.send(message).is_err() {
                    debug!("loopback: no listeners");
                }
            }
        });

        let mut listener = channel.subscribe();
        let forward_in = tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "loopback: subscriber lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        state.tasks.retain(|task| !task.is_finished());
        state.tasks.push(forward_out);
        state.tasks.push(forward_in);
        Ok(Subscription { outbound, inbound })
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
