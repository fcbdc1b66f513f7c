//! Transport seam for the relay.
//!
//! A subscription is a pair of channels: the relay writes outgoing messages
//! to `outbound` and reads peer messages from `inbound`. The inbound channel
//! closing means the connection is gone.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{RelayError, RelayMessage};
use crate::model::DocumentId;

pub(crate) const CHANNEL_CAPACITY: usize = 256;

pub struct Subscription {
    pub outbound: mpsc::Sender<RelayMessage>,
    pub inbound: mpsc::Receiver<RelayMessage>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Join the per-document channel.
    async fn subscribe(&self, document_id: &DocumentId) -> Result<Subscription, RelayError>;
}
