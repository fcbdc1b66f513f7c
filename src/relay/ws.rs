//! Websocket relay transport against the hosted realtime service.
//!
//! DESIGN
//! ======
//! Publishing goes through the relational store: each outbound message is
//! inserted as a `document_operations` row. Receiving goes through the
//! realtime websocket: after connecting, the transport sends one JSON
//! subscribe frame filtered to the document, then turns every INSERT
//! notification for that table back into a [`RelayMessage`].
//!
//! The session's own inserts come back too; the relay drops them by
//! session id.
//!
//! ERROR HANDLING
//! ==============
//! Connect and subscribe-frame failures fail the subscribe call. A failed
//! publish is logged and skipped; the relay is best effort. Any socket error
//! or close ends the subscription, which the relay sees as a lost connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::transport::CHANNEL_CAPACITY;
use super::{RelayError, RelayMessage, RelayTransport, Subscription};
use crate::config::RemoteConfig;
use crate::model::DocumentId;
use crate::remote::{OperationRow, RemoteStore};

pub const OPERATIONS_TABLE: &str = "document_operations";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsTransport {
    realtime_url: String,
    api_key: String,
    remote: Arc<dyn RemoteStore>,
}

impl WsTransport {
    #[must_use]
    pub fn new(config: &RemoteConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self { realtime_url: config.realtime_url.clone(), api_key: config.api_key.clone(), remote }
    }

    fn connect_url(&self) -> String {
        if self.api_key.is_empty() {
            self.realtime_url.clone()
        } else {
            format!("{}?apikey={}", self.realtime_url, self.api_key)
        }
    }
}

#[async_trait]
impl RelayTransport for WsTransport {
    async fn subscribe(&self, document_id: &DocumentId) -> Result<Subscription, RelayError> {
        let (mut stream, _) = connect_async(self.connect_url())
            .await
            .map_err(|e| RelayError::Connect(Box::new(e)))?;
        stream
            .send(Message::Text(subscribe_frame(document_id).into()))
            .await
            .map_err(|e| RelayError::Connect(Box::new(e)))?;
        info!(%document_id, "relay ws: subscribed");

        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_socket(stream, Arc::clone(&self.remote), document_id.clone(), outbound_rx, inbound_tx));
        Ok(Subscription { outbound, inbound })
    }
}

async fn run_socket(
    mut stream: WsStream,
    remote: Arc<dyn RemoteStore>,
    document_id: DocumentId,
    mut outbound: mpsc::Receiver<RelayMessage>,
    inbound: mpsc::Sender<RelayMessage>,
) {
    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                publish(remote.as_ref(), &message).await;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(message) = parse_change(text.as_str(), &document_id)
                        && inbound.send(message).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(%document_id, "relay ws: closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%document_id, error = %e, "relay ws: socket error");
                    break;
                }
            },
        }
    }
    if let Err(e) = stream.close(None).await {
        debug!(%document_id, error = %e, "relay ws: close failed");
    }
}

async fn publish(remote: &dyn RemoteStore, message: &RelayMessage) {
    let row = match operation_row(message) {
        Ok(row) => row,
        Err(e) => {
            warn!(document_id = %message.document_id, error = %e, "relay ws: encode failed");
            return;
        }
    };
    if let Err(e) = remote.insert_operation(&row).await {
        warn!(document_id = %message.document_id, error = %e, "relay ws: publish failed");
    }
}

// =============================================================================
// PROTOCOL
// =============================================================================

#[must_use]
pub fn subscribe_frame(document_id: &DocumentId) -> String {
    serde_json::json!({
        "event": "subscribe",
        "table": OPERATIONS_TABLE,
        "filter": format!("document_id=eq.{document_id}"),
    })
    .to_string()
}

/// The relay table row carrying `message`.
///
/// # Errors
///
/// Returns the serializer error if the message cannot be encoded.
pub fn operation_row(message: &RelayMessage) -> Result<OperationRow, serde_json::Error> {
    Ok(OperationRow {
        document_id: message.document_id.clone(),
        user_id: message.user_id,
        operation: serde_json::to_value(message)?,
    })
}

#[derive(Debug, Deserialize)]
struct ChangeNotice {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    record: Option<OperationRow>,
}

/// Decode a realtime frame into a relay message for `document_id`.
///
/// Acknowledgements, heartbeats, other tables and other documents yield `None`.
#[must_use]
pub fn parse_change(text: &str, document_id: &DocumentId) -> Option<RelayMessage> {
    let notice: ChangeNotice = match serde_json::from_str(text) {
        Ok(notice) => notice,
        Err(e) => {
            debug!(error = %e, "relay ws: ignoring non-change frame");
            return None;
        }
    };
    if notice.table != OPERATIONS_TABLE || notice.kind != "INSERT" {
        return None;
    }
    let row = notice.record?;
    if &row.document_id != document_id {
        return None;
    }
    match serde_json::from_value::<RelayMessage>(row.operation) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(%document_id, error = %e, "relay ws: malformed operation row");
            None
        }
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
