use std::time::Duration;

use serde_json::json;

use super::*;
use crate::canvas::ChangeSource;
use crate::config::{AccessConfig, AutosaveConfig, RelayConfig};
use crate::fixtures::{Harness, eventually, harness, server_document};
use crate::relay::LoopbackHub;

async fn seeded(h: &Harness, data: serde_json::Value) -> Document {
    let mut doc = server_document(h.state.user_id, "Shared board");
    doc.data = data;
    h.state.local.save_document(&doc).await.unwrap();
    h.remote.put_row(&doc);
    doc
}

async fn wait_connected(open: &OpenDocument) -> bool {
    for _ in 0..100 {
        if open.relay_status() == Some(ConnectionStatus::Connected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn start_without_remote_runs_offline() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        db_path: format!("sqlite://{}", dir.path().join("session.db").display()),
        remote: None,
        access: AccessConfig::default(),
        relay: RelayConfig::default(),
        autosave: AutosaveConfig::default(),
    };

    let session = Session::start(&config, Uuid::new_v4()).await.unwrap();

    assert!(!session.state().is_online());
    let doc = session.access().create_document("Offline sketch").await.unwrap();
    assert!(doc.id.is_temporary());
    assert_eq!(session.access().pending_changes(), 1);
    session.shutdown();
}

#[tokio::test]
async fn open_document_loads_canvas_and_connects_relay() {
    let h = harness(true).await;
    let doc = seeded(&h, json!([{"id": "shape:1", "typeName": "shape"}])).await;
    let session = Session::from_state(h.state.clone(), Some(Arc::new(LoopbackHub::new())));

    let open = session.open_document(&doc.id).await.unwrap();

    assert_eq!(open.canvas.len(), 1);
    assert!(open.canvas.get("shape:1").is_some());
    assert!(wait_connected(&open).await);
    assert_eq!(session.access().current_document().map(|d| d.id.clone()), Some(doc.id.clone()));
    session.close_document(open).await;
    session.shutdown();
}

#[tokio::test]
async fn two_sessions_share_edits_through_the_relay() {
    let hub = LoopbackHub::new();
    let (ha, hb) = (harness(true).await, harness(true).await);
    let doc = seeded(&ha, json!([])).await;
    hb.state.local.save_document(&doc).await.unwrap();
    hb.remote.put_row(&doc);
    let a = Session::from_state(ha.state.clone(), Some(Arc::new(hub.clone())));
    let b = Session::from_state(hb.state.clone(), Some(Arc::new(hub.clone())));
    let open_a = a.open_document(&doc.id).await.unwrap();
    let open_b = b.open_document(&doc.id).await.unwrap();
    assert!(wait_connected(&open_a).await && wait_connected(&open_b).await);

    open_a.canvas.put_records(vec![json!({"id": "shape:9", "x": 3})], ChangeSource::User);

    let canvas_b = open_b.canvas.clone();
    assert!(eventually(|| canvas_b.get("shape:9").is_some()).await);
    a.close_document(open_a).await;
    b.close_document(open_b).await;
}

#[tokio::test]
async fn temporary_documents_are_not_relayed() {
    let h = harness(false).await;
    let session = Session::from_state(h.state.clone(), Some(Arc::new(LoopbackHub::new())));
    let draft = session.access().create_document("Draft").await.unwrap();

    let open = session.open_document(&draft.id).await.unwrap();

    assert_eq!(open.relay_status(), None);
    session.close_document(open).await;
}

#[tokio::test]
async fn malformed_payload_is_not_opened() {
    let h = harness(false).await;
    let doc = seeded(&h, json!({"not": "an array"})).await;
    let session = Session::from_state(h.state.clone(), None);

    assert!(session.open_document(&doc.id).await.is_none());
}

#[tokio::test]
async fn close_document_saves_pending_edits() {
    let h = harness(false).await;
    let doc = seeded(&h, json!([])).await;
    let session = Session::from_state(h.state.clone(), None);
    let open = session.open_document(&doc.id).await.unwrap();

    open.canvas.put_records(vec![json!({"id": "late-edit"})], ChangeSource::User);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(session.close_document(open).await);
    let stored = h.state.local.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.data, json!([{"id": "late-edit"}]));
    assert!(session.access().current_document().is_none());
}
