use std::time::Duration;

use serde_json::json;

use super::*;
use crate::fixtures::{Harness, MockFailure, eventually, harness, server_document};
use crate::notice::{Notice, NoticeLevel};

fn access(h: &Harness) -> DocumentAccess {
    DocumentAccess::new(h.state.clone())
}

/// A synced document present both locally and remotely.
async fn seeded(h: &Harness, name: &str) -> Document {
    let doc = server_document(h.state.user_id, name);
    h.state.local.save_document(&doc).await.unwrap();
    h.remote.put_row(&doc);
    doc
}

fn drain_notices(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

// =============================================================================
// routing
// =============================================================================

#[test]
fn route_select_covers_every_state() {
    assert_eq!(Route::select(true, SyncState::Synced), Route::Remote);
    assert_eq!(Route::select(true, SyncState::PendingSync), Route::Remote);
    assert_eq!(Route::select(true, SyncState::LocalOnly), Route::Local);
    assert_eq!(Route::select(false, SyncState::Synced), Route::Local);
    assert_eq!(Route::select(false, SyncState::PendingSync), Route::Local);
    assert_eq!(Route::select(false, SyncState::LocalOnly), Route::Local);
}

// =============================================================================
// create
// =============================================================================

#[tokio::test]
async fn offline_create_uses_temporary_id_and_queues() {
    let h = harness(false).await;
    let access = access(&h);

    let doc = access.create_document("Untitled Drawing").await.unwrap();

    assert!(doc.id.is_temporary());
    assert!(!doc.synced);
    assert_eq!(doc.sync_state(), SyncState::LocalOnly);
    assert!(h.state.local.get_document(&doc.id).await.unwrap().is_some());
    assert!(Arc::ptr_eq(&access.documents()[0], &doc));
    assert_eq!(access.pending_changes(), 1);
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn blank_create_name_gets_default() {
    let h = harness(false).await;
    let doc = access(&h).create_document("   ").await.unwrap();
    assert_eq!(doc.name, DEFAULT_DOCUMENT_NAME);
}

#[tokio::test]
async fn online_create_inserts_remotely() {
    let h = harness(true).await;
    let access = access(&h);

    let doc = access.create_document("Plan").await.unwrap();

    assert!(!doc.id.is_temporary());
    assert!(doc.synced);
    assert!(h.remote.row(&doc.id).is_some());
    assert!(h.state.local.get_document(&doc.id).await.unwrap().is_some());
    assert_eq!(access.pending_changes(), 0);
}

#[tokio::test]
async fn online_create_failure_is_reported_not_hidden() {
    let h = harness(true).await;
    let access = access(&h);
    let mut notices = h.state.notifier.subscribe();
    h.remote.fail_all(Some(MockFailure::Transport));

    assert!(access.create_document("Plan").await.is_none());

    let notices = drain_notices(&mut notices);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(notices[0].action, "create");
    assert!(access.documents().is_empty());
    assert_eq!(access.pending_changes(), 0);
}

#[tokio::test]
async fn online_create_times_out() {
    let h = harness(true).await;
    let access = access(&h);
    let mut notices = h.state.notifier.subscribe();
    h.remote.set_delay(Some(Duration::from_millis(500)));

    assert!(access.create_document("Slow").await.is_none());

    let notices = drain_notices(&mut notices);
    assert_eq!(notices[0].code, Some("E_REMOTE_TIMEOUT"));
}

// =============================================================================
// update
// =============================================================================

#[tokio::test]
async fn content_update_keeps_current_reference() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Sketch").await;
    let opened = access.load_document(&doc.id).await.unwrap();

    let data = json!([{"id": "shape:1", "typeName": "shape"}]);
    assert!(access.update_document(&doc.id, DocumentPatch::content(data.clone())).await);

    assert!(Arc::ptr_eq(&access.current_document().unwrap(), &opened));
    let stored = h.state.local.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.data, data);
    assert_eq!(stored.snapshot, Some(data.clone()));
    assert!(stored.synced);
    assert_eq!(h.remote.row(&doc.id).unwrap().data, data);
}

#[tokio::test]
async fn name_update_replaces_current_reference() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Sketch").await;
    let opened = access.load_document(&doc.id).await.unwrap();

    assert!(access.update_document(&doc.id, DocumentPatch::rename("Renamed")).await);

    let current = access.current_document().unwrap();
    assert!(!Arc::ptr_eq(&current, &opened));
    assert_eq!(current.name, "Renamed");
}

#[tokio::test]
async fn temporary_document_update_stays_local() {
    let h = harness(false).await;
    let access = access(&h);
    let doc = access.create_document("Draft").await.unwrap();
    h.state.connectivity.set_online(true);
    let queued = access.pending_changes();

    assert!(access.update_document(&doc.id, DocumentPatch::content(json!([]))).await);

    assert!(!h.remote.calls().iter().any(|c| c.starts_with("update") || c.starts_with("upsert")));
    assert_eq!(access.pending_changes(), queued);
}

#[tokio::test]
async fn offline_update_marks_unsynced_and_queues() {
    let h = harness(false).await;
    let access = access(&h);
    let doc = seeded(&h, "Sketch").await;

    assert!(access.set_public(&doc.id, true).await);

    let stored = h.state.local.get_document(&doc.id).await.unwrap().unwrap();
    assert!(stored.is_public);
    assert_eq!(stored.sync_state(), SyncState::PendingSync);
    assert_eq!(access.pending_changes(), 1);
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn transient_update_failure_queues_with_info_notice() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Sketch").await;
    let mut notices = h.state.notifier.subscribe();
    h.remote.fail_all(Some(MockFailure::Status(503)));

    assert!(access.set_favorite(&doc.id, true).await);

    let notices = drain_notices(&mut notices);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Info);
    assert_eq!(access.pending_changes(), 1);
    assert!(!h.state.local.get_document(&doc.id).await.unwrap().unwrap().synced);
}

#[tokio::test]
async fn rejected_update_returns_false_and_keeps_local_copy() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Sketch").await;
    let mut notices = h.state.notifier.subscribe();
    h.remote.fail_id(&doc.id, MockFailure::Status(403));

    assert!(!access.set_public(&doc.id, true).await);

    let notices = drain_notices(&mut notices);
    assert_eq!(notices[0].level, NoticeLevel::Error);
    assert_eq!(notices[0].code, Some("E_REMOTE_REJECTED"));
    assert_eq!(access.pending_changes(), 0);
    let stored = h.state.local.get_document(&doc.id).await.unwrap().unwrap();
    assert!(stored.is_public);
    assert!(!stored.synced);
}

#[tokio::test]
async fn update_of_unknown_document_fails() {
    let h = harness(true).await;
    assert!(!access(&h).update_document(&DocumentId::from("missing"), DocumentPatch::rename("x")).await);
}

// =============================================================================
// rename
// =============================================================================

#[tokio::test]
async fn blank_rename_is_rejected() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Keep me").await;

    assert!(!access.rename_document(&doc.id, "").await);
    assert!(!access.rename_document(&doc.id, "   ").await);

    assert_eq!(h.state.local.get_document(&doc.id).await.unwrap().unwrap().name, "Keep me");
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn rename_online_syncs() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Old").await;

    assert!(access.rename_document(&doc.id, "  New  ").await);

    let stored = h.state.local.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "New");
    assert!(stored.synced);
    assert_eq!(h.remote.row(&doc.id).unwrap().name, "New");
}

#[tokio::test]
async fn rename_degrades_to_local_on_any_remote_failure() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Old").await;
    h.remote.fail_id(&doc.id, MockFailure::Status(400));

    assert!(access.rename_document(&doc.id, "New").await);
    assert_eq!(access.pending_changes(), 1);

    let stored = h.state.local.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "New");
    assert!(!stored.synced);
    assert_eq!(h.remote.row(&doc.id).unwrap().name, "Old");
}

// =============================================================================
// delete
// =============================================================================

#[tokio::test]
async fn deleting_temporary_document_discards_queued_create() {
    let h = harness(false).await;
    let access = access(&h);
    let doc = access.create_document("Scratch").await.unwrap();
    assert_eq!(access.pending_changes(), 1);

    assert!(access.delete_document(&doc.id).await);

    assert_eq!(access.pending_changes(), 0);
    assert!(h.state.local.get_document(&doc.id).await.unwrap().is_none());
    assert!(access.documents().is_empty());
}

#[tokio::test]
async fn offline_delete_tombstones_and_queues() {
    let h = harness(false).await;
    let access = access(&h);
    let doc = seeded(&h, "Doomed").await;
    access.fetch_documents().await;
    assert_eq!(access.documents().len(), 1);

    assert!(access.delete_document(&doc.id).await);

    let stored = h.state.local.get_document(&doc.id).await.unwrap().unwrap();
    assert!(stored.deleted);
    assert!(access.documents().is_empty());
    assert_eq!(h.state.queue.pending()[0].kind, MutationKind::Delete);
    assert!(h.remote.row(&doc.id).is_some());
}

#[tokio::test]
async fn online_delete_removes_everywhere() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Doomed").await;
    access.load_document(&doc.id).await.unwrap();

    assert!(access.delete_document(&doc.id).await);

    assert!(h.remote.row(&doc.id).is_none());
    assert!(h.state.local.get_document(&doc.id).await.unwrap().is_none());
    assert!(access.current_document().is_none());
}

#[tokio::test]
async fn online_delete_rejection_keeps_document() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Protected").await;
    h.remote.fail_id(&doc.id, MockFailure::Status(403));

    assert!(!access.delete_document(&doc.id).await);
    assert!(h.state.local.get_document(&doc.id).await.unwrap().is_some());
}

// =============================================================================
// load
// =============================================================================

#[tokio::test]
async fn offline_load_reads_local() {
    let h = harness(false).await;
    let access = access(&h);
    let doc = seeded(&h, "Cached").await;

    let loaded = access.load_document(&doc.id).await.unwrap();

    assert_eq!(loaded.name, "Cached");
    assert!(h.remote.calls().is_empty());
    assert!(!access.is_loading());
}

#[tokio::test]
async fn load_prefers_newer_unsynced_local_copy() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Server").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut edited = doc.clone();
    edited.apply_patch(&DocumentPatch::rename("Local edit"));
    edited.synced = false;
    h.state.local.save_document(&edited).await.unwrap();

    let loaded = access.load_document(&doc.id).await.unwrap();

    assert_eq!(loaded.name, "Local edit");
}

#[tokio::test]
async fn load_takes_server_copy_and_caches_it() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = server_document(h.state.user_id, "Only remote");
    h.remote.put_row(&doc);

    let loaded = access.load_document(&doc.id).await.unwrap();

    assert_eq!(loaded.name, "Only remote");
    assert!(h.state.local.get_document(&doc.id).await.unwrap().is_some());
}

#[tokio::test]
async fn load_falls_back_to_cache_silently() {
    let h = harness(true).await;
    let access = access(&h);
    let doc = seeded(&h, "Cached").await;
    let mut notices = h.state.notifier.subscribe();
    h.remote.fail_all(Some(MockFailure::Transport));

    let loaded = access.load_document(&doc.id).await.unwrap();

    assert_eq!(loaded.id, doc.id);
    assert!(drain_notices(&mut notices).is_empty());
}

#[tokio::test]
async fn load_without_cache_reports_failure() {
    let h = harness(true).await;
    let access = access(&h);
    let mut notices = h.state.notifier.subscribe();
    h.remote.fail_all(Some(MockFailure::Transport));

    assert!(access.load_document(&DocumentId::from("nowhere")).await.is_none());
    assert_eq!(drain_notices(&mut notices).len(), 1);
    assert!(access.current_document().is_none());
}

#[tokio::test]
async fn malformed_payload_aborts_load() {
    let h = harness(false).await;
    let access = access(&h);
    let good = seeded(&h, "Good").await;
    let opened = access.load_document(&good.id).await.unwrap();

    let mut bad = server_document(h.state.user_id, "Bad");
    bad.data = json!({"not": "an array"});
    h.state.local.save_document(&bad).await.unwrap();

    assert!(access.load_document(&bad.id).await.is_none());
    assert!(Arc::ptr_eq(&access.current_document().unwrap(), &opened));
}

// =============================================================================
// fetch
// =============================================================================

#[tokio::test]
async fn fetch_merges_remote_with_local_only_documents() {
    let h = harness(false).await;
    let access = access(&h);
    let draft = access.create_document("Offline draft").await.unwrap();
    let remote_only = server_document(h.state.user_id, "From server");
    h.remote.put_row(&remote_only);
    h.state.connectivity.set_online(true);

    access.fetch_documents().await;

    let mut names: Vec<String> = access.documents().iter().map(|d| d.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["From server", "Offline draft"]);
    assert!(access.documents().iter().any(|d| d.id == draft.id));
    assert!(h.state.local.get_document(&remote_only.id).await.unwrap().is_some());
}

#[tokio::test]
async fn fetch_is_throttled() {
    let h = harness(true).await;
    let access = access(&h);

    access.fetch_documents().await;
    access.fetch_documents().await;

    assert_eq!(h.remote.call_count("list"), 1);
}

#[tokio::test]
async fn fetch_falls_back_to_local_list() {
    let h = harness(true).await;
    let access = access(&h);
    seeded(&h, "Cached").await;
    let mut notices = h.state.notifier.subscribe();
    h.remote.fail_all(Some(MockFailure::Transport));

    access.fetch_documents().await;

    assert_eq!(access.documents().len(), 1);
    assert!(drain_notices(&mut notices).is_empty());
    assert!(!access.is_loading());
}

#[test]
fn merge_prefers_newer_unsynced_and_drops_tombstones() {
    let owner = uuid::Uuid::new_v4();
    let stale_server = server_document(owner, "Server old");
    let mut local_newer = stale_server.clone();
    local_newer.name = "Local new".into();
    local_newer.updated_at += time::Duration::seconds(5);
    local_newer.synced = false;

    let fresh_server = server_document(owner, "Server fresh");
    let mut local_older = fresh_server.clone();
    local_older.name = "Local old".into();
    local_older.updated_at -= time::Duration::seconds(5);
    local_older.synced = false;

    let deleted_server = server_document(owner, "Deleted");
    let mut tombstone = deleted_server.clone();
    tombstone.deleted = true;
    tombstone.synced = false;

    let draft = Document::new_local("Draft", owner);

    let merged = merge_document_lists(
        vec![stale_server, fresh_server, deleted_server],
        vec![local_newer, local_older, tombstone, draft],
    );

    let mut names: Vec<&str> = merged.iter().map(|d| d.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Draft", "Local new", "Server fresh"]);
}

// =============================================================================
// id migration
// =============================================================================

#[tokio::test]
async fn drained_create_repoints_view_state() {
    let h = harness(false).await;
    let access = access(&h);
    let listener = access.spawn_remap_listener();
    let draft = access.create_document("Untitled Drawing").await.unwrap();
    access.load_document(&draft.id).await.unwrap();

    h.state.connectivity.set_online(true);
    let report = h.state.queue.sync_pending_changes().await;
    let server_id = report.remapped[0].to.clone();

    assert!(eventually(|| access.current_document().is_some_and(|d| d.id == server_id)).await);
    assert_eq!(access.documents()[0].id, server_id);
    assert!(access.documents()[0].synced);
    listener.abort();
}

#[tokio::test]
async fn update_through_stale_temporary_id_lands_on_server_id() {
    let h = harness(false).await;
    let access = access(&h);
    let draft = access.create_document("Draft").await.unwrap();

    h.state.connectivity.set_online(true);
    let report = h.state.queue.sync_pending_changes().await;
    let server_id = report.remapped[0].to.clone();

    assert!(access.update_document(&draft.id, DocumentPatch::content(json!([{"id": "shape:1"}]))).await);

    assert!(h.state.local.get_document(&draft.id).await.unwrap().is_none());
    let stored = h.state.local.get_document(&server_id).await.unwrap().unwrap();
    assert_eq!(stored.data, json!([{"id": "shape:1"}]));
    assert_eq!(h.remote.row(&server_id).unwrap().data, json!([{"id": "shape:1"}]));
    assert_eq!(h.state.local.get_all_documents(h.state.user_id).await.unwrap().len(), 1);
}
