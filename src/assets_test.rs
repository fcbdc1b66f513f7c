use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::fixtures::memory_store;
use crate::model::{AssetMeta, now_utc};

fn asset_record(id: &str, src: Option<&str>) -> Value {
    json!({"id": id, "typeName": "asset", "type": "image", "props": {"src": src, "w": 10, "h": 10}})
}

#[tokio::test]
async fn local_bytes_win_over_remote_url() {
    let store = memory_store().await;
    let meta = AssetMeta {
        id: "asset:local".into(),
        mime_type: "image/png".into(),
        size: 4,
        owner_id: Uuid::new_v4(),
        created_at: now_utc(),
    };
    store.save_asset(&meta, &[1, 2, 3, 4]).await.unwrap();

    let records = vec![asset_record("asset:local", Some("https://cdn.example/a.png"))];
    let resolved = resolve_assets(&records, &store).await.unwrap();

    assert_eq!(resolved, vec![ResolvedAsset { id: "asset:local".into(), resolution: AssetResolution::Local }]);
}

#[tokio::test]
async fn remote_url_resolves_without_local_bytes() {
    let store = memory_store().await;
    let records = vec![asset_record("asset:remote", Some("https://cdn.example/b.png"))];

    let resolved = resolve_assets(&records, &store).await.unwrap();

    assert_eq!(resolved[0].resolution, AssetResolution::Remote("https://cdn.example/b.png".into()));
}

#[tokio::test]
async fn unresolvable_reference_is_broken_and_untouched() {
    let store = memory_store().await;
    let records = vec![
        asset_record("asset:gone", None),
        asset_record("asset:blob", Some("blob:local-only")),
        json!({"id": "shape:1", "typeName": "shape"}),
    ];
    let before = records.clone();

    let resolved = resolve_assets(&records, &store).await.unwrap();

    assert_eq!(resolved.len(), 2);
    assert!(resolved.iter().all(|r| r.resolution == AssetResolution::Broken));
    assert_eq!(records, before);
}
