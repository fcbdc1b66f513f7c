//! Asset reference resolution.
//!
//! A document's records may reference binary assets by id. Each reference
//! must resolve to bytes in the local store or to a remote URL; anything
//! else is reported as broken. Resolution only reads: the records are never
//! rewritten and broken references are never dropped.

use serde_json::Value;
use tracing::warn;

use crate::canvas::record_id;
use crate::store::{LocalStore, StoreError};

const ASSET_TYPE_NAME: &str = "asset";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetResolution {
    /// Payload bytes are in the local store.
    Local,
    /// Payload is fetched from this URL.
    Remote(String),
    /// Neither resolves; the reference is left as is.
    Broken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub id: String,
    pub resolution: AssetResolution,
}

fn is_asset_record(record: &Value) -> bool {
    record.get("typeName").and_then(Value::as_str) == Some(ASSET_TYPE_NAME)
}

/// The record's source URL if it is one the host can fetch.
fn remote_src(record: &Value) -> Option<&str> {
    let src = record.get("props")?.get("src")?.as_str()?;
    let fetchable = ["https://", "http://", "data:"].iter().any(|scheme| src.starts_with(scheme));
    fetchable.then_some(src)
}

/// Classify every asset record in `records`.
///
/// # Errors
///
/// Returns a store error if an asset lookup fails.
pub async fn resolve_assets(records: &[Value], store: &LocalStore) -> Result<Vec<ResolvedAsset>, StoreError> {
    let mut out = Vec::new();
    for record in records.iter().filter(|r| is_asset_record(r)) {
        let Some(id) = record_id(record) else {
            continue;
        };
        let resolution = if store.get_asset_meta(id).await?.is_some() {
            AssetResolution::Local
        } else if let Some(src) = remote_src(record) {
            AssetResolution::Remote(src.to_owned())
        } else {
            warn!(asset_id = id, "asset reference does not resolve");
            AssetResolution::Broken
        };
        out.push(ResolvedAsset { id: id.to_owned(), resolution });
    }
    Ok(out)
}

#[cfg(test)]
#[path = "assets_test.rs"]
mod tests;
