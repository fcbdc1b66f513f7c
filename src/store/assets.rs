//! Asset metadata and payload storage.
//!
//! Metadata and bytes live in separate tables so listings never touch payload
//! bytes. Save and delete run both statements in a single transaction so the
//! two halves cannot diverge.

use uuid::Uuid;

use super::{LocalStore, StoreError, format_ts, parse_owner, parse_ts};
use crate::model::AssetMeta;

#[derive(sqlx::FromRow)]
struct AssetRow {
    id: String,
    mime_type: String,
    size: i64,
    owner_id: String,
    created_at: String,
}

impl TryFrom<AssetRow> for AssetMeta {
    type Error = StoreError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        let owner_id = parse_owner(&row.id, &row.owner_id)?;
        let created_at = parse_ts(&row.id, &row.created_at)?;
        Ok(AssetMeta { id: row.id, mime_type: row.mime_type, size: row.size, owner_id, created_at })
    }
}

impl LocalStore {
    /// Store asset metadata and bytes together.
    ///
    /// # Errors
    ///
    /// Returns a store error if either write fails; nothing is committed then.
    pub async fn save_asset(&self, meta: &AssetMeta, bytes: &[u8]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO assets (id, mime_type, size, owner_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&meta.id)
        .bind(&meta.mime_type)
        .bind(meta.size)
        .bind(meta.owner_id.to_string())
        .bind(format_ts(meta.created_at)?)
        .execute(tx.as_mut())
        .await?;
        sqlx::query("INSERT OR REPLACE INTO asset_blobs (id, bytes) VALUES (?1, ?2)")
            .bind(&meta.id)
            .bind(bytes)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Load an asset's payload bytes.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails.
    pub async fn get_asset_data(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let bytes: Option<Vec<u8>> = sqlx::query_scalar("SELECT bytes FROM asset_blobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(bytes)
    }

    /// Load an asset's metadata without its payload.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails or the row is corrupt.
    pub async fn get_asset_meta(&self, id: &str) -> Result<Option<AssetMeta>, StoreError> {
        let row = sqlx::query_as::<_, AssetRow>(
            "SELECT id, mime_type, size, owner_id, created_at FROM assets WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AssetMeta::try_from).transpose()
    }

    /// List an owner's asset metadata, newest first.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails or a row is corrupt.
    pub async fn list_assets(&self, owner_id: Uuid) -> Result<Vec<AssetMeta>, StoreError> {
        let rows = sqlx::query_as::<_, AssetRow>(
            "SELECT id, mime_type, size, owner_id, created_at FROM assets
             WHERE owner_id = ?1
             ORDER BY created_at DESC",
        )
        .bind(owner_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AssetMeta::try_from).collect()
    }

    /// Remove an asset's metadata and bytes. Returns false if neither existed.
    ///
    /// # Errors
    ///
    /// Returns a store error if either delete fails; nothing is committed then.
    pub async fn delete_asset(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let meta = sqlx::query("DELETE FROM assets WHERE id = ?1")
            .bind(id)
            .execute(tx.as_mut())
            .await?;
        let blob = sqlx::query("DELETE FROM asset_blobs WHERE id = ?1")
            .bind(id)
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(meta.rows_affected() + blob.rows_affected() > 0)
    }
}
