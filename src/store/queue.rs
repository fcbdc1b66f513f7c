//! Durable representation of the sync queue.
//!
//! The queue is small and always rewritten as a whole, so `write_queue`
//! replaces every row inside one transaction and `seq` order is the FIFO order.

use sqlx::types::Json;
use tracing::warn;

use super::{LocalStore, StoreError, format_ts, parse_ts};
use crate::model::{Document, MutationKind, PendingMutation};

#[derive(sqlx::FromRow)]
struct QueueRow {
    seq: i64,
    kind: String,
    document: Json<Document>,
    enqueued_at: String,
}

impl LocalStore {
    /// Load the persisted queue in FIFO order.
    ///
    /// Rows with an unknown mutation kind are skipped with a warning rather
    /// than failing the whole load.
    ///
    /// # Errors
    ///
    /// Returns a store error if the read fails or a row cannot be decoded.
    pub async fn load_queue(&self) -> Result<Vec<PendingMutation>, StoreError> {
        let rows = sqlx::query_as::<_, QueueRow>(
            "SELECT seq, kind, document, enqueued_at FROM sync_queue ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(kind) = MutationKind::parse(&row.kind) else {
                warn!(seq = row.seq, kind = %row.kind, "sync queue: skipping entry with unknown kind");
                continue;
            };
            let enqueued_at = parse_ts(&row.seq.to_string(), &row.enqueued_at)?;
            out.push(PendingMutation { kind, document: row.document.0, enqueued_at });
        }
        Ok(out)
    }

    /// Replace the persisted queue with `items`, preserving their order.
    ///
    /// # Errors
    ///
    /// Returns a store error if any write fails; the previous queue is kept then.
    pub async fn write_queue(&self, items: &[PendingMutation]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_queue").execute(tx.as_mut()).await?;
        for item in items {
            sqlx::query("INSERT INTO sync_queue (kind, document, enqueued_at) VALUES (?1, ?2, ?3)")
                .bind(item.kind.as_str())
                .bind(Json(&item.document))
                .bind(format_ts(item.enqueued_at)?)
                .execute(tx.as_mut())
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
