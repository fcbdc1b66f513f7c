//! Local database initialization and migration runner.
//!
//! SYSTEM CONTEXT
//! ==============
//! Session startup uses this module to open the SQLite file backing the local
//! document store and the persisted sync queue, and to apply the embedded
//! schema migrations before any document operation runs.

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;

fn db_max_connections() -> u32 {
    crate::config::env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)
}

/// Open (or create) the SQLite database at `path` and run migrations.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or migrations fail.
pub async fn init_pool(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(path)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(db_max_connections())
        .connect_with(options)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;
    info!(%path, "local store ready");

    Ok(pool)
}

/// Open a private in-memory database and run migrations.
///
/// Every connection to `:memory:` is a separate database, so the pool is
/// pinned to a single connection that never expires.
///
/// # Errors
///
/// Returns an error if migrations fail.
pub async fn init_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}
