//! Schema creation and idempotent migration
//!
//! Runs at every open under a single connection. Older deployments may lack
//! the `call_count` column on `usage_stats` or the `app_version` table
//! entirely; both are added in place without touching existing rows.

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::info;

use crate::error::Result;

const CREATE_TOKENS: &str = "\
    CREATE TABLE IF NOT EXISTS tokens (
        id TEXT PRIMARY KEY,
        access_token TEXT NOT NULL,
        refresh_token TEXT NOT NULL,
        expires_at INTEGER,
        uploaded_at INTEGER NOT NULL,
        usage_count INTEGER NOT NULL DEFAULT 0
    )";

const CREATE_USAGE: &str = "\
    CREATE TABLE IF NOT EXISTS usage_stats (
        date TEXT NOT NULL,
        model TEXT NOT NULL,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        call_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (date, model)
    )";

const CREATE_APP_VERSION: &str = "\
    CREATE TABLE IF NOT EXISTS app_version (
        key TEXT PRIMARY KEY,
        version TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )";

pub(crate) async fn run(pool: &SqlitePool) -> Result<()> {
    let mut conn = pool.acquire().await?;

    sqlx::query(CREATE_TOKENS).execute(&mut *conn).await?;
    sqlx::query(CREATE_USAGE).execute(&mut *conn).await?;
    sqlx::query(CREATE_APP_VERSION).execute(&mut *conn).await?;

    // usage_stats predates call_count in older databases
    let columns = sqlx::query("PRAGMA table_info(usage_stats)")
        .fetch_all(&mut *conn)
        .await?;
    let has_call_count = columns
        .iter()
        .any(|row| row.get::<String, _>("name") == "call_count");
    if !has_call_count {
        info!("adding usage_stats.call_count column");
        sqlx::query("ALTER TABLE usage_stats ADD COLUMN call_count INTEGER NOT NULL DEFAULT 0")
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}
