//! The store facade
//!
//! All writes go straight to SQLite and invalidate the whole read cache; the
//! cache only ever serves `load_all_tokens`, which admin status polling and
//! the scheduler hit far more often than anything changes. SQLite's own
//! locking serializes writers; readers go through the pool concurrently.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;
use tracing::debug;

use common::clock::now_ms;
use qwen_auth::TokenData;

use crate::error::Result;
use crate::migrate;

/// How long a cached `load_all_tokens` snapshot may be served.
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Row key for the single cached upstream client version.
const VERSION_KEY: &str = "qwen_code";

/// Usage counters for one model on one local date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub total_tokens: i64,
    pub call_count: i64,
}

/// Aggregated usage for one local date, shaped for the statistics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub date: String,
    pub total_tokens_today: i64,
    pub total_calls_today: i64,
    pub models: BTreeMap<String, ModelUsage>,
}

struct TokenCache {
    snapshot: HashMap<String, TokenData>,
    fetched_at: Instant,
}

/// Transactional facade over the embedded SQLite database.
pub struct Store {
    pool: SqlitePool,
    cache: RwLock<Option<TokenCache>>,
}

impl Store {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrate::run(&pool).await?;

        Ok(Self {
            pool,
            cache: RwLock::new(None),
        })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // A single connection: every :memory: connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrate::run(&pool).await?;
        Ok(Self {
            pool,
            cache: RwLock::new(None),
        })
    }

    async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    /// Full row replace keyed by id.
    pub async fn upsert_token(&self, id: &str, token: &TokenData) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO tokens \
             (id, access_token, refresh_token, expires_at, uploaded_at, usage_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at)
        .bind(token.uploaded_at)
        .bind(token.usage_count)
        .execute(&self.pool)
        .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// Swap in refreshed credentials without touching `uploaded_at` or
    /// `usage_count`; concurrent call-count increments survive a refresh
    /// committing a stale row image. Returns whether the row existed.
    pub async fn update_token_credentials(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tokens SET access_token = ?2, refresh_token = ?3, expires_at = ?4 \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        self.invalidate_cache().await;
        Ok(result.rows_affected() > 0)
    }

    /// Load the whole pool, served from the read cache when fresh.
    pub async fn load_all_tokens(&self) -> Result<HashMap<String, TokenData>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < CACHE_TTL {
                    return Ok(cached.snapshot.clone());
                }
            }
        }

        let rows = sqlx::query(
            "SELECT id, access_token, refresh_token, expires_at, uploaded_at, usage_count \
             FROM tokens",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tokens = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            tokens.insert(
                id,
                TokenData {
                    access_token: row.get("access_token"),
                    refresh_token: row.get("refresh_token"),
                    expires_at: row.get("expires_at"),
                    uploaded_at: row.get("uploaded_at"),
                    usage_count: row.get("usage_count"),
                },
            );
        }

        *self.cache.write().await = Some(TokenCache {
            snapshot: tokens.clone(),
            fetched_at: Instant::now(),
        });
        debug!(count = tokens.len(), "token snapshot loaded from database");
        Ok(tokens)
    }

    /// Delete one token. Returns whether a row existed.
    pub async fn delete_token(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tokens WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.invalidate_cache().await;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every token. Returns the number of rows removed.
    pub async fn delete_all_tokens(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tokens")
            .execute(&self.pool)
            .await?;
        self.invalidate_cache().await;
        Ok(result.rows_affected())
    }

    /// Atomic usage upsert: adds `tokens_delta` to the day/model counter and
    /// bumps its call count by one.
    pub async fn increment_usage(&self, date: &str, model: &str, tokens_delta: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_stats (date, model, total_tokens, call_count) \
             VALUES (?1, ?2, ?3, 1) \
             ON CONFLICT(date, model) DO UPDATE SET \
                 total_tokens = total_tokens + excluded.total_tokens, \
                 call_count = call_count + 1",
        )
        .bind(date)
        .bind(model)
        .bind(tokens_delta)
        .execute(&self.pool)
        .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// Bump a token's served-request counter.
    pub async fn increment_token_call_count(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE tokens SET usage_count = usage_count + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.invalidate_cache().await;
        Ok(())
    }

    /// Aggregate usage for one local date. Unknown dates report zeros.
    pub async fn read_usage(&self, date: &str) -> Result<UsageReport> {
        let rows = sqlx::query(
            "SELECT model, total_tokens, call_count FROM usage_stats WHERE date = ?1",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        let mut report = UsageReport {
            date: date.to_string(),
            total_tokens_today: 0,
            total_calls_today: 0,
            models: BTreeMap::new(),
        };
        for row in rows {
            let model: String = row.get("model");
            let usage = ModelUsage {
                total_tokens: row.get("total_tokens"),
                call_count: row.get("call_count"),
            };
            report.total_tokens_today += usage.total_tokens;
            report.total_calls_today += usage.call_count;
            report.models.insert(model, usage);
        }
        Ok(report)
    }

    /// Dates with recorded usage, newest first.
    pub async fn list_available_dates(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT date FROM usage_stats ORDER BY date DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("date")).collect())
    }

    /// Drop all usage rows for a date. Returns the number removed.
    pub async fn delete_usage(&self, date: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM usage_stats WHERE date = ?1")
            .bind(date)
            .execute(&self.pool)
            .await?;
        self.invalidate_cache().await;
        Ok(result.rows_affected())
    }

    /// Last persisted upstream client version, if any.
    pub async fn get_version(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT version FROM app_version WHERE key = ?1")
            .bind(VERSION_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("version")))
    }

    /// Persist the upstream client version.
    pub async fn put_version(&self, version: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO app_version (key, version, updated_at) VALUES (?1, ?2, ?3)",
        )
        .bind(VERSION_KEY)
        .bind(version)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        self.invalidate_cache().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(access: &str, refresh: &str, expires_at: Option<i64>) -> TokenData {
        TokenData {
            access_token: access.into(),
            refresh_token: refresh.into(),
            expires_at,
            uploaded_at: 1_700_000_000_000,
            usage_count: 0,
        }
    }

    #[tokio::test]
    async fn upsert_then_load_roundtrips() {
        let store = Store::open_in_memory().await.unwrap();
        let t = token("at_1", "RRRRRRRR_tail", Some(2_000_000_000_000));
        store.upsert_token("RRRRRRRR", &t).await.unwrap();

        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["RRRRRRRR"], t);
    }

    #[tokio::test]
    async fn upsert_replaces_whole_row() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_token("id1", &token("at_old", "rt_old", None))
            .await
            .unwrap();

        let mut replacement = token("at_new", "rt_new", Some(99));
        replacement.usage_count = 7;
        store.upsert_token("id1", &replacement).await.unwrap();

        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all["id1"], replacement);
    }

    #[tokio::test]
    async fn credential_update_preserves_counters() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_token("id1", &token("at_old", "rt_old", Some(1)))
            .await
            .unwrap();
        store.increment_token_call_count("id1").await.unwrap();
        store.increment_token_call_count("id1").await.unwrap();

        let existed = store
            .update_token_credentials("id1", "at_new", "rt_new", Some(99))
            .await
            .unwrap();
        assert!(existed);

        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all["id1"].access_token, "at_new");
        assert_eq!(all["id1"].refresh_token, "rt_new");
        assert_eq!(all["id1"].expires_at, Some(99));
        assert_eq!(all["id1"].uploaded_at, 1_700_000_000_000);
        assert_eq!(all["id1"].usage_count, 2, "counters must survive the update");
    }

    #[tokio::test]
    async fn credential_update_on_missing_row_reports_absence() {
        let store = Store::open_in_memory().await.unwrap();
        let existed = store
            .update_token_credentials("ghost", "at", "rt", None)
            .await
            .unwrap();
        assert!(!existed);
        assert!(store.load_all_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nullable_expiry_survives_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_token("id1", &token("at", "rt", None))
            .await
            .unwrap();
        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all["id1"].expires_at, None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_token("id1", &token("at", "rt", None))
            .await
            .unwrap();

        assert!(store.delete_token("id1").await.unwrap());
        assert!(!store.delete_token("id1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_all_empties_the_pool() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_token("a", &token("at_a", "rt_a", None))
            .await
            .unwrap();
        store
            .upsert_token("b", &token("at_b", "rt_b", None))
            .await
            .unwrap();

        assert_eq!(store.delete_all_tokens().await.unwrap(), 2);
        assert!(store.load_all_tokens().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_invalidate_the_read_cache() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_token("a", &token("at_a", "rt_a", None))
            .await
            .unwrap();
        // Prime the cache
        assert_eq!(store.load_all_tokens().await.unwrap().len(), 1);

        store.delete_token("a").await.unwrap();
        assert!(
            store.load_all_tokens().await.unwrap().is_empty(),
            "stale cache served after a write"
        );
    }

    #[tokio::test]
    async fn usage_accumulates_tokens_and_calls() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .increment_usage("2025-01-01", "qwen3-coder-plus", 100)
            .await
            .unwrap();
        store
            .increment_usage("2025-01-01", "qwen3-coder-plus", 50)
            .await
            .unwrap();
        store
            .increment_usage("2025-01-01", "qwen3-coder-flash", 10)
            .await
            .unwrap();

        let report = store.read_usage("2025-01-01").await.unwrap();
        assert_eq!(report.total_tokens_today, 160);
        assert_eq!(report.total_calls_today, 3);
        assert_eq!(
            report.models["qwen3-coder-plus"],
            ModelUsage {
                total_tokens: 150,
                call_count: 2
            }
        );
        assert_eq!(
            report.models["qwen3-coder-flash"],
            ModelUsage {
                total_tokens: 10,
                call_count: 1
            }
        );
    }

    #[tokio::test]
    async fn unknown_date_reports_zeros() {
        let store = Store::open_in_memory().await.unwrap();
        let report = store.read_usage("1999-12-31").await.unwrap();
        assert_eq!(report.total_tokens_today, 0);
        assert_eq!(report.total_calls_today, 0);
        assert!(report.models.is_empty());
    }

    #[tokio::test]
    async fn available_dates_newest_first() {
        let store = Store::open_in_memory().await.unwrap();
        store.increment_usage("2025-01-01", "m", 1).await.unwrap();
        store.increment_usage("2025-03-01", "m", 1).await.unwrap();
        store.increment_usage("2025-02-01", "m", 1).await.unwrap();

        let dates = store.list_available_dates().await.unwrap();
        assert_eq!(dates, vec!["2025-03-01", "2025-02-01", "2025-01-01"]);
    }

    #[tokio::test]
    async fn delete_usage_reports_removed_rows() {
        let store = Store::open_in_memory().await.unwrap();
        store.increment_usage("2025-01-01", "a", 1).await.unwrap();
        store.increment_usage("2025-01-01", "b", 1).await.unwrap();

        assert_eq!(store.delete_usage("2025-01-01").await.unwrap(), 2);
        let report = store.read_usage("2025-01-01").await.unwrap();
        assert_eq!(report.total_tokens_today, 0);
        assert_eq!(store.delete_usage("2025-01-01").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn token_call_count_increments() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .upsert_token("id1", &token("at", "rt", None))
            .await
            .unwrap();

        store.increment_token_call_count("id1").await.unwrap();
        store.increment_token_call_count("id1").await.unwrap();

        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all["id1"].usage_count, 2);
    }

    #[tokio::test]
    async fn version_roundtrip_and_overwrite() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.get_version().await.unwrap(), None);

        store.put_version("0.0.10").await.unwrap();
        assert_eq!(store.get_version().await.unwrap().as_deref(), Some("0.0.10"));

        store.put_version("0.0.11").await.unwrap();
        assert_eq!(store.get_version().await.unwrap().as_deref(), Some("0.0.11"));
    }

    #[tokio::test]
    async fn open_creates_parent_directory_and_migrates_legacy_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("tokens.db");

        // Seed a legacy database missing the call_count column
        {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let options = SqliteConnectOptions::new()
                .filename(&path)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            sqlx::query(
                "CREATE TABLE usage_stats (
                     date TEXT NOT NULL,
                     model TEXT NOT NULL,
                     total_tokens INTEGER NOT NULL DEFAULT 0,
                     PRIMARY KEY (date, model)
                 )",
            )
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query("INSERT INTO usage_stats (date, model, total_tokens) VALUES ('2024-12-31', 'm', 5)")
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;
        }

        let store = Store::open(&path).await.unwrap();
        let report = store.read_usage("2024-12-31").await.unwrap();
        assert_eq!(report.total_tokens_today, 5);
        assert_eq!(report.models["m"].call_count, 0, "migrated column defaults to 0");

        // The migrated column participates in new upserts
        store.increment_usage("2024-12-31", "m", 5).await.unwrap();
        let report = store.read_usage("2024-12-31").await.unwrap();
        assert_eq!(report.models["m"].call_count, 1);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.db");

        {
            let store = Store::open(&path).await.unwrap();
            store
                .upsert_token("id1", &token("at", "rt", Some(1)))
                .await
                .unwrap();
        }

        let store = Store::open(&path).await.unwrap();
        let all = store.load_all_tokens().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["id1"].access_token, "at");
    }
}
