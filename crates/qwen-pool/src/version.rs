//! Upstream client version probe
//!
//! The upstream expects a `User-Agent` matching its own CLI, so the proxy
//! tracks the CLI's published version: npm registry first (cached for an
//! hour, persisted to the store), then the store's last known value, then a
//! hard-coded floor. Lookups are best-effort and bounded: a dead registry
//! must never stall a chat request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use qwen_store::Store;

/// Published version registry for the Qwen Code CLI.
const REGISTRY_URL: &str = "https://registry.npmjs.org/@qwen-code/qwen-code/latest";

/// Floor version when nothing was ever probed or persisted.
const DEFAULT_VERSION: &str = "0.0.10";

const CACHE_TTL: Duration = Duration::from_secs(3600);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 2;

/// Outer bound on the whole fetch-with-retry sequence.
const FETCH_DEADLINE: Duration = Duration::from_secs(6);

/// Bound on how long a `user_agent()` caller may be blocked.
const USER_AGENT_DEADLINE: Duration = Duration::from_secs(2);

/// Best-effort cached lookup of the upstream CLI version.
pub struct VersionProbe {
    store: Arc<Store>,
    http: reqwest::Client,
    registry_url: String,
    cached: RwLock<Option<(String, Instant)>>,
}

impl VersionProbe {
    pub fn new(store: Arc<Store>, http: reqwest::Client) -> Self {
        Self {
            store,
            http,
            registry_url: REGISTRY_URL.to_string(),
            cached: RwLock::new(None),
        }
    }

    /// Point the probe at a different registry (tests).
    pub fn with_registry_url(mut self, url: impl Into<String>) -> Self {
        self.registry_url = url.into();
        self
    }

    /// Current version: fresh cache, else registry, else store, else default.
    pub async fn version(&self) -> String {
        if let Some(version) = self.fresh_cached().await {
            return version;
        }

        match tokio::time::timeout(FETCH_DEADLINE, self.fetch_with_retry()).await {
            Ok(Some(version)) => {
                *self.cached.write().await = Some((version.clone(), Instant::now()));
                if let Err(e) = self.store.put_version(&version).await {
                    warn!(error = %e, "failed to persist probed version");
                }
                debug!(%version, "version probed from registry");
                version
            }
            _ => self.fallback().await,
        }
    }

    /// `User-Agent` for all upstream calls, bounded to ~2s.
    ///
    /// On its own timeout, falls back to whatever is cached (fresh or stale)
    /// without further I/O.
    pub async fn user_agent(&self) -> String {
        let version = match tokio::time::timeout(USER_AGENT_DEADLINE, self.version()).await {
            Ok(version) => version,
            Err(_) => self
                .any_cached()
                .await
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
        };
        format!("QwenCode/{version} (linux; x64)")
    }

    /// Drop the cache and probe again (scheduler tick).
    pub async fn refresh(&self) -> String {
        *self.cached.write().await = None;
        self.version().await
    }

    async fn fresh_cached(&self) -> Option<String> {
        let cached = self.cached.read().await;
        cached
            .as_ref()
            .filter(|(_, at)| at.elapsed() < CACHE_TTL)
            .map(|(version, _)| version.clone())
    }

    async fn any_cached(&self) -> Option<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .map(|(version, _)| version.clone())
    }

    async fn fallback(&self) -> String {
        // A stale cache entry beats a database round trip here
        if let Some(version) = self.any_cached().await {
            return version;
        }
        match self.store.get_version().await {
            Ok(Some(version)) => {
                *self.cached.write().await = Some((version.clone(), Instant::now()));
                version
            }
            Ok(None) => DEFAULT_VERSION.to_string(),
            Err(e) => {
                warn!(error = %e, "failed to read persisted version");
                DEFAULT_VERSION.to_string()
            }
        }
    }

    async fn fetch_with_retry(&self) -> Option<String> {
        for attempt in 0..=MAX_RETRIES {
            match self.fetch_from_registry().await {
                Some(version) => return Some(version),
                None if attempt < MAX_RETRIES => {
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt) + 1)).await;
                }
                None => {}
            }
        }
        None
    }

    async fn fetch_from_registry(&self) -> Option<String> {
        let response = self
            .http
            .get(&self.registry_url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let value = response.json::<serde_json::Value>().await.ok()?;
        value
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}
