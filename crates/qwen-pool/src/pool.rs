//! Pool state and random load-balanced selection
//!
//! The in-memory map mirrors the store; every mutation writes through. The
//! pool never hands out references into the map; callers get owned clones.
//!
//! Selection deliberately ignores usage counts and recency: the snapshot is
//! permuted uniformly at random and the final pick is uniform over the valid
//! set, which balances load across small pools without bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::{IndexedRandom, SliceRandom};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use common::clock::{format_ms, now_ms};
use qwen_auth::{OAuthConfig, TokenData, refresh_grant};
use qwen_store::Store;

use crate::error::{Error, Result};
use crate::version::VersionProbe;

/// Result of one token refresh attempt.
///
/// Refresh failure is an ordinary outcome, not an error: the caller decides
/// whether the token is evicted.
#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed(TokenData),
    Failed(String),
}

/// Per-token entry in a fan-out refresh summary.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshResult {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a whole-pool refresh sweep.
#[derive(Debug, Clone)]
pub struct RefreshSummary {
    pub results: Vec<RefreshResult>,
    pub remaining: usize,
}

/// One token's projection for the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub id: String,
    pub expires_at: Option<i64>,
    pub expires_at_display: String,
    pub is_expired: bool,
    pub uploaded_at: i64,
    pub uploaded_at_display: String,
    pub usage_count: i64,
    /// Hint to the UI that an expired entry needs attention
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_failed: Option<bool>,
}

/// Pool-wide projection for the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub has_token: bool,
    pub token_count: usize,
    pub tokens: Vec<TokenStatus>,
}

/// The live token pool.
///
/// The `refresh_gate` serializes fan-out sweeps so concurrent refresh
/// triggers (scheduler tick + admin button) cannot double-refresh an id.
/// Selection works on a snapshot and does not take the gate.
pub struct TokenPool {
    store: Arc<Store>,
    tokens: RwLock<HashMap<String, TokenData>>,
    oauth: OAuthConfig,
    http: reqwest::Client,
    version: Arc<VersionProbe>,
    tz: chrono_tz::Tz,
    refresh_gate: Mutex<()>,
}

impl TokenPool {
    pub fn new(
        store: Arc<Store>,
        oauth: OAuthConfig,
        http: reqwest::Client,
        version: Arc<VersionProbe>,
        tz: chrono_tz::Tz,
    ) -> Self {
        Self {
            store,
            tokens: RwLock::new(HashMap::new()),
            oauth,
            http,
            version,
            tz,
            refresh_gate: Mutex::new(()),
        }
    }

    /// Replace the in-memory mirror with the store's current contents.
    ///
    /// Called before every status/refresh operation so tokens uploaded by
    /// other handlers (or a previous process) are picked up.
    pub async fn reload(&self) -> Result<()> {
        let loaded = self.store.load_all_tokens().await?;
        let mut tokens = self.tokens.write().await;
        *tokens = loaded;
        Ok(())
    }

    /// Insert or replace a token, writing through to the store.
    pub async fn upsert(&self, id: &str, token: TokenData) -> Result<()> {
        self.store.upsert_token(id, &token).await?;
        self.tokens.write().await.insert(id.to_string(), token);
        info!(token_id = id, "token stored");
        Ok(())
    }

    /// Remove a token from memory and store. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let in_memory = self.tokens.write().await.remove(id).is_some();
        let in_store = self.store.delete_token(id).await?;
        Ok(in_memory || in_store)
    }

    /// Empty the pool. Returns the number of tokens removed.
    pub async fn delete_all(&self) -> Result<usize> {
        let mut tokens = self.tokens.write().await;
        let count = tokens.len();
        tokens.clear();
        drop(tokens);
        self.store.delete_all_tokens().await?;
        info!(count, "all tokens deleted");
        Ok(count)
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }

    /// Owned clone of one token.
    pub async fn get(&self, id: &str) -> Option<TokenData> {
        self.tokens.read().await.get(id).cloned()
    }

    /// Pick one valid token for a request, or none.
    ///
    /// Walks a uniformly shuffled snapshot; expired members get one inline
    /// refresh attempt and join the valid set on success, or are evicted on
    /// failure. The final pick is uniform over the valid set.
    pub async fn select_valid(&self) -> Option<(String, TokenData)> {
        let mut entries: Vec<(String, TokenData)> = {
            let tokens = self.tokens.read().await;
            tokens
                .iter()
                .map(|(id, token)| (id.clone(), token.clone()))
                .collect()
        };
        if entries.is_empty() {
            return None;
        }

        {
            let mut rng = rand::rng();
            entries.shuffle(&mut rng);
        }

        let now = now_ms();
        let mut valid = Vec::with_capacity(entries.len());
        for (id, token) in entries {
            if !token.is_expired(now) {
                valid.push((id, token));
                continue;
            }
            match self.refresh_one(&token).await {
                RefreshOutcome::Refreshed(refreshed) => {
                    if let Err(e) = self.commit(&id, refreshed.clone()).await {
                        warn!(token_id = %id, error = %e, "failed to persist refreshed token");
                    }
                    valid.push((id, refreshed));
                }
                RefreshOutcome::Failed(reason) => {
                    warn!(token_id = %id, error = %reason, "inline refresh failed, evicting token");
                    self.evict(&id).await;
                }
            }
        }

        let mut rng = rand::rng();
        valid.choose(&mut rng).cloned()
    }

    /// One refresh-grant attempt. Preserves `uploaded_at` and `usage_count`;
    /// keeps the old refresh token when the response omits a new one.
    pub async fn refresh_one(&self, token: &TokenData) -> RefreshOutcome {
        let user_agent = self.version.user_agent().await;
        match refresh_grant(&self.http, &self.oauth, &token.refresh_token, &user_agent).await {
            Ok(grant) => {
                let now = now_ms();
                RefreshOutcome::Refreshed(TokenData {
                    expires_at: Some(grant.expires_at(now)),
                    refresh_token: grant
                        .refresh_token
                        .unwrap_or_else(|| token.refresh_token.clone()),
                    access_token: grant.access_token,
                    uploaded_at: token.uploaded_at,
                    usage_count: token.usage_count,
                })
            }
            Err(e) => RefreshOutcome::Failed(e.to_string()),
        }
    }

    /// Force-refresh one token by id; failure evicts it.
    pub async fn refresh_single(&self, id: &str) -> Result<()> {
        let _gate = self.refresh_gate.lock().await;
        let token = self
            .get(id)
            .await
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        match self.refresh_one(&token).await {
            RefreshOutcome::Refreshed(refreshed) => {
                self.commit(id, refreshed).await?;
                info!(token_id = id, "token refreshed");
                Ok(())
            }
            RefreshOutcome::Failed(reason) => {
                warn!(token_id = id, error = %reason, "refresh failed, evicting token");
                self.evict(id).await;
                Err(Error::RefreshFailed(reason))
            }
        }
    }

    /// Refresh every pool member; failures evict.
    ///
    /// Sequential under the refresh gate: pools are small and the gate is
    /// what guarantees an id is never refreshed twice concurrently.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let _gate = self.refresh_gate.lock().await;
        let entries: Vec<(String, TokenData)> = {
            let tokens = self.tokens.read().await;
            tokens
                .iter()
                .map(|(id, token)| (id.clone(), token.clone()))
                .collect()
        };

        let mut results = Vec::with_capacity(entries.len());
        for (id, token) in entries {
            match self.refresh_one(&token).await {
                RefreshOutcome::Refreshed(refreshed) => {
                    if let Err(e) = self.commit(&id, refreshed).await {
                        warn!(token_id = %id, error = %e, "failed to persist refreshed token");
                    }
                    metrics::counter!("pool_refresh_total", "outcome" => "success").increment(1);
                    results.push(RefreshResult {
                        id,
                        success: true,
                        error: None,
                    });
                }
                RefreshOutcome::Failed(reason) => {
                    warn!(token_id = %id, error = %reason, "refresh failed, evicting token");
                    self.evict(&id).await;
                    metrics::counter!("pool_refresh_total", "outcome" => "failure").increment(1);
                    results.push(RefreshResult {
                        id,
                        success: false,
                        error: Some(reason),
                    });
                }
            }
        }

        let remaining = self.len().await;
        RefreshSummary { results, remaining }
    }

    /// Status projection for the admin surface.
    pub async fn status(&self) -> PoolStatus {
        let tokens = self.tokens.read().await;
        let now = now_ms();

        let mut entries: Vec<TokenStatus> = tokens
            .iter()
            .map(|(id, token)| {
                let is_expired = token.is_expired(now);
                TokenStatus {
                    id: id.clone(),
                    expires_at: token.expires_at,
                    expires_at_display: token
                        .expires_at
                        .map(|at| format_ms(self.tz, at))
                        .unwrap_or_else(|| "unknown".to_string()),
                    is_expired,
                    uploaded_at: token.uploaded_at,
                    uploaded_at_display: format_ms(self.tz, token.uploaded_at),
                    usage_count: token.usage_count,
                    refresh_failed: is_expired.then_some(true),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        PoolStatus {
            has_token: !entries.is_empty(),
            token_count: entries.len(),
            tokens: entries,
        }
    }

    /// Account one served request against a token; the durable counter and
    /// the in-memory mirror move together.
    pub async fn record_usage(&self, id: &str) -> Result<()> {
        self.store.increment_token_call_count(id).await?;
        if let Some(token) = self.tokens.write().await.get_mut(id) {
            token.usage_count += 1;
        }
        Ok(())
    }

    /// Persist refreshed credentials and mirror them in memory.
    ///
    /// The store write is per-column: call-count increments racing the
    /// refresh must not be overwritten by the stale row image the refresh
    /// started from. Same on the in-memory side, where only the credential
    /// fields are replaced. A token deleted mid-refresh stays deleted.
    async fn commit(&self, id: &str, token: TokenData) -> Result<()> {
        let existed = self
            .store
            .update_token_credentials(
                id,
                &token.access_token,
                &token.refresh_token,
                token.expires_at,
            )
            .await?;

        let mut tokens = self.tokens.write().await;
        if existed {
            match tokens.get_mut(id) {
                Some(entry) => {
                    entry.access_token = token.access_token;
                    entry.refresh_token = token.refresh_token;
                    entry.expires_at = token.expires_at;
                }
                None => {
                    tokens.insert(id.to_string(), token);
                }
            }
        } else {
            tokens.remove(id);
            debug!(token_id = id, "token removed mid-refresh, not reinstated");
        }
        Ok(())
    }

    async fn evict(&self, id: &str) {
        self.tokens.write().await.remove(id);
        if let Err(e) = self.store.delete_token(id).await {
            warn!(token_id = id, error = %e, "failed to delete evicted token from store");
        }
        debug!(token_id = id, "token evicted");
    }
}
