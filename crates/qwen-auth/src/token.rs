//! Token data model and the refresh grant
//!
//! `TokenData` is the unit the whole system moves around: the store persists
//! it, the pool selects it, the dispatcher spends it. `refresh_grant` is the
//! one token-endpoint interaction that keeps a stored token alive.

use serde::{Deserialize, Serialize};

use crate::constants::OAuthConfig;
use crate::error::{Error, Result};

/// Fallback access-token lifetime when the token endpoint omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// A pool member's OAuth tokens plus bookkeeping.
///
/// Timestamps are unix epoch milliseconds. `expires_at` is nullable: an
/// unknown expiry is treated as not-yet-expired and left to the refresh
/// cycle to firm up. `uploaded_at` is set once at first insert and survives
/// every subsequent refresh; `usage_count` only ever grows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<i64>,
    pub uploaded_at: i64,
    pub usage_count: i64,
}

impl TokenData {
    /// Token just issued or uploaded now; unknown expiry defaults to one hour
    /// from now.
    pub fn new(
        access_token: String,
        refresh_token: String,
        expires_at: Option<i64>,
        now_ms: i64,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: expires_at.or(Some(now_ms + DEFAULT_EXPIRES_IN_SECS * 1000)),
            uploaded_at: now_ms,
            usage_count: 0,
        }
    }

    /// A token is expired iff it has a known expiry in the past.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| now_ms > at)
    }
}

/// Successful response from the token endpoint (device grant or refresh).
///
/// `expires_in` is a delta in seconds from the response time; callers convert
/// it to an absolute millisecond timestamp. The refresh grant may omit
/// `refresh_token`, in which case the previous one stays valid.
#[derive(Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

impl TokenGrant {
    /// Absolute expiry for this grant, relative to `now_ms`.
    pub fn expires_at(&self, now_ms: i64) -> i64 {
        now_ms + self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) * 1000
    }
}

/// Refresh an access token using its refresh token.
///
/// Succeeds only on HTTP 200 with a JSON body that carries `access_token`
/// and no `error` field; anything else (transport failure, non-200,
/// unparseable body, error payload) is an `Err` and the caller decides
/// whether the token is evicted.
pub async fn refresh_grant(
    client: &reqwest::Client,
    cfg: &OAuthConfig,
    refresh_token: &str,
    user_agent: &str,
) -> Result<TokenGrant> {
    let response = client
        .post(cfg.token_endpoint())
        .header(reqwest::header::USER_AGENT, user_agent)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", cfg.client_id.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading refresh response: {e}")))?;

    if !status.is_success() {
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    let value: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;

    if let Some(err) = value.get("error") {
        let description = value
            .get("error_description")
            .and_then(|d| d.as_str())
            .unwrap_or_default();
        return Err(Error::TokenExchange(format!("{err} - {description}")));
    }

    serde_json::from_value::<TokenGrant>(value)
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}
