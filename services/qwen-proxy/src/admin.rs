//! Admin API handlers
//!
//! Thin bindings from the HTTP surface to the pool, coordinator, scheduler,
//! store, and dispatcher. Wire shapes use the camelCase keys the admin UI
//! expects; validation failures map through [`ApiError`].

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

use common::clock::{now_ms, today_iso};
use qwen_auth::{PollReply, token_id_for};
use qwen_auth::{TokenData, error::Error as AuthError};
use qwen_pool::RefreshScheduler;

use crate::error::ApiError;
use crate::state::AppState;

/// Outer bound for the version admin endpoint.
const VERSION_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(8);

/// POST /api/login: password check outside the bearer guard.
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let password = body.get("password").and_then(Value::as_str).unwrap_or("");
    if state.settings.api_password.matches(password) {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(ApiError::AuthRejected)
    }
}

#[derive(Deserialize)]
pub struct UploadTokenRequest {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expiry_date: Option<i64>,
}

/// POST /api/upload-token: insert a token pair obtained out of band.
pub async fn upload_token(
    State(state): State<AppState>,
    Json(body): Json<UploadTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let (access_token, refresh_token) = match (body.access_token, body.refresh_token) {
        (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
            (access, refresh)
        }
        _ => return Err(ApiError::BadRequest("Missing token fields".into())),
    };

    let id = token_id_for(&refresh_token);
    let token = TokenData::new(access_token, refresh_token, body.expiry_date, now_ms());
    state.pool.upsert(&id, token).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/token-status: pool projection after a fresh reload.
pub async fn token_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.pool.reload().await?;
    Ok(Json(state.pool.status().await).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenIdRequest {
    #[serde(default)]
    token_id: Option<String>,
}

/// POST /api/refresh-single-token: force-refresh one pool member.
pub async fn refresh_single_token(
    State(state): State<AppState>,
    Json(body): Json<TokenIdRequest>,
) -> Result<Json<Value>, ApiError> {
    let token_id = body
        .token_id
        .ok_or_else(|| ApiError::BadRequest("Missing tokenId".into()))?;

    state.pool.reload().await?;
    state.pool.refresh_single(&token_id).await?;
    Ok(Json(json!({
        "success": true,
        "tokenId": token_id,
        "message": "token refreshed",
    })))
}

/// POST /api/delete-token
pub async fn delete_token(
    State(state): State<AppState>,
    Json(body): Json<TokenIdRequest>,
) -> Result<Json<Value>, ApiError> {
    let token_id = body
        .token_id
        .ok_or_else(|| ApiError::BadRequest("Missing tokenId".into()))?;

    state.pool.reload().await?;
    if !state.pool.delete(&token_id).await? {
        return Err(ApiError::NotFound(format!("token not found: {token_id}")));
    }
    Ok(Json(json!({ "success": true, "tokenId": token_id })))
}

/// POST /api/delete-all-tokens
pub async fn delete_all_tokens(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    state.pool.reload().await?;
    let deleted = state.pool.delete_all().await?;
    Ok(Json(json!({ "success": true, "deletedCount": deleted })))
}

/// POST /api/refresh-token: fan-out refresh of the whole pool.
pub async fn refresh_all_tokens(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    state.pool.reload().await?;
    let summary = state.pool.refresh_all().await;
    Ok(Json(json!({
        "success": true,
        "refreshResults": summary.results,
        "remainingTokens": summary.remaining,
    })))
}

/// POST /api/oauth-init: start a device flow.
///
/// The init timeout answers in-band (`success: false`) rather than as an
/// error status so the admin UI can retry without special-casing.
pub async fn oauth_init(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let user_agent = state.version.user_agent().await;
    match state.coordinator.init(&user_agent).await {
        Ok(started) => Ok(Json(json!({
            "success": true,
            "stateId": started.state_id,
            "userCode": started.user_code,
            "verificationUri": started.verification_uri,
            "verificationUriComplete": started.verification_uri_complete,
            "expiresAt": started.expires_at,
            "expiresIn": started.expires_in,
        }))),
        Err(AuthError::InitTimeout) => Ok(Json(json!({
            "success": false,
            "error": "OAuth initialization timeout",
            "error_description": "The OAuth request timed out. Please try again.",
        }))),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateIdRequest {
    #[serde(default)]
    state_id: Option<String>,
}

/// POST /api/oauth-poll: drive a pending device flow forward.
pub async fn oauth_poll(
    State(state): State<AppState>,
    Json(body): Json<StateIdRequest>,
) -> Result<Json<Value>, ApiError> {
    let state_id = body
        .state_id
        .ok_or_else(|| ApiError::BadRequest("Missing stateId".into()))?;

    let user_agent = state.version.user_agent().await;
    match state.coordinator.poll(&state_id, &user_agent).await {
        PollReply::Authorized(token) => {
            let token_id = token_id_for(&token.refresh_token);
            state.pool.upsert(&token_id, token).await?;
            Ok(Json(json!({ "success": true, "tokenId": token_id })))
        }
        PollReply::Pending {
            remaining_secs,
            warning,
        } => {
            let mut reply = json!({
                "success": false,
                "status": "pending",
                "remainingTime": remaining_secs,
            });
            if let Some(warning) = warning {
                reply["warning"] = json!(warning);
            }
            Ok(Json(reply))
        }
        PollReply::InvalidState => Err(ApiError::BadRequest("invalid stateId".into())),
        PollReply::Expired => Err(ApiError::BadRequest("device code expired".into())),
        PollReply::Terminal(message) => Err(ApiError::Internal(message)),
    }
}

/// POST /api/oauth-cancel: idempotent.
pub async fn oauth_cancel(
    State(state): State<AppState>,
    Json(body): Json<StateIdRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(state_id) = body.state_id {
        state.coordinator.cancel(&state_id).await;
    }
    Ok(Json(json!({ "success": true, "message": "OAuth flow cancelled" })))
}

/// POST /api/chat: same dispatcher as the OpenAI-compatible surface.
pub async fn chat(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    state.dispatcher.forward_chat(payload).await
}

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    date: Option<String>,
}

/// GET /api/statistics/usage?date=YYYY-MM-DD: defaults to today local.
pub async fn usage_statistics(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Response, ApiError> {
    let date = query.date.unwrap_or_else(|| today_iso(state.settings.tz));
    let report = state.store.read_usage(&date).await?;
    Ok(Json(report).into_response())
}

/// GET /api/statistics/available-dates
pub async fn available_dates(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let dates = state.store.list_available_dates().await?;
    Ok(Json(json!({ "dates": dates })))
}

#[derive(Deserialize)]
pub struct DateRequest {
    #[serde(default)]
    date: Option<String>,
}

/// DELETE /api/statistics/usage: drop one day's counters.
pub async fn delete_usage_statistics(
    State(state): State<AppState>,
    Json(body): Json<DateRequest>,
) -> Result<Json<Value>, ApiError> {
    let date = body
        .date
        .ok_or_else(|| ApiError::BadRequest("Missing date".into()))?;
    let deleted = state.store.delete_usage(&date).await?;
    Ok(Json(json!({ "success": true, "deletedCount": deleted })))
}

/// GET /api/health: unauthenticated liveness probe.
pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.load_all_tokens().await {
        Ok(tokens) => Json(json!({
            "status": "ok",
            "timestamp": now_ms(),
            "database": { "status": "healthy", "token_count": tokens.len() },
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /api/metrics: JSON snapshot of pool health and today's usage.
pub async fn metrics_snapshot(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let tokens = state.store.load_all_tokens().await?;
    let now = now_ms();
    let valid = tokens.values().filter(|t| !t.is_expired(now)).count();
    let today = state.store.read_usage(&today_iso(state.settings.tz)).await?;

    Ok(Json(json!({
        "tokens": { "total": tokens.len(), "valid": valid },
        "usage": { "today": today },
        "performance": { "timestamp": now },
    })))
}

/// GET /api/version: probed upstream client version, bounded to 8s.
pub async fn upstream_version(State(state): State<AppState>) -> Json<Value> {
    match tokio::time::timeout(VERSION_ENDPOINT_TIMEOUT, state.version.version()).await {
        Ok(version) => Json(json!({ "version": version })),
        Err(_) => Json(json!({ "version": "unknown", "timeout": true })),
    }
}

fn scheduler(state: &AppState) -> Result<&RefreshScheduler, ApiError> {
    state
        .scheduler
        .as_deref()
        .ok_or(ApiError::SchedulerDisabled)
}

/// GET /api/scheduler/status
pub async fn scheduler_status(State(state): State<AppState>) -> Result<Response, ApiError> {
    let status = scheduler(&state)?.status().await;
    Ok(Json(status).into_response())
}

/// POST /api/scheduler/refresh-now: out-of-band sweep.
pub async fn scheduler_refresh_now(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    scheduler(&state)?.force_refresh_now().await?;
    Ok(Json(json!({ "success": true, "message": "refresh completed" })))
}

#[derive(Deserialize)]
pub struct IntervalRequest {
    #[serde(default)]
    minutes: Option<u64>,
}

/// POST /api/scheduler/interval: change the sweep cadence.
pub async fn scheduler_set_interval(
    State(state): State<AppState>,
    Json(body): Json<IntervalRequest>,
) -> Result<Json<Value>, ApiError> {
    let minutes = body
        .minutes
        .ok_or_else(|| ApiError::BadRequest("Missing minutes".into()))?;
    scheduler(&state)?.set_interval(minutes)?;
    Ok(Json(json!({ "success": true, "refreshInterval": minutes })))
}
