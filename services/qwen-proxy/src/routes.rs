//! Router assembly
//!
//! Two routers merged: a small public one (`/api/login`, `/api/health`) and
//! the guarded surface carrying every other admin endpoint plus the
//! OpenAI-compatible routes, all behind the shared bearer guard.

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::state::AppState;
use crate::{admin, auth, openai};

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/login", post(admin::login))
        .route("/api/health", get(admin::health));

    let guarded = Router::new()
        .route("/api/upload-token", post(admin::upload_token))
        .route("/api/token-status", get(admin::token_status))
        .route("/api/refresh-single-token", post(admin::refresh_single_token))
        .route("/api/delete-token", post(admin::delete_token))
        .route("/api/delete-all-tokens", post(admin::delete_all_tokens))
        .route("/api/refresh-token", post(admin::refresh_all_tokens))
        .route("/api/oauth-init", post(admin::oauth_init))
        .route("/api/oauth-poll", post(admin::oauth_poll))
        .route("/api/oauth-cancel", post(admin::oauth_cancel))
        .route("/api/chat", post(admin::chat))
        .route(
            "/api/statistics/usage",
            get(admin::usage_statistics).delete(admin::delete_usage_statistics),
        )
        .route("/api/statistics/available-dates", get(admin::available_dates))
        .route("/api/metrics", get(admin::metrics_snapshot))
        .route("/api/version", get(admin::upstream_version))
        .route("/api/scheduler/status", get(admin::scheduler_status))
        .route("/api/scheduler/refresh-now", post(admin::scheduler_refresh_now))
        .route("/api/scheduler/interval", post(admin::scheduler_set_interval))
        .route("/v1/models", get(openai::list_models))
        .route("/v1/chat/completions", post(openai::chat_completions))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    public
        .merge(guarded)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
