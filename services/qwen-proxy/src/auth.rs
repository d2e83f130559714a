//! Shared bearer-password guard
//!
//! A single password gates every admin and OpenAI-compatible endpoint.
//! Applied as router middleware so individual handlers never see
//! unauthenticated requests.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .is_some_and(|candidate| state.settings.api_password.matches(candidate));

    if !authorized {
        return ApiError::AuthRejected.into_response();
    }
    next.run(request).await
}
