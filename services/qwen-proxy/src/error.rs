//! Service error type and its HTTP mapping
//!
//! Every handler returns `Result<_, ApiError>`; the `IntoResponse` impl is
//! the single place an error kind becomes a status code and a JSON body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error kinds the surface distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    AuthRejected,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("no valid token")]
    NoCredentials,

    #[error("API error: {0}")]
    Upstream(u16),

    #[error("upstream request failed: {0}")]
    UpstreamConnect(String),

    #[error("scheduler is not available")]
    SchedulerDisabled,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::AuthRejected => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::NoCredentials => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) | ApiError::UpstreamConnect(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::SchedulerDisabled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<qwen_store::Error> for ApiError {
    fn from(e: qwen_store::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<qwen_pool::Error> for ApiError {
    fn from(e: qwen_pool::Error) -> Self {
        match e {
            qwen_pool::Error::NotFound(id) => ApiError::NotFound(format!("token not found: {id}")),
            qwen_pool::Error::SchedulerNotRunning => ApiError::SchedulerDisabled,
            qwen_pool::Error::InvalidInterval => {
                ApiError::BadRequest("refresh interval must be at least 1 minute".into())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::AuthRejected.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NoCredentials.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Upstream(502).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::SchedulerDisabled.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn upstream_error_embeds_status() {
        assert_eq!(ApiError::Upstream(429).to_string(), "API error: 429");
    }

    #[test]
    fn pool_not_found_maps_to_404() {
        let e: ApiError = qwen_pool::Error::NotFound("abc".into()).into();
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn scheduler_not_running_maps_to_503() {
        let e: ApiError = qwen_pool::Error::SchedulerNotRunning.into();
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
