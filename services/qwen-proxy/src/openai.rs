//! OpenAI-compatible surface
//!
//! Exactly two endpoints: a static model listing and chat completions
//! proxied through the dispatcher. Authentication is the same shared bearer
//! password as the admin surface, applied by router middleware.

use axum::Json;
use axum::extract::State;
use axum::response::Response;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::AppState;

/// GET /v1/models
pub async fn list_models() -> Json<Value> {
    let created = chrono::Utc::now().timestamp();
    Json(json!({
        "object": "list",
        "data": [
            {
                "id": "qwen3-coder-plus",
                "object": "model",
                "created": created,
                "owned_by": "qwen",
            },
            {
                "id": "qwen3-coder-flash",
                "object": "model",
                "created": created,
                "owned_by": "qwen",
            },
        ],
    }))
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    state.dispatcher.forward_chat(payload).await
}
