//! Upstream chat dispatcher
//!
//! One public operation: pick a valid token, forward the chat request, and
//! account usage after the response is done. Streaming responses are passed
//! through line-for-line and byte-exact; the proxy never injects, drops, or
//! reorders SSE frames. Accounting parses `data:` frames on the side and
//! commits only after the client stream has closed.
//!
//! The dispatcher never retries on a different token; upstream failures
//! surface to the caller as-is.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tiktoken_rs::CoreBPE;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use common::clock::today_iso;
use qwen_pool::{TokenPool, VersionProbe};
use qwen_store::Store;

use crate::error::ApiError;
use crate::metrics;

/// Model assumed when the client omits one.
const DEFAULT_MODEL: &str = "qwen3-coder-plus";

/// Overall per-request deadline against the upstream.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP connect deadline against the upstream.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Idle keep-alive for pooled upstream connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pooled connections kept per upstream host.
const POOL_MAX_IDLE_PER_HOST: usize = 50;

/// Prompt/completion token estimator. The upstream does not require
/// byte-exact agreement with its own tokenizer, so one fixed encoding is
/// enough for accounting.
static TOKENIZER: LazyLock<CoreBPE> =
    LazyLock::new(|| tiktoken_rs::cl100k_base().expect("embedded cl100k_base tables"));

pub fn count_tokens(text: &str) -> i64 {
    TOKENIZER.encode_with_special_tokens(text).len() as i64
}

/// Client-facing chat request; unknown fields are dropped, the body sent
/// upstream is rebuilt from these explicitly.
#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Option<Vec<Value>>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stream: bool,
}

/// Forwards chat requests upstream over one long-lived tuned client.
pub struct Dispatcher {
    http: reqwest::Client,
    endpoint: String,
    pool: Arc<TokenPool>,
    store: Arc<Store>,
    version: Arc<VersionProbe>,
    tz: chrono_tz::Tz,
}

impl Dispatcher {
    pub fn new(
        endpoint: String,
        pool: Arc<TokenPool>,
        store: Arc<Store>,
        version: Arc<VersionProbe>,
        tz: chrono_tz::Tz,
    ) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .timeout(UPSTREAM_TIMEOUT)
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .build()
            .expect("upstream client construction is infallible with static options");
        Self {
            http,
            endpoint,
            pool,
            store,
            version,
            tz,
        }
    }

    /// Validate, select a token, forward, and (eventually) account.
    pub async fn forward_chat(&self, payload: Value) -> Result<Response, ApiError> {
        let request: ChatRequest = serde_json::from_value(payload)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;

        let messages = match request.messages {
            Some(messages) if !messages.is_empty() => messages,
            _ => return Err(ApiError::BadRequest("Invalid messages".into())),
        };
        let model = request.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let stream = request.stream;

        let prompt_tokens: i64 = messages
            .iter()
            .map(|message| count_tokens(&stringify_content(message)))
            .sum();

        self.pool.reload().await?;
        let (token_id, token) = self
            .pool
            .select_valid()
            .await
            .ok_or(ApiError::NoCredentials)?;

        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        debug!(%request_id, %model, stream, prompt_tokens, %token_id, "forwarding chat request");

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(0.5),
            "top_p": request.top_p.unwrap_or(1.0),
            "stream": stream,
        });

        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let user_agent = self.version.user_agent().await;

        let response = self
            .http
            .post(&self.endpoint)
            .header(header::AUTHORIZATION, format!("Bearer {}", token.access_token))
            .header(header::ACCEPT, accept)
            .header(header::USER_AGENT, user_agent)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                metrics::record_upstream_error("connect");
                ApiError::UpstreamConnect(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%request_id, status = status.as_u16(), "upstream rejected chat request");
            metrics::record_upstream_error("status");
            metrics::record_request(status.as_u16(), stream);
            return Err(ApiError::Upstream(status.as_u16()));
        }
        metrics::record_request(status.as_u16(), stream);

        if stream {
            Ok(self.stream_response(response, request_id, token_id, model, prompt_tokens))
        } else {
            self.buffered_response(response, request_id, token_id, model, prompt_tokens)
                .await
        }
    }

    /// Byte-exact SSE passthrough with side-channel accounting.
    ///
    /// A pump task reads the upstream body, forwards every line (newline
    /// included) to the client channel in order, and accumulates kept deltas
    /// for accounting. Client disconnect aborts the upstream read; whatever
    /// was processed up to that point is still accounted.
    fn stream_response(
        &self,
        response: reqwest::Response,
        request_id: String,
        token_id: String,
        model: String,
        prompt_tokens: i64,
    ) -> Response {
        let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::convert::Infallible>>(32);
        let store = self.store.clone();
        let pool = self.pool.clone();
        let tz = self.tz;

        tokio::spawn(async move {
            let mut upstream = response.bytes_stream();
            let mut buffer = BytesMut::new();
            let mut accumulator = DeltaAccumulator::default();
            let mut client_gone = false;

            'read: while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(%request_id, error = %e, "upstream stream ended abnormally");
                        metrics::record_upstream_error("stream");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line = buffer.split_to(pos + 1).freeze();
                    accumulator.absorb(&line[..line.len() - 1]);
                    if tx.send(Ok(line)).await.is_err() {
                        info!(%request_id, "client disconnected mid-stream");
                        client_gone = true;
                        break 'read;
                    }
                }
            }

            if !client_gone && !buffer.is_empty() {
                let _ = tx.send(Ok(buffer.freeze())).await;
            }

            // Close the client stream, then commit accounting. A stream that
            // produced no completion text counts as nothing served.
            drop(tx);
            if !accumulator.completion.is_empty() {
                let total = prompt_tokens + count_tokens(&accumulator.completion);
                let today = today_iso(tz);
                if let Err(e) = store.increment_usage(&today, &model, total).await {
                    warn!(%request_id, error = %e, "failed to record streamed usage");
                }
                if let Err(e) = pool.record_usage(&token_id).await {
                    warn!(%request_id, error = %e, "failed to bump token usage count");
                }
                debug!(%request_id, total_tokens = total, "streamed usage recorded");
            }
        });

        (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(ReceiverStream::new(rx)),
        )
            .into_response()
    }

    /// Buffered passthrough: relay the upstream JSON verbatim, preferring its
    /// own usage total over our estimate.
    async fn buffered_response(
        &self,
        response: reqwest::Response,
        request_id: String,
        token_id: String,
        model: String,
        prompt_tokens: i64,
    ) -> Result<Response, ApiError> {
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::Internal(format!("invalid upstream response: {e}")))?;

        let total = value
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(prompt_tokens);

        let today = today_iso(self.tz);
        if let Err(e) = self.store.increment_usage(&today, &model, total).await {
            warn!(%request_id, error = %e, "failed to record usage");
        }
        if let Err(e) = self.pool.record_usage(&token_id).await {
            warn!(%request_id, error = %e, "failed to bump token usage count");
        }
        debug!(%request_id, total_tokens = total, "usage recorded");

        Ok(Json(value).into_response())
    }
}

/// Accumulates streamed completion text for accounting.
///
/// Consecutive identical deltas are kept once: some upstreams emit a
/// cumulative frame followed by the same frame incrementally. The dedup is
/// heuristic, so each suppression is logged.
#[derive(Default)]
struct DeltaAccumulator {
    completion: String,
    last_delta: String,
}

impl DeltaAccumulator {
    fn absorb(&mut self, line: &[u8]) {
        let Ok(line) = std::str::from_utf8(line) else {
            return;
        };
        let Some(payload) = line.strip_prefix("data:") else {
            return;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(frame) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        let Some(content) = frame
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        else {
            return;
        };
        if content.is_empty() {
            return;
        }
        if content == self.last_delta {
            debug!(delta = content, "duplicate delta suppressed in accounting");
            return;
        }
        self.last_delta = content.to_string();
        self.completion.push_str(content);
    }
}

/// Token-estimation input for one message: the content string itself, or the
/// JSON rendering of structured content.
fn stringify_content(message: &Value) -> String {
    match message.get("content") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
