//! Device-flow coordinator: the per-state-id state machine
//!
//! Each pending device flow lives under a random `state_id` in an in-memory
//! map; nothing here is persisted. A flow moves Pending → Authorized when
//! the token endpoint grants, or ends on cancel or expiry (plus a 10-second
//! grace window). Polls within the last minute before expiry short-circuit
//! with a warning instead of touching the network.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use common::clock::now_ms;

use crate::constants::OAuthConfig;
use crate::device::{self, DevicePoll};
use crate::error::{Error, Result};
use crate::pkce;
use crate::token::TokenData;

/// Outer deadline for the whole init call (PKCE + device-code request).
const INIT_DEADLINE: Duration = Duration::from_secs(10);

/// Per-request timeout for the device-code post, inside the outer deadline.
const INIT_HTTP_TIMEOUT: Duration = Duration::from_secs(8);

/// How long after expiry a state is still recognized (and reported expired).
const EXPIRY_GRACE_MS: i64 = 10_000;

/// Polls within this window of expiry return a warning without a wire call.
const EXPIRY_WARN_MS: i64 = 60_000;

/// Ceiling for the poll interval after `slow_down` growth.
const MAX_POLL_INTERVAL_SECS: f64 = 10.0;

/// Fallback poll interval when the server suggests none.
const DEFAULT_POLL_INTERVAL_SECS: f64 = 2.0;

/// A pending device flow. Mutated only by `poll` (interval adjustment);
/// removed on success, cancel, or expiry.
#[derive(Debug, Clone)]
struct OAuthState {
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: String,
    code_verifier: String,
    expires_at_ms: i64,
    poll_interval_secs: f64,
}

/// Response to a successful `init`: everything the admin UI needs to show
/// the user code and start polling.
#[derive(Debug, Clone)]
pub struct DeviceFlowStarted {
    pub state_id: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_at: i64,
    pub expires_in: i64,
}

/// Outcome of one `poll` call, in terms the admin surface maps to JSON.
#[derive(Debug)]
pub enum PollReply {
    /// Keep polling; `warning` is set when the device code is about to expire.
    Pending {
        remaining_secs: i64,
        warning: Option<&'static str>,
    },
    /// The user authorized; the state is gone and the token is ready to store.
    Authorized(TokenData),
    /// No flow under this state id (never existed, or already consumed).
    InvalidState,
    /// The device code expired; the state has been evicted.
    Expired,
    /// Terminal failure from the token endpoint; the state has been evicted.
    Terminal(String),
}

/// Coordinates pending device flows against the authorization server.
pub struct OAuthCoordinator {
    cfg: OAuthConfig,
    http: reqwest::Client,
    states: Mutex<HashMap<String, OAuthState>>,
}

impl OAuthCoordinator {
    pub fn new(cfg: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            cfg,
            http,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Start a device flow: generate PKCE, request a device code, stash the
    /// state under a fresh state id.
    ///
    /// The whole call is bounded by [`INIT_DEADLINE`]; a timeout maps to
    /// [`Error::InitTimeout`] so the surface can answer in-band instead of
    /// hanging the admin UI.
    pub async fn init(&self, user_agent: &str) -> Result<DeviceFlowStarted> {
        match tokio::time::timeout(INIT_DEADLINE, self.init_inner(user_agent)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("device flow init exceeded {INIT_DEADLINE:?}");
                Err(Error::InitTimeout)
            }
        }
    }

    async fn init_inner(&self, user_agent: &str) -> Result<DeviceFlowStarted> {
        let verifier = pkce::generate_verifier();
        let challenge = pkce::compute_challenge(&verifier);

        let authorization = tokio::time::timeout(
            INIT_HTTP_TIMEOUT,
            device::request_device_code(&self.http, &self.cfg, &challenge, user_agent),
        )
        .await
        .map_err(|_| Error::InitTimeout)??;

        let now = now_ms();
        let expires_at = now + authorization.expires_in * 1000;
        let state = OAuthState {
            device_code: authorization.device_code,
            user_code: authorization.user_code.clone(),
            verification_uri: authorization.verification_uri.clone(),
            verification_uri_complete: authorization.verification_uri_complete.clone(),
            code_verifier: verifier,
            expires_at_ms: expires_at,
            poll_interval_secs: authorization.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        };

        let state_id = pkce::new_state_id();
        self.states.lock().await.insert(state_id.clone(), state);
        info!(%state_id, "device flow initiated");

        Ok(DeviceFlowStarted {
            state_id,
            user_code: authorization.user_code,
            verification_uri: authorization.verification_uri,
            verification_uri_complete: authorization.verification_uri_complete,
            expires_at,
            expires_in: (expires_at - now) / 1000,
        })
    }

    /// Drive a pending flow one step forward.
    pub async fn poll(&self, state_id: &str, user_agent: &str) -> PollReply {
        let now = now_ms();

        // Snapshot the state under the lock; the wire call happens outside it.
        let snapshot = {
            let mut states = self.states.lock().await;
            match states.get(state_id) {
                None => return PollReply::InvalidState,
                Some(state) if now > state.expires_at_ms + EXPIRY_GRACE_MS => {
                    states.remove(state_id);
                    info!(state_id, "device code expired, state evicted");
                    return PollReply::Expired;
                }
                Some(state) if now > state.expires_at_ms - EXPIRY_WARN_MS => {
                    return PollReply::Pending {
                        remaining_secs: remaining_secs(state.expires_at_ms, now),
                        warning: Some(
                            "device code is about to expire, complete authorization soon",
                        ),
                    };
                }
                Some(state) => state.clone(),
            }
        };

        let outcome = device::poll_device_token(
            &self.http,
            &self.cfg,
            &snapshot.device_code,
            &snapshot.code_verifier,
            user_agent,
        )
        .await;

        match outcome {
            Ok(DevicePoll::Granted(grant)) => {
                let Some(refresh_token) = grant.refresh_token.clone() else {
                    self.states.lock().await.remove(state_id);
                    return PollReply::Terminal(
                        "grant response missing refresh_token".to_string(),
                    );
                };
                let expires_at = grant.expires_at(now);
                let token = TokenData::new(
                    grant.access_token,
                    refresh_token,
                    Some(expires_at),
                    now,
                );
                self.states.lock().await.remove(state_id);
                info!(state_id, "device flow authorized");
                PollReply::Authorized(token)
            }
            Ok(DevicePoll::AuthorizationPending) => PollReply::Pending {
                remaining_secs: remaining_secs(snapshot.expires_at_ms, now),
                warning: None,
            },
            Ok(DevicePoll::SlowDown) => {
                let mut states = self.states.lock().await;
                if let Some(state) = states.get_mut(state_id) {
                    state.poll_interval_secs =
                        (state.poll_interval_secs * 1.5).min(MAX_POLL_INTERVAL_SECS);
                    debug!(
                        state_id,
                        interval_secs = state.poll_interval_secs,
                        "server asked to slow down"
                    );
                }
                PollReply::Pending {
                    remaining_secs: remaining_secs(snapshot.expires_at_ms, now),
                    warning: None,
                }
            }
            Ok(DevicePoll::Denied { status, message }) => {
                // 401 means the grant is dead no matter how the body words it
                if status == 401 {
                    self.states.lock().await.remove(state_id);
                    warn!(state_id, status, error = %message, "device flow rejected, state evicted");
                    PollReply::Terminal(message)
                } else {
                    self.classify_failure(state_id, message).await
                }
            }
            Err(e) => self.classify_failure(state_id, e.to_string()).await,
        }
    }

    /// Drop a pending flow if present. Idempotent.
    pub async fn cancel(&self, state_id: &str) {
        if self.states.lock().await.remove(state_id).is_some() {
            info!(state_id, "device flow cancelled");
        }
    }

    /// Number of pending flows (admin visibility).
    pub async fn pending_count(&self) -> usize {
        self.states.lock().await.len()
    }

    /// Terminal failures evict the state; everything else keeps the flow
    /// pending for the next poll.
    async fn classify_failure(&self, state_id: &str, message: String) -> PollReply {
        if is_terminal_message(&message) {
            self.states.lock().await.remove(state_id);
            warn!(state_id, error = %message, "device flow failed terminally");
            PollReply::Terminal(message)
        } else {
            debug!(state_id, error = %message, "transient poll failure, still pending");
            PollReply::Pending {
                remaining_secs: 0,
                warning: None,
            }
        }
    }

    /// Poll interval currently suggested for a state, if it exists.
    pub async fn poll_interval_secs(&self, state_id: &str) -> Option<f64> {
        self.states
            .lock()
            .await
            .get(state_id)
            .map(|s| s.poll_interval_secs)
    }

    #[cfg(test)]
    pub(crate) async fn rewind_expiry(&self, state_id: &str, expires_at_ms: i64) {
        if let Some(state) = self.states.lock().await.get_mut(state_id) {
            state.expires_at_ms = expires_at_ms;
        }
    }
}

fn remaining_secs(expires_at_ms: i64, now: i64) -> i64 {
    ((expires_at_ms - now) / 1000).max(0)
}

fn is_terminal_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timed out", "expired", "invalid", "401"]
        .iter()
        .any(|kw| lower.contains(kw))
}
