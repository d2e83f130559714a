//! Shared application state
//!
//! Every component is an explicit `Arc` dependency injected at startup;
//! no globals, so tests construct isolated instances freely.

use std::sync::Arc;

use qwen_auth::OAuthCoordinator;
use qwen_pool::{RefreshScheduler, TokenPool, VersionProbe};
use qwen_store::Store;

use crate::config::Settings;
use crate::dispatcher::Dispatcher;

/// State shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub pool: Arc<TokenPool>,
    pub coordinator: Arc<OAuthCoordinator>,
    pub version: Arc<VersionProbe>,
    /// `None` when `SCHEDULER_ENABLED=false`; scheduler endpoints answer 503
    pub scheduler: Option<Arc<RefreshScheduler>>,
    pub dispatcher: Arc<Dispatcher>,
}
