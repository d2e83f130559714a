//! Error types for pool operations

/// Errors from pool and scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token not found: {0}")]
    NotFound(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("store error: {0}")]
    Store(#[from] qwen_store::Error),

    #[error("scheduler is not running")]
    SchedulerNotRunning,

    #[error("refresh interval must be at least 1 minute")]
    InvalidInterval,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
