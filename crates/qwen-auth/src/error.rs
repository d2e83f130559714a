//! Error types for OAuth operations

/// Errors from device-flow and token-endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("device authorization failed: {0}")]
    DeviceAuthorization(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("OAuth initialization timeout")]
    InitTimeout,
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
