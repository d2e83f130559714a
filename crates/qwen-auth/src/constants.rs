//! Qwen OAuth client configuration
//!
//! Public OAuth client defaults matching the Qwen Code CLI. These values are
//! not secrets; they identify the public client application. The actual
//! secrets (access/refresh tokens) live in the token store.

/// Default OAuth base URL (device-code and token endpoints hang off this).
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://chat.qwen.ai";

/// Qwen's public OAuth client ID (same as the Qwen Code CLI)
pub const DEFAULT_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

/// OAuth scopes required for model completion access
pub const DEFAULT_SCOPE: &str = "openid profile email model.completion";

/// RFC 8628 device-code grant type
pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// OAuth client configuration, overridable via environment.
///
/// The endpoints are derived from `base_url` so a single variable repoints
/// the whole flow (useful for tests, which stand up a local token endpoint).
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub base_url: String,
    pub client_id: String,
    pub scope: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OAUTH_BASE_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }
}

impl OAuthConfig {
    /// Device authorization endpoint (RFC 8628 §3.1)
    pub fn device_code_endpoint(&self) -> String {
        format!("{}/api/v1/oauth2/device/code", self.base_url)
    }

    /// Token endpoint, shared by the device grant and refresh grant
    pub fn token_endpoint(&self) -> String {
        format!("{}/api/v1/oauth2/token", self.base_url)
    }
}
