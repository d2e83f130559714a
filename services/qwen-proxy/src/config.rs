//! Environment configuration
//!
//! The variable set is closed; everything has a default suitable for local
//! runs except the password, which falls back to a development value that
//! must be overridden in production.

use std::path::PathBuf;

use common::{Error, Result, SecretString};
use qwen_auth::OAuthConfig;

/// Default admin password for local development only.
const DEV_PASSWORD: &str = "sk-123456";

/// Service configuration assembled from the environment.
#[derive(Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub api_password: SecretString,
    pub database_path: PathBuf,
    pub debug: bool,
    pub tz: chrono_tz::Tz,
    pub oauth: OAuthConfig,
    pub api_endpoint: String,
    /// Minutes between scheduled refresh sweeps
    pub refresh_interval_min: u64,
    pub scheduler_enabled: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let tz_name = env_or("TZ", "Asia/Shanghai");
        let tz = tz_name
            .parse::<chrono_tz::Tz>()
            .map_err(|_| Error::Config(format!("unknown timezone: {tz_name}")))?;

        let port = env_or("PORT", "3008")
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("invalid PORT: {e}")))?;

        let refresh_interval_min = env_or("TOKEN_REFRESH_INTERVAL", "30")
            .parse::<u64>()
            .map_err(|e| Error::Config(format!("invalid TOKEN_REFRESH_INTERVAL: {e}")))?;
        if refresh_interval_min < 1 {
            return Err(Error::Config(
                "TOKEN_REFRESH_INTERVAL must be at least 1 minute".into(),
            ));
        }

        let oauth = OAuthConfig {
            base_url: env_or("QWEN_OAUTH_BASE_URL", qwen_auth::constants::DEFAULT_OAUTH_BASE_URL),
            client_id: env_or("QWEN_OAUTH_CLIENT_ID", qwen_auth::constants::DEFAULT_CLIENT_ID),
            scope: env_or("QWEN_OAUTH_SCOPE", qwen_auth::constants::DEFAULT_SCOPE),
        };

        Ok(Self {
            host: env_or("HOST", "0.0.0.0"),
            port,
            api_password: SecretString::new(env_or("API_PASSWORD", DEV_PASSWORD)),
            database_path: PathBuf::from(env_or("DATABASE_URL", "data/tokens.db")),
            debug: env_flag("DEBUG"),
            tz,
            oauth,
            api_endpoint: env_or(
                "QWEN_API_ENDPOINT",
                "https://portal.qwen.ai/v1/chat/completions",
            ),
            refresh_interval_min,
            scheduler_enabled: std::env::var("SCHEDULER_ENABLED")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
