//! RFC 8628 device authorization grant wire calls
//!
//! Two interactions with the authorization server: requesting a device code
//! (with the PKCE challenge) and polling the token endpoint with that code.
//! Both are form posts; both surface the server's in-band `error` field
//! rather than relying on status codes alone.

use serde::Deserialize;

use crate::constants::{DEVICE_GRANT_TYPE, OAuthConfig};
use crate::error::{Error, Result};
use crate::token::TokenGrant;

/// Response from the device authorization endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    /// Seconds until the device code expires
    pub expires_in: i64,
    /// Suggested poll interval in seconds; servers may omit it
    #[serde(default)]
    pub interval: Option<f64>,
}

/// Outcome of one token-endpoint poll for a pending device flow.
///
/// `AuthorizationPending` and `SlowDown` are the RFC's "keep waiting"
/// signals; `Denied` carries the HTTP status and the server's message so the
/// caller can classify the failure as terminal or transient (a 401 is always
/// terminal regardless of the error code in the body).
#[derive(Debug)]
pub enum DevicePoll {
    Granted(TokenGrant),
    AuthorizationPending,
    SlowDown,
    Denied { status: u16, message: String },
}

/// Request a device code, user code, and verification URI.
pub async fn request_device_code(
    client: &reqwest::Client,
    cfg: &OAuthConfig,
    code_challenge: &str,
    user_agent: &str,
) -> Result<DeviceAuthorization> {
    let response = client
        .post(cfg.device_code_endpoint())
        .header(reqwest::header::USER_AGENT, user_agent)
        .form(&[
            ("client_id", cfg.client_id.as_str()),
            ("scope", cfg.scope.as_str()),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("device code request failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading device code response: {e}")))?;

    if !status.is_success() {
        return Err(Error::DeviceAuthorization(format!(
            "{status}: {body}"
        )));
    }

    let value: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| Error::DeviceAuthorization(format!("invalid response: {e}")))?;

    if let Some(err) = value.get("error") {
        let description = value
            .get("error_description")
            .and_then(|d| d.as_str())
            .unwrap_or_default();
        return Err(Error::DeviceAuthorization(format!("{err} - {description}")));
    }

    serde_json::from_value::<DeviceAuthorization>(value)
        .map_err(|e| Error::DeviceAuthorization(format!("invalid response: {e}")))
}

/// Poll the token endpoint with a device code.
///
/// Maps the RFC's wire shapes onto [`DevicePoll`]; only transport failures
/// are `Err`.
pub async fn poll_device_token(
    client: &reqwest::Client,
    cfg: &OAuthConfig,
    device_code: &str,
    code_verifier: &str,
    user_agent: &str,
) -> Result<DevicePoll> {
    let response = client
        .post(cfg.token_endpoint())
        .header(reqwest::header::USER_AGENT, user_agent)
        .form(&[
            ("grant_type", DEVICE_GRANT_TYPE),
            ("client_id", cfg.client_id.as_str()),
            ("device_code", device_code),
            ("code_verifier", code_verifier),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("device token poll failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading poll response: {e}")))?;

    if status.is_success() {
        let value: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| Error::TokenExchange(format!("invalid grant response: {e}")))?;
        if value.get("error").is_some() {
            return Ok(denied_from(status.as_u16(), &value));
        }
        let grant = serde_json::from_value::<TokenGrant>(value)
            .map_err(|e| Error::TokenExchange(format!("invalid grant response: {e}")))?;
        return Ok(DevicePoll::Granted(grant));
    }

    // Non-200: distinguish the RFC's pending/slow-down signals from real
    // denials via the error field.
    let error_code = serde_json::from_str::<serde_json::Value>(&body).ok();
    let code = error_code
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.as_str())
        .unwrap_or_default()
        .to_string();

    match (status.as_u16(), code.as_str()) {
        (400, "authorization_pending") => Ok(DevicePoll::AuthorizationPending),
        (429, "slow_down") => Ok(DevicePoll::SlowDown),
        _ => match error_code {
            Some(value) if value.get("error").is_some() => {
                Ok(denied_from(status.as_u16(), &value))
            }
            _ => Ok(DevicePoll::Denied {
                status: status.as_u16(),
                message: format!("{status}: {body}"),
            }),
        },
    }
}

fn denied_from(status: u16, value: &serde_json::Value) -> DevicePoll {
    let code = value
        .get("error")
        .and_then(|e| e.as_str())
        .unwrap_or("unknown_error");
    let description = value
        .get("error_description")
        .and_then(|d| d.as_str())
        .unwrap_or_default();
    DevicePoll::Denied {
        status,
        message: format!("{code} - {description}"),
    }
}
