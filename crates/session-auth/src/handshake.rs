//! Client-credentials handshake and session validation
//!
//! Two endpoint interactions against the upstream auth service:
//! 1. `POST {auth_url}/token` exchanges a client id + secret for a session token
//! 2. `GET {auth_url}/session` checks whether a stored token is still accepted
//!
//! Status mapping is shared: 401/403 mean the credential itself is bad, 429
//! carries a back-off hint (`Retry-After` seconds, default 60), anything else
//! non-2xx is a token exchange failure.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Back-off applied when a 429 carries no usable `Retry-After` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Response from the token endpoint.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the token expires, when the endpoint reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

/// Exchange client credentials for a session token.
pub async fn authenticate(
    client: &reqwest::Client,
    auth_url: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenResponse> {
    let url = format!("{}/token", auth_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = retry_after_secs(response.headers());
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(status_error(status.as_u16(), retry_after, &body));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}

/// Check whether `token` is still an authorized session.
///
/// Returns `Ok(false)` when the endpoint rejects the token (401/403), so the
/// caller can fall back to a full handshake.
pub async fn validate(client: &reqwest::Client, auth_url: &str, token: &str) -> Result<bool> {
    let url = format!("{}/session", auth_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| Error::Http(format!("session check failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        return Ok(true);
    }
    let retry_after = retry_after_secs(response.headers());
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    match status_error(status.as_u16(), retry_after, &body) {
        Error::InvalidCredentials(_) => Ok(false),
        other => Err(other),
    }
}

fn status_error(status: u16, retry_after: Option<u64>, body: &str) -> Error {
    match status {
        401 | 403 => Error::InvalidCredentials(format!("auth endpoint returned {status}: {body}")),
        429 => Error::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        _ => Error::TokenExchange(format!("auth endpoint returned {status}: {body}")),
    }
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
