//! Refresh-token exchange
//!
//! POSTs `{"refreshToken": ...}` to the refresh endpoint through the shared
//! `Transport` and turns the reply into a new `CredentialPair`. The auth
//! server may or may not rotate the refresh token; when it doesn't, the old
//! one is kept.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use serde::{Deserialize, Serialize};
use transport::{HeaderValue, Method, Transport, TransportRequest, header};

use crate::credentials::{CredentialPair, now_millis};
use crate::error::{Error, Result};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Response body of the refresh endpoint.
///
/// `expires_in` is a delta in seconds, converted to an absolute estimate
/// when the pair is built.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(alias = "access_token")]
    pub access_token: String,
    #[serde(default, alias = "refresh_token")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "expires_in")]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// Build the replacement pair, keeping `previous_refresh` if the server didn't rotate it.
    pub fn into_pair(self, previous_refresh: &Secret<String>, now_millis: u64) -> CredentialPair {
        let expires_at = match self.expires_in {
            Some(secs) => Some(now_millis.saturating_add(secs.saturating_mul(1000))),
            None => jwt_expiry_millis(&self.access_token),
        };
        let refresh = match self.refresh_token {
            Some(rotated) if !rotated.is_empty() => rotated,
            _ => previous_refresh.expose().clone(),
        };
        CredentialPair::new(self.access_token, refresh).with_expiry(expires_at)
    }
}

/// Exchange `refresh` for a new credential pair.
///
/// 400/401/403 from the endpoint mean the refresh token is invalid, expired
/// or revoked (`InvalidCredentials`); other failures are `Http` or
/// `TokenExchange`.
pub async fn refresh_credentials(
    transport: &dyn Transport,
    endpoint: &str,
    refresh: &Secret<String>,
    timeout: Duration,
) -> Result<CredentialPair> {
    if refresh.is_empty() {
        return Err(Error::MissingRefreshToken);
    }

    let body = serde_json::to_vec(&RefreshRequest {
        refresh_token: refresh.expose(),
    })
    .map_err(|e| Error::TokenExchange(format!("encoding refresh request: {e}")))?;

    let mut request = TransportRequest::new(Method::POST, endpoint, timeout);
    request.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    request
        .headers
        .insert(header::ACCEPT, HeaderValue::from_static("application/json"));
    request.body = Some(body.into());

    let response = transport
        .execute(request)
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status;
    if !status.is_success() {
        let body = String::from_utf8_lossy(&response.body);
        let body = if body.trim().is_empty() {
            "<no body>"
        } else {
            body.trim()
        };

        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let token: TokenResponse = serde_json::from_slice(&response.body)
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))?;
    if token.access_token.is_empty() {
        return Err(Error::TokenExchange(
            "refresh response carried an empty access token".into(),
        ));
    }

    Ok(token.into_pair(refresh, now_millis()))
}

/// Read the `exp` claim (seconds) of a JWT access token as unix milliseconds.
///
/// Opaque tokens, malformed payloads and tokens without `exp` yield `None`.
/// The signature is not checked; this only feeds the expiry estimate.
pub fn jwt_expiry_millis(token: &str) -> Option<u64> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_u64()?.checked_mul(1000)
}
