//! App-credential (OAuth2 client-credentials style) exchange flow.

use reqwest::Client;

use crate::broker::extract::{extract_expires_in_secs, extract_token};
use crate::core::error::ProxyError;

/// Runs the two-step app-credential exchange described in spec §4.5:
/// 1. exchange client id/secret for a portal token at `<oauth2_endpoint>/token`
/// 2. exchange the portal token for a server-scoped token at
///    `<oauth2_endpoint with /oauth2 -> /generateToken>`
///
/// Returns the server token plus its declared lifetime in seconds, if any.
pub async fn acquire_app_token(
    client: &Client,
    oauth2_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    server_url: &str,
) -> Result<(String, Option<u64>), ProxyError> {
    let token_url = format!("{}/token", oauth2_endpoint.trim_end_matches('/'));

    let portal_resp = client
        .post(&token_url)
        .form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "client_credentials"),
            ("f", "json"),
        ])
        .send()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("portal token request failed: {e}")))?;

    let portal_body = portal_resp
        .text()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("reading portal token body failed: {e}")))?;

    let portal_token = extract_token(&portal_body)
        .ok_or_else(|| ProxyError::TokenAcquisitionFailed("no portal token in response".to_string()))?;

    let generate_url = oauth2_endpoint.replacen("/oauth2", "/generateToken", 1);

    let server_resp = client
        .post(&generate_url)
        .form(&[
            ("token", portal_token.as_str()),
            ("serverURL", server_url),
            ("f", "json"),
        ])
        .send()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("server token request failed: {e}")))?;

    let server_body = server_resp
        .text()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("reading server token body failed: {e}")))?;

    let token = extract_token(&server_body)
        .ok_or_else(|| ProxyError::TokenAcquisitionFailed("no server token in response".to_string()))?;
    let expires_in = extract_expires_in_secs(&server_body);

    Ok((token, expires_in))
}
