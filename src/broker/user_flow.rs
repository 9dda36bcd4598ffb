//! Username/password exchange flow.

use reqwest::Client;
use serde_json::Value;

use crate::broker::extract::{extract_expires_in_secs, extract_token};
use crate::core::error::ProxyError;

/// Derives the token-services info endpoint from a resource URL (spec
/// §4.5 step 1): strip from the first `/rest/` onward and append
/// `/rest/info`; falling back to `/sharing/` -> `/sharing/rest/info`;
/// falling back to appending `/arcgis/rest/info`.
pub fn derive_info_endpoint(resource_url: &str) -> String {
    if let Some(idx) = resource_url.find("/rest/") {
        return format!("{}/rest/info", &resource_url[..idx]);
    }
    if let Some(idx) = resource_url.find("/sharing/") {
        return format!("{}/sharing/rest/info", &resource_url[..idx]);
    }
    format!("{}/arcgis/rest/info", resource_url.trim_end_matches('/'))
}

/// Runs the user-credential exchange described in spec §4.5:
/// GET the info endpoint, locate the token-services URL, POST credentials,
/// extract the resulting token.
pub async fn acquire_user_token(
    client: &Client,
    resource_url: &str,
    referrer: &str,
    username: &str,
    password: &str,
) -> Result<(String, Option<u64>), ProxyError> {
    let info_endpoint = derive_info_endpoint(resource_url);

    let info_resp = client
        .get(&info_endpoint)
        .query(&[("f", "json")])
        .send()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("info request failed: {e}")))?;

    let info_body = info_resp
        .text()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("reading info body failed: {e}")))?;

    let token_services_url = token_services_url_from_info(&info_body)
        .ok_or_else(|| ProxyError::TokenAcquisitionFailed("no tokenServicesUrl in info response".to_string()))?;

    let resp = client
        .post(&token_services_url)
        .form(&[
            ("request", "getToken"),
            ("f", "json"),
            ("referer", referrer),
            ("expiration", "60"),
            ("username", username),
            ("password", password),
        ])
        .send()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("getToken request failed: {e}")))?;

    let body = resp
        .text()
        .await
        .map_err(|e| ProxyError::TokenAcquisitionFailed(format!("reading getToken body failed: {e}")))?;

    let token = extract_token(&body)
        .ok_or_else(|| ProxyError::TokenAcquisitionFailed("no token in getToken response".to_string()))?;
    let expires_in = extract_expires_in_secs(&body);

    Ok((token, expires_in))
}

/// Reads `authInfo.tokenServicesUrl`, falling back to
/// `owningSystemUrl + "/sharing/generateToken"` when absent.
fn token_services_url_from_info(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;

    if let Some(url) = value
        .get("authInfo")
        .and_then(|a| a.get("tokenServicesUrl"))
        .and_then(Value::as_str)
    {
        return Some(url.to_string());
    }

    value
        .get("owningSystemUrl")
        .and_then(Value::as_str)
        .map(|base| format!("{}/sharing/generateToken", base.trim_end_matches('/')))
}
