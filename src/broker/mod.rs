//! Token Broker: acquires, caches, refreshes, and single-flights upstream
//! bearer tokens on behalf of credential-bearing Resources (spec §4.5).

pub mod app_flow;
pub mod extract;
pub mod user_flow;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{FutureExt, Shared};
use reqwest::Client;
use tokio::sync::Mutex;

use crate::core::error::ProxyError;
use crate::core::resource::{Credentials, Resource, TokenCacheEntry};

/// Cap applied when the upstream does not declare a token lifetime, per
/// spec §4.5: "min(server-declared expiry, 55 minutes) if expiry is
/// unreported" — read as a 55 minute ceiling either way.
const MAX_TOKEN_LIFETIME_SECS: u64 = 55 * 60;

type InFlight = Shared<std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, String>> + Send>>>;

pub struct TokenBroker {
    client: Client,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl TokenBroker {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self {
            client,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a valid token for `resource`, using the cache when live, or
    /// acquiring a fresh one. Concurrent callers for the same resource
    /// attach to a single in-flight acquisition and observe its outcome.
    pub async fn acquire(
        &self,
        resource: &Arc<Resource>,
        referrer_key: &str,
        now_millis: i64,
    ) -> Result<String, ProxyError> {
        if let Some(token) = resource.live_token(now_millis) {
            return Ok(token);
        }

        let key = resource.pattern.to_url_string();

        let fut = {
            let mut guard = self.in_flight.lock().await;
            if let Some(existing) = guard.get(&key) {
                existing.clone()
            } else {
                let resource = resource.clone();
                let client = self.client.clone();
                let referrer_key = referrer_key.to_string();

                let task: std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, String>> + Send>> =
                    Box::pin(async move { run_acquisition(&client, &resource, &referrer_key).await });

                let shared = task.shared();
                guard.insert(key.clone(), shared.clone());
                shared
            }
        };

        let result = fut.await;

        // Only the acquisition's own caller needs to clean the slot; a
        // second cleanup attempt by a concurrent caller is harmless since
        // HashMap::remove is idempotent.
        self.in_flight.lock().await.remove(&key);

        let token_value = result.map_err(ProxyError::TokenAcquisitionFailed)?;
        Ok(token_value)
    }

    /// Invalidates the cached token and forces a fresh acquisition.
    pub async fn refresh(
        &self,
        resource: &Arc<Resource>,
        referrer_key: &str,
        now_millis: i64,
    ) -> Result<String, ProxyError> {
        resource.invalidate_token();
        self.acquire(resource, referrer_key, now_millis).await
    }
}

async fn run_acquisition(client: &Client, resource: &Resource, referrer_key: &str) -> Result<String, String> {
    let server_url = resource.pattern.to_url_string();

    let (token_value, expires_in) = match &resource.credentials {
        Credentials::App {
            client_id,
            client_secret,
        } => {
            let endpoint = resource
                .oauth2_endpoint
                .as_deref()
                .ok_or_else(|| "resource has app credentials but no oauth2Endpoint configured".to_string())?;
            app_flow::acquire_app_token(client, endpoint, client_id, client_secret, &server_url)
                .await
                .map_err(|e| e.to_string())?
        }
        Credentials::User { username, password } => {
            user_flow::acquire_user_token(client, &server_url, referrer_key, username, password)
                .await
                .map_err(|e| e.to_string())?
        }
        Credentials::Static { .. } | Credentials::None => {
            return Err("resource is not credential-bearing".to_string());
        }
    };

    let lifetime_secs = expires_in
        .unwrap_or(MAX_TOKEN_LIFETIME_SECS)
        .min(MAX_TOKEN_LIFETIME_SECS);

    let now = now_millis();
    resource.set_token(TokenCacheEntry {
        value: token_value.clone(),
        acquired_at_millis: now,
        expires_at_millis: now + (lifetime_secs as i64 * 1000),
    });

    Ok(token_value)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resource::Counters;
    use crate::core::url::NormalizedUrl;
    use std::sync::RwLock;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app_resource(oauth2_endpoint: String, server_url: &str) -> Arc<Resource> {
        Arc::new(Resource {
            pattern: crate::core::url::parse_standard_url(server_url),
            match_all: false,
            host_redirect: None,
            credentials: Credentials::App {
                client_id: "cid".to_string(),
                client_secret: "secret".to_string(),
            },
            oauth2_endpoint: Some(oauth2_endpoint),
            token_param_name: "token".to_string(),
            rate: None,
            counters: Counters::default(),
            cached_token: RwLock::new(None),
        })
    }

    #[tokio::test]
    async fn concurrent_acquisitions_share_in_flight_result() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token":"PORTAL"}"#))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/generateToken"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token":"SERVER_TOKEN"}"#))
            .mount(&server)
            .await;

        let endpoint = format!("{}/oauth2", server.uri());
        let resource = app_resource(endpoint, &format!("{}/rest/services/Foo", server.uri()));

        let broker = Arc::new(TokenBroker::new(Duration::from_secs(5)));

        let b1 = broker.clone();
        let r1 = resource.clone();
        let b2 = broker.clone();
        let r2 = resource.clone();

        let (t1, t2) = tokio::join!(
            tokio::spawn(async move { b1.acquire(&r1, "*", 0).await }),
            tokio::spawn(async move { b2.acquire(&r2, "*", 0).await }),
        );

        assert_eq!(t1.unwrap().unwrap(), "SERVER_TOKEN");
        assert_eq!(t2.unwrap().unwrap(), "SERVER_TOKEN");
    }

    #[tokio::test]
    async fn cached_live_token_short_circuits_network_call() {
        let resource = app_resource("http://unused.invalid/oauth2".to_string(), "http://unused.invalid/rest/services/Foo");
        resource.set_token(TokenCacheEntry {
            value: "CACHED".to_string(),
            acquired_at_millis: 0,
            expires_at_millis: i64::MAX,
        });

        let broker = TokenBroker::new(Duration::from_secs(5));
        let token = broker.acquire(&resource, "*", 1).await.unwrap();
        assert_eq!(token, "CACHED");
    }

    #[test]
    fn normalized_url_unaffected_by_unused_import() {
        let _ = NormalizedUrl::wildcard();
    }
}
