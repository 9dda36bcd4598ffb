//! Rate Limiter: keys meter rows by `(resource-url, referrer-key)` and runs
//! the fixed sliding-window admission algorithm (spec §4.6) against durable
//! storage.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::error::ProxyError;
use crate::core::referrer_pattern::ReferrerPattern;
use crate::core::resource::Resource;
use crate::ratelimit::storage::{MeterRow, MeterStorage};

pub struct RateLimiter {
    storage: Arc<dyn MeterStorage>,
}

impl RateLimiter {
    pub fn new(storage: Arc<dyn MeterStorage>) -> Self {
        Self { storage }
    }

    /// Preallocates a row for every (rate-limited Resource) x (Referrer
    /// Pattern) pair, so admission checks are pure updates (spec §4.6
    /// "Initialization").
    pub async fn initialize(&self, resources: &[Arc<Resource>], patterns: &[ReferrerPattern]) -> Result<(), ProxyError> {
        for resource in resources {
            if !resource.is_rate_limited() {
                continue;
            }
            let url = resource.pattern.to_url_string();
            for pattern in patterns {
                self.storage.ensure_row(&url, &pattern.key).await?;
            }
        }
        Ok(())
    }

    /// Drops and repopulates every row (spec §4.6 "Refresh").
    pub async fn refresh(&self, resources: &[Arc<Resource>], patterns: &[ReferrerPattern]) -> Result<(), ProxyError> {
        self.storage.reset().await?;
        self.initialize(resources, patterns).await
    }

    /// Admits or denies a request against the given Resource's rate cap for
    /// `referrer_key`. Resources with no rate policy always admit.
    pub async fn check(&self, resource: &Resource, referrer_key: &str) -> Result<bool, ProxyError> {
        let Some(policy) = resource.rate else {
            return Ok(true);
        };

        let url = resource.pattern.to_url_string();
        let window_seconds = policy.window_seconds();
        let now = now_secs();

        self.storage
            .admit(&url, referrer_key, window_seconds, policy.rate_limit, now)
            .await
    }

    /// Every meter row, for the status page.
    pub async fn dump(&self) -> Result<Vec<(String, String, MeterRow)>, ProxyError> {
        self.storage.dump().await
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resource::{Counters, Credentials, RatePolicy};
    use crate::core::url::parse_standard_url;
    use crate::ratelimit::storage::SqliteMeterStorage;
    use std::sync::RwLock;

    fn rated_resource(url: &str, rate_limit: u32, period_minutes: u32) -> Arc<Resource> {
        Arc::new(Resource {
            pattern: parse_standard_url(url),
            match_all: false,
            host_redirect: None,
            credentials: Credentials::None,
            oauth2_endpoint: None,
            token_param_name: "token".to_string(),
            rate: Some(RatePolicy {
                rate_limit,
                rate_limit_period_minutes: period_minutes,
            }),
            counters: Counters::default(),
            cached_token: RwLock::new(None),
        })
    }

    #[tokio::test]
    async fn unrated_resource_always_admits() {
        let storage = Arc::new(SqliteMeterStorage::open_in_memory().unwrap());
        let limiter = RateLimiter::new(storage);
        let resource = Resource {
            pattern: parse_standard_url("http://host/a"),
            match_all: false,
            host_redirect: None,
            credentials: Credentials::None,
            oauth2_endpoint: None,
            token_param_name: "token".to_string(),
            rate: None,
            counters: Counters::default(),
            cached_token: RwLock::new(None),
        };
        for _ in 0..10 {
            assert!(limiter.check(&resource, "*").await.unwrap());
        }
    }

    #[tokio::test]
    async fn initialize_preallocates_cartesian_product() {
        let storage = Arc::new(SqliteMeterStorage::open_in_memory().unwrap());
        let limiter = RateLimiter::new(storage.clone());

        let resources = vec![rated_resource("http://host/a", 3, 1)];
        let patterns = vec![
            ReferrerPattern::from_pattern("https://app.example.org", false),
            ReferrerPattern::from_pattern("https://other.example.org", false),
        ];

        limiter.initialize(&resources, &patterns).await.unwrap();

        for pattern in &patterns {
            let row = storage
                .ensure_row("http://host/a", &pattern.key)
                .await
                .unwrap();
            assert_eq!(row.window_count, 0);
        }
    }
}
