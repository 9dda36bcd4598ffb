//! The `Resource` data model: a configured upstream destination plus its
//! credentials, rate policy, and live mutable state (counters, cached token).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

use crate::core::url::NormalizedUrl;

/// One configured upstream destination.
///
/// Immutable except for `counters` and `cached_token`, which are mutated at
/// request time behind atomics / a per-resource lock.
#[derive(Debug)]
pub struct Resource {
    pub pattern: NormalizedUrl,
    pub match_all: bool,
    pub host_redirect: Option<NormalizedUrl>,
    pub credentials: Credentials,
    pub oauth2_endpoint: Option<String>,
    pub token_param_name: String,
    pub rate: Option<RatePolicy>,
    pub counters: Counters,
    pub cached_token: RwLock<Option<TokenCacheEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Static { token: String },
    User { username: String, password: String },
    App { client_id: String, client_secret: String },
}

impl Credentials {
    /// Whether this Resource participates in the Token Broker / retry-on-
    /// auth-expiry machinery at all.
    pub fn is_brokered(&self) -> bool {
        matches!(self, Credentials::User { .. } | Credentials::App { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub rate_limit: u32,
    pub rate_limit_period_minutes: u32,
}

impl RatePolicy {
    /// `windowSeconds = (rateLimitPeriod * 60) / rateLimit`, the per-window
    /// cap being `rateLimit` admissions (spec §4.6 / §9's adopted reading).
    pub fn window_seconds(&self) -> f64 {
        (self.rate_limit_period_minutes as f64 * 60.0) / self.rate_limit as f64
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub total_requests: AtomicU64,
    pub first_request_millis: AtomicI64,
    pub last_request_millis: AtomicI64,
}

impl Counters {
    pub fn record_dispatch(&self, now_millis: i64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.first_request_millis
            .compare_exchange(0, now_millis, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
        self.last_request_millis.store(now_millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, i64, i64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.first_request_millis.load(Ordering::Relaxed),
            self.last_request_millis.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone)]
pub struct TokenCacheEntry {
    pub value: String,
    pub acquired_at_millis: i64,
    pub expires_at_millis: i64,
}

impl TokenCacheEntry {
    pub fn is_live(&self, now_millis: i64) -> bool {
        now_millis < self.expires_at_millis
    }
}

impl Resource {
    pub fn is_rate_limited(&self) -> bool {
        self.rate.is_some()
    }

    /// Current cached token value, if a live one exists.
    pub fn live_token(&self, now_millis: i64) -> Option<String> {
        let guard = self.cached_token.read().expect("cached_token lock poisoned");
        guard
            .as_ref()
            .filter(|e| e.is_live(now_millis))
            .map(|e| e.value.clone())
    }

    /// Atomically replace the cached token.
    pub fn set_token(&self, entry: TokenCacheEntry) {
        let mut guard = self.cached_token.write().expect("cached_token lock poisoned");
        *guard = Some(entry);
    }

    /// Atomically clear the cached token (invalidation).
    pub fn invalidate_token(&self) {
        let mut guard = self.cached_token.write().expect("cached_token lock poisoned");
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_seconds_matches_spec_formula() {
        let p = RatePolicy {
            rate_limit: 3,
            rate_limit_period_minutes: 1,
        };
        assert!((p.window_seconds() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn counters_first_request_set_once() {
        let c = Counters::default();
        c.record_dispatch(100);
        c.record_dispatch(200);
        let (total, first, last) = c.snapshot();
        assert_eq!(total, 2);
        assert_eq!(first, 100);
        assert_eq!(last, 200);
    }

    #[test]
    fn token_cache_invalidate_clears_entry() {
        let res = Resource {
            pattern: NormalizedUrl::wildcard(),
            match_all: false,
            host_redirect: None,
            credentials: Credentials::None,
            oauth2_endpoint: None,
            token_param_name: "token".to_string(),
            rate: None,
            counters: Counters::default(),
            cached_token: RwLock::new(None),
        };
        res.set_token(TokenCacheEntry {
            value: "abc".to_string(),
            acquired_at_millis: 0,
            expires_at_millis: 1_000_000,
        });
        assert_eq!(res.live_token(1), Some("abc".to_string()));
        res.invalidate_token();
        assert_eq!(res.live_token(1), None);
    }
}
