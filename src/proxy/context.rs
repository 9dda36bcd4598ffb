//! Per-connection proxy state and the per-request context pingora hands
//! back to every `ProxyHttp` callback.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::broker::TokenBroker;
use crate::config::model::ServerConfigToml;
use crate::core::referrer_pattern::ReferrerPattern;
use crate::core::resource::Resource;
use crate::ratelimit::RateLimiter;

/// A consistent snapshot of the Resource table, the Referrer allow-list, and
/// the server settings that govern dispatch. Rewritten wholesale on config
/// reload; readers always see one atomically-swapped generation.
pub struct ProxyState {
    pub server: ServerConfigToml,
    pub resources: Vec<Arc<Resource>>,
    pub referrers: Vec<ReferrerPattern>,
}

pub type SharedProxyState = Arc<ArcSwap<ProxyState>>;

/// Per-request context: a borrowed snapshot of `ProxyState` plus the shared,
/// long-lived Broker/Limiter handles. Cheap to construct per request since
/// `ArcSwap::load` is a lock-free pointer read.
pub struct RequestContext {
    pub state: Arc<ProxyState>,
    pub broker: Arc<TokenBroker>,
    pub limiter: Arc<RateLimiter>,
    pub http_client: reqwest::Client,
}
