//! `RequestEnvelope`: per-request derived state threaded through the
//! Dispatcher, Forwarder, and Broker.

use std::collections::BTreeMap;

use crate::core::url::NormalizedUrl;

#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub upstream: NormalizedUrl,
    pub referrer_key: String,
    /// Ordered key -> value map merged from the Resource's configured query
    /// and the request's own query string (spec §4.4).
    pub params: BTreeMap<String, String>,
}
