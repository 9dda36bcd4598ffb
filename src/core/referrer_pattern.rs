//! Normalized allow-list entry for the Referrer Validator.

use crate::core::url::{parse_referrer, NormalizedUrl};

#[derive(Debug, Clone)]
pub struct ReferrerPattern {
    pub protocol: String,
    pub host: String,
    pub path: String,
    pub match_all: bool,
    /// Canonical string key used by the Rate Limiter to index meter rows.
    pub key: String,
}

/// Sentinel key used for the fast-path "accept any" allow-list entry.
pub const ACCEPT_ANY_KEY: &str = "*";

impl ReferrerPattern {
    pub fn from_pattern(raw: &str, match_all: bool) -> Self {
        if raw.trim() == "*" {
            return Self {
                protocol: "*".to_string(),
                host: "*".to_string(),
                path: "*".to_string(),
                match_all,
                key: ACCEPT_ANY_KEY.to_string(),
            };
        }
        let NormalizedUrl {
            protocol,
            host,
            path,
            ..
        } = parse_referrer(raw);
        let key = canonical_key(&protocol, &host, &path);
        Self {
            protocol,
            host,
            path,
            match_all,
            key,
        }
    }
}

pub fn canonical_key(protocol: &str, host: &str, path: &str) -> String {
    format!("{protocol}://{host}{path}")
}
