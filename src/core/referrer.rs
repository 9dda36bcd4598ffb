//! Referrer Validator: accepts or rejects a `Referer` header against the
//! allow-list, returning the canonical key used for meter lookups.

use crate::core::matcher::host_matches;
use crate::core::referrer_pattern::{canonical_key, ReferrerPattern, ACCEPT_ANY_KEY};
use crate::core::url::parse_referrer;

pub enum ReferrerOutcome {
    Accepted(String),
    Rejected,
}

/// If `accept_any_referrer` is set, always returns the fast-path `*` key.
/// Otherwise normalizes `referer_header` and checks it against each pattern
/// in configuration order.
pub fn validate_referrer(
    referer_header: Option<&str>,
    accept_any_referrer: bool,
    patterns: &[ReferrerPattern],
) -> ReferrerOutcome {
    if accept_any_referrer {
        return ReferrerOutcome::Accepted(ACCEPT_ANY_KEY.to_string());
    }

    let Some(raw) = referer_header else {
        return ReferrerOutcome::Rejected;
    };

    let normalized = parse_referrer(raw);

    for pattern in patterns {
        if pattern.key == ACCEPT_ANY_KEY {
            return ReferrerOutcome::Accepted(ACCEPT_ANY_KEY.to_string());
        }
        let protocol_ok = pattern.protocol == "*" || pattern.protocol.eq_ignore_ascii_case(&normalized.protocol);
        let host_ok = host_matches(&normalized.host, &pattern.host);
        let path_ok = pattern.path == "*"
            || if pattern.match_all {
                normalized.path.eq_ignore_ascii_case(&pattern.path)
            } else {
                normalized.path.len() >= pattern.path.len()
                    && normalized.path[..pattern.path.len()].eq_ignore_ascii_case(&pattern.path)
            };

        if protocol_ok && host_ok && path_ok {
            return ReferrerOutcome::Accepted(pattern.key.clone());
        }
    }

    ReferrerOutcome::Rejected
}

/// Canonical key for an already-normalized, accepted referrer, used when no
/// pattern list applies (accept-any mode records the actual referrer's own
/// key rather than the sentinel, where callers want to differentiate
/// callers while still accepting everyone).
pub fn referrer_key_for(raw: &str) -> String {
    let n = parse_referrer(raw);
    canonical_key(&n.protocol, &n.host, &n.path)
}
