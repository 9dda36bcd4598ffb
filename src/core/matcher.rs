//! Resource Matcher: first-match-wins linear scan over configured Resources.
//!
//! Deliberately a linear scan, not a trie: the spec's host-segment
//! wildcarding and "configuration order wins" rule don't fit a path-only
//! prefix router.

use std::borrow::Borrow;

use crate::core::resource::Resource;
use crate::core::url::NormalizedUrl;

/// Returns the first Resource in `resources` that matches `req`, per spec
/// §4.2. At most one Resource is ever returned. Generic over `Borrow<Resource>`
/// so callers can pass either a plain slice or a slice of `Arc<Resource>`
/// (the dispatcher holds the latter) without cloning.
pub fn match_resource<'a, R: Borrow<Resource>>(req: &NormalizedUrl, resources: &'a [R]) -> Option<&'a R> {
    resources.iter().find(|r| matches(req, (*r).borrow()))
}

fn matches(req: &NormalizedUrl, resource: &Resource) -> bool {
    host_matches(&req.host, &resource.pattern.host)
        && protocol_matches(&req.protocol, &resource.pattern.protocol)
        && path_matches(&req.path, &resource.pattern.path, resource.match_all)
}

/// Split both hosts on `.`; equal segment count required; each segment
/// either `*` on the resource side or case-insensitive string-equal.
pub fn host_matches(req_host: &str, pattern_host: &str) -> bool {
    if pattern_host == "*" || req_host == "*" {
        return true;
    }
    let req_segs: Vec<&str> = req_host.split('.').collect();
    let pat_segs: Vec<&str> = pattern_host.split('.').collect();
    if req_segs.len() != pat_segs.len() {
        return false;
    }
    req_segs
        .iter()
        .zip(pat_segs.iter())
        .all(|(r, p)| *p == "*" || r.eq_ignore_ascii_case(p))
}

fn protocol_matches(req_protocol: &str, pattern_protocol: &str) -> bool {
    pattern_protocol == "*" || req_protocol == "*" || req_protocol.eq_ignore_ascii_case(pattern_protocol)
}

fn path_matches(req_path: &str, pattern_path: &str, match_all: bool) -> bool {
    if pattern_path == "*" {
        return true;
    }
    if match_all {
        req_path.eq_ignore_ascii_case(pattern_path)
    } else {
        req_path.len() >= pattern_path.len()
            && req_path[..pattern_path.len()].eq_ignore_ascii_case(pattern_path)
    }
}
