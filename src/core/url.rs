//! URL Normalizer: collapses every textual representation the proxy has to
//! deal with (standard URLs, proxy-addressed tail paths, referrer strings)
//! into one fixed shape so the Matcher never has to reparse.

use std::fmt;

/// `(protocol, host, port, path, query)`, each component defaulted to `*`
/// when absent (`port` always defaults to `*`; `path` defaults to `*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub protocol: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub query: String,
}

impl NormalizedUrl {
    pub fn wildcard() -> Self {
        Self {
            protocol: "*".to_string(),
            host: "*".to_string(),
            port: "*".to_string(),
            path: "*".to_string(),
            query: String::new(),
        }
    }

    pub fn to_url_string(&self) -> String {
        let mut s = String::new();
        if self.protocol != "*" {
            s.push_str(&self.protocol);
            s.push_str("://");
        }
        s.push_str(&self.host);
        if self.port != "*" {
            s.push(':');
            s.push_str(&self.port);
        }
        s.push_str(&self.path);
        if !self.query.is_empty() {
            s.push('?');
            s.push_str(&self.query);
        }
        s
    }
}

impl fmt::Display for NormalizedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url_string())
    }
}

/// Parses a standard `scheme://host[:port]/path?query` URL. Falls back to
/// treating the whole string as a bare host+path when no `://` is present.
pub fn parse_standard_url(input: &str) -> NormalizedUrl {
    let (protocol, rest) = match input.split_once("://") {
        Some((scheme, rest)) => (strip_trailing_colon(scheme), rest),
        None => ("*".to_string(), input),
    };

    let (authority, path_and_query) = split_authority(rest);
    let (host, port) = split_host_port(&authority);
    let (path, query) = split_path_query(path_and_query);

    promote_host_if_empty(NormalizedUrl {
        protocol,
        host,
        port,
        path,
        query,
    })
}

/// Parses a proxy-addressed tail: the portion of the request-line path after
/// the configured listen-prefix, stripped of its leading separator. Accepts
/// the legacy slash-encoded scheme convention (`http/`, `https/`, `*/`)
/// that lets callers avoid putting `://` inside a path.
pub fn parse_proxy_tail(tail: &str) -> NormalizedUrl {
    let tail = tail.trim_start_matches(['/', '?', '&']);

    let (protocol, rest) = if let Some(rest) = tail.strip_prefix("https/") {
        ("https".to_string(), rest)
    } else if let Some(rest) = tail.strip_prefix("http/") {
        ("http".to_string(), rest)
    } else if let Some(rest) = tail.strip_prefix("*/") {
        ("*".to_string(), rest)
    } else if tail.contains("://") {
        return parse_standard_url(tail);
    } else {
        ("*".to_string(), tail)
    };

    let (authority, path_and_query) = split_authority(rest);
    let (host, port) = split_host_port(&authority);
    let (path, query) = split_path_query(path_and_query);

    promote_host_if_empty(NormalizedUrl {
        protocol,
        host,
        port,
        path,
        query,
    })
}

/// Parses a `Referer` header value, or a bare/wildcard referrer pattern from
/// configuration (`host.example/path`, `*.example.com/*`).
pub fn parse_referrer(input: &str) -> NormalizedUrl {
    parse_standard_url(input.trim())
}

fn strip_trailing_colon(s: &str) -> String {
    s.trim_end_matches(':').to_string()
}

/// Splits `host[:port]/path?query` into `(authority, "/path?query")`.
fn split_authority(rest: &str) -> (String, &str) {
    match rest.find('/') {
        Some(idx) => (rest[..idx].to_string(), &rest[idx..]),
        None => match rest.find('?') {
            Some(idx) => (rest[..idx].to_string(), &rest[idx..]),
            None => (rest.to_string(), ""),
        },
    }
}

fn split_host_port(authority: &str) -> (String, String) {
    if authority.is_empty() {
        return (String::new(), "*".to_string());
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (host.to_string(), port.to_string())
        }
        _ => (authority.to_string(), "*".to_string()),
    }
}

fn split_path_query(path_and_query: &str) -> (String, String) {
    if path_and_query.is_empty() {
        return ("*".to_string(), String::new());
    }
    match path_and_query.split_once('?') {
        Some((path, query)) => (normalize_path(path), query.to_string()),
        None => (normalize_path(path_and_query), String::new()),
    }
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() || is_all_wildcard_path(path) {
        "*".to_string()
    } else {
        path.to_string()
    }
}

/// True for a path made up of `/` and at least one `*` segment, with no
/// other non-empty segment (`"/*"`, `"/*/*"`, ...) — these all mean "any
/// path" and collapse to the `"*"` sentinel so the Matcher's and Referrer
/// Validator's `path == "*"` fast path applies to them (spec §4.1's
/// wildcard referrer forms, e.g. `*.example.com/*`). A plain `"/"` has no
/// wildcard segment and is left alone.
fn is_all_wildcard_path(path: &str) -> bool {
    let mut segments = path.split('/').filter(|seg| !seg.is_empty());
    segments.clone().any(|seg| seg == "*") && segments.all(|seg| seg == "*")
}

/// If the parser yielded an empty host but a non-empty path, the first path
/// segment is promoted to the host and the remainder becomes the path.
fn promote_host_if_empty(mut u: NormalizedUrl) -> NormalizedUrl {
    if !u.host.is_empty() || u.path == "*" || u.path.is_empty() {
        return u;
    }

    let trimmed = u.path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((host, rest)) => {
            u.host = host.to_string();
            u.path = format!("/{rest}");
        }
        None => {
            u.host = trimmed.to_string();
            u.path = "*".to_string();
        }
    }
    u
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_url_full() {
        let u = parse_standard_url("http://tiles.example.com:8080/ArcGIS/rest?f=pjson");
        assert_eq!(u.protocol, "http");
        assert_eq!(u.host, "tiles.example.com");
        assert_eq!(u.port, "8080");
        assert_eq!(u.path, "/ArcGIS/rest");
        assert_eq!(u.query, "f=pjson");
    }

    #[test]
    fn standard_url_no_port() {
        let u = parse_standard_url("https://tiles.example.com/World/MapServer");
        assert_eq!(u.port, "*");
        assert_eq!(u.path, "/World/MapServer");
    }

    #[test]
    fn standard_url_trailing_scheme_colon_stripped() {
        let u = parse_standard_url("http://host/path");
        assert_eq!(u.protocol, "http");
    }

    #[test]
    fn proxy_tail_http_scheme() {
        let u = parse_proxy_tail("/http/tiles.example.com/ArcGIS/rest/services/World/MapServer?f=pjson");
        assert_eq!(u.protocol, "http");
        assert_eq!(u.host, "tiles.example.com");
        assert_eq!(u.path, "/ArcGIS/rest/services/World/MapServer");
        assert_eq!(u.query, "f=pjson");
    }

    #[test]
    fn proxy_tail_wildcard_scheme() {
        let u = parse_proxy_tail("/*/host.example/path");
        assert_eq!(u.protocol, "*");
        assert_eq!(u.host, "host.example");
        assert_eq!(u.path, "/path");
    }

    #[test]
    fn proxy_tail_bare_host() {
        let u = parse_proxy_tail("/host.example/path/to/thing");
        assert_eq!(u.protocol, "*");
        assert_eq!(u.host, "host.example");
        assert_eq!(u.path, "/path/to/thing");
    }

    #[test]
    fn proxy_tail_query_separator() {
        let u = parse_proxy_tail("?http://host.example/path");
        assert_eq!(u.protocol, "http");
        assert_eq!(u.host, "host.example");
    }

    #[test]
    fn referrer_bare_host_and_path() {
        let u = parse_referrer("host.example/path");
        assert_eq!(u.protocol, "*");
        assert_eq!(u.host, "host.example");
        assert_eq!(u.path, "/path");
    }

    #[test]
    fn referrer_wildcard_host() {
        let u = parse_referrer("*.example.com/*");
        assert_eq!(u.host, "*.example.com");
        assert_eq!(u.path, "*");
    }

    #[test]
    fn all_wildcard_path_collapses_to_sentinel() {
        assert_eq!(parse_referrer("host.example/*").path, "*");
        assert_eq!(parse_referrer("host.example/*/*").path, "*");
    }

    #[test]
    fn bare_root_path_is_not_collapsed_to_wildcard() {
        assert_eq!(parse_referrer("host.example/").path, "/");
    }

    #[test]
    fn mixed_wildcard_path_is_kept_as_a_literal_prefix() {
        assert_eq!(parse_referrer("host.example/a/*").path, "/a/*");
    }

    #[test]
    fn host_promotion_when_host_empty() {
        let u = promote_host_if_empty(NormalizedUrl {
            protocol: "*".to_string(),
            host: String::new(),
            port: "*".to_string(),
            path: "/host.example/rest/of/path".to_string(),
            query: String::new(),
        });
        assert_eq!(u.host, "host.example");
        assert_eq!(u.path, "/rest/of/path");
    }
}
