//! Token extraction: the Broker does not fully deserialize upstream
//! responses. It locates `token` with two textual rules, in order, so it can
//! pull a value out of mixed or partial bodies (spec §4.5).

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref QUERY_FORM: Regex = Regex::new(r#"[?&/]token=([^&\s"]*)"#).expect("static regex is valid");
    static ref JSON_FORM: Regex = Regex::new(r#""token"\s*:\s*"([^"]*)""#).expect("static regex is valid");
    static ref EXPIRES_FORM: Regex =
        Regex::new(r#""expires_in"\s*:\s*(\d+)|[?&]expires_in=(\d+)"#).expect("static regex is valid");
}

/// Best-effort extraction of a declared token lifetime in seconds, used to
/// cap the cache entry's lifetime (spec §4.5's caching rule).
pub fn extract_expires_in_secs(body: &str) -> Option<u64> {
    let caps = EXPIRES_FORM.captures(body)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extracts the `token` value from a response body. Query-string form is
/// tried first, then JSON form. Returns `None` if neither matches.
pub fn extract_token(body: &str) -> Option<String> {
    if let Some(caps) = QUERY_FORM.captures(body) {
        return Some(caps[1].to_string());
    }
    if let Some(caps) = JSON_FORM.captures(body) {
        return Some(caps[1].to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_json_form() {
        assert_eq!(
            extract_token(r#"{"token":"ABC123","expires":3600}"#),
            Some("ABC123".to_string())
        );
    }

    #[test]
    fn extracts_from_json_form_with_whitespace() {
        assert_eq!(
            extract_token(r#"{ "token" : "ABC123" }"#),
            Some("ABC123".to_string())
        );
    }

    #[test]
    fn extracts_from_query_form() {
        assert_eq!(
            extract_token("https://host/path?serverURL=foo&token=XYZ&expires=60"),
            Some("XYZ".to_string())
        );
    }

    #[test]
    fn extracts_from_query_form_at_end_of_string() {
        assert_eq!(extract_token("prefix&token=ZZZ"), Some("ZZZ".to_string()));
    }

    #[test]
    fn returns_none_when_absent() {
        assert_eq!(extract_token(r#"{"error":{"code":498}}"#), None);
    }

    #[test]
    fn extracts_expires_in_from_json() {
        assert_eq!(
            extract_expires_in_secs(r#"{"token":"X","expires_in":3600}"#),
            Some(3600)
        );
    }

    #[test]
    fn expires_in_absent_returns_none() {
        assert_eq!(extract_expires_in_secs(r#"{"token":"X"}"#), None);
    }

    #[test]
    fn query_form_preferred_over_json_form_when_both_present() {
        // Mixed/partial bodies: query form is checked first per spec.
        let body = r#"?foo=bar&token=QUERY123 trailing junk "token":"JSON456""#;
        assert_eq!(extract_token(body), Some("QUERY123".to_string()));
    }
}
