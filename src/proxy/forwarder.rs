//! Proxy Forwarder: parameter merging, host-redirect URL composition,
//! response inspection (auth-expiry detection), and the content-type
//! rewrite (spec §4.4). Pure, network-free logic lives here; the actual
//! HTTP round trip is driven by `proxy::mod`.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde_json::Value;

use crate::core::envelope::RequestEnvelope;
use crate::core::resource::Resource;
use crate::core::url::NormalizedUrl;

/// `NON_ALPHANUMERIC` minus the sub-delimiters the spec's examples keep
/// unescaped, plus an explicit space -> `%20` (never `+`).
const QUERY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'&')
    .add(b'=')
    .add(b'?')
    .add(b'+');

/// Parses an `a=b&c=d` query string into an ordered map, preserving the
/// first occurrence's key order and letting later duplicates overwrite.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    if query.is_empty() {
        return map;
    }
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        map.insert(
            percent_decode(key),
            percent_decode(value),
        );
    }
    map
}

fn percent_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(s)
        .decode_utf8_lossy()
        .replace('+', " ")
}

/// Serializes an ordered map back to a query string, percent-encoding each
/// key and value individually (space -> `%20`, never `+`), per spec §4.4.
pub fn serialize_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, QUERY_ENCODE_SET),
                utf8_percent_encode(v, QUERY_ENCODE_SET)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Merges the Resource's own configured query with the request's query
/// string, then injects a static or cached token if the merged map lacks
/// one (spec §4.4, bit-precise parameter merging).
pub fn merge_params(
    resource: &Resource,
    request_query: &str,
    live_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut params = parse_query(&resource.pattern.query);
    for (k, v) in parse_query(request_query) {
        params.insert(k, v);
    }

    if !params.contains_key(&resource.token_param_name) {
        match &resource.credentials {
            crate::core::resource::Credentials::Static { token } => {
                params.insert(resource.token_param_name.clone(), token.clone());
            }
            _ => {
                if let Some(token) = live_token {
                    params.insert(resource.token_param_name.clone(), token.to_string());
                }
            }
        }
    }

    params
}

/// Composes the full upstream URL for a request envelope + matched
/// Resource, applying the host-redirect override when configured (spec
/// §4.4's "Host-redirect" rule).
pub fn compose_upstream_url(resource: &Resource, envelope: &RequestEnvelope) -> String {
    let params = &envelope.params;
    let query = serialize_query(params);

    let base = if let Some(redirect) = &resource.host_redirect {
        let path = if redirect.path.is_empty() || redirect.path == "*" {
            envelope.upstream.path.clone()
        } else {
            redirect.path.clone()
        };
        compose_base(&redirect.protocol, &redirect.host, &redirect.port, &path)
    } else if resource.match_all {
        compose_base(
            &resource.pattern.protocol,
            &resource.pattern.host,
            &resource.pattern.port,
            &resource.pattern.path,
        )
    } else {
        // Non-matchAll resources forward the request's own trailing path
        // elements beyond the configured prefix.
        let tail = envelope.upstream.path.strip_prefix(&resource.pattern.path).unwrap_or(&envelope.upstream.path);
        let path = format!("{}{}", resource.pattern.path.trim_end_matches('/'), tail);
        compose_base(
            &resource.pattern.protocol,
            &resource.pattern.host,
            &resource.pattern.port,
            &path,
        )
    };

    if query.is_empty() {
        base
    } else {
        format!("{base}?{query}")
    }
}

fn compose_base(protocol: &str, host: &str, port: &str, path: &str) -> String {
    let protocol = if protocol == "*" { "http" } else { protocol };
    let mut s = format!("{protocol}://{host}");
    if port != "*" {
        s.push(':');
        s.push_str(port);
    }
    s.push_str(path);
    s
}

/// Rewrites the substring `application/vnd.ogc.wms_xml` to `text/xml` in a
/// response `Content-Type` value, leaving everything else untouched.
pub fn rewrite_content_type(content_type: &str) -> String {
    content_type.replace("application/vnd.ogc.wms_xml", "text/xml")
}

/// Result of inspecting a (possibly compressed) response body prefix for an
/// ArcGIS-style error envelope `{"error":{"code":N,...}}`.
#[derive(Debug, PartialEq, Eq)]
pub enum InspectionOutcome {
    /// No error envelope found, or Resource isn't credential-bearing.
    Clean,
    /// An auth-expiry code (403, 498, 499) was found.
    AuthExpired,
    /// A non-auth error code was found in the envelope (informational).
    OtherError(u16),
}

/// Decompresses `body` per `content_encoding` (gzip/deflate, else passes
/// through), then searches for an ArcGIS-style error envelope.
///
/// Only meaningful for credential-bearing Resources (spec §4.4): callers
/// should skip this for non-brokered Resources.
pub fn inspect_response_prefix(body: &[u8], content_encoding: Option<&str>) -> InspectionOutcome {
    let decoded = decompress_prefix(body, content_encoding);
    let text = String::from_utf8_lossy(&decoded);

    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return InspectionOutcome::Clean;
    };

    let Some(code) = value.get("error").and_then(|e| e.get("code")).and_then(Value::as_u64) else {
        return InspectionOutcome::Clean;
    };

    let code = code as u16;
    if matches!(code, 403 | 498 | 499) {
        InspectionOutcome::AuthExpired
    } else {
        InspectionOutcome::OtherError(code)
    }
}

/// Decompresses a possibly-truncated gzip/deflate prefix. A truncated
/// stream is treated as "couldn't fully decode" rather than propagated as a
/// hard error -- the caller falls back to treating the result as clean.
fn decompress_prefix(body: &[u8], content_encoding: Option<&str>) -> Vec<u8> {
    match content_encoding.map(|e| e.to_ascii_lowercase()) {
        Some(enc) if enc == "gzip" => {
            let mut out = Vec::new();
            let mut decoder = GzDecoder::new(body);
            let _ = decoder.read_to_end(&mut out);
            out
        }
        Some(enc) if enc == "deflate" => {
            let mut out = Vec::new();
            let mut decoder = DeflateDecoder::new(body);
            let _ = decoder.read_to_end(&mut out);
            out
        }
        _ => body.to_vec(),
    }
}
