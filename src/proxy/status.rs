//! Ping, status, and static-file responses (spec §6's "external interfaces"
//! outside the proxied surface). All three write a complete response
//! directly to the downstream session and short-circuit the dispatcher,
//! the same mechanism the teacher's `SimpleResponse` filter uses.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use pingora::Result as PResult;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

use crate::proxy::context::ProxyState;
use crate::ratelimit::RateLimiter;

pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
struct PingBody {
    #[serde(rename = "Proxy Version")]
    proxy_version: &'static str,
    #[serde(rename = "Configuration File")]
    configuration_file: &'static str,
    #[serde(rename = "Log File")]
    log_file: &'static str,
    referrer: String,
}

/// Writes the `200` ping JSON document and returns.
pub async fn write_ping(session: &mut Session, referrer_key: &str) -> PResult<()> {
    let body = serde_json::to_vec(&PingBody {
        proxy_version: PROXY_VERSION,
        configuration_file: "OK",
        log_file: "OK",
        referrer: referrer_key.to_string(),
    })
    .unwrap_or_default();

    write_json(session, 200, body).await
}

/// Writes the `200` HTML status page: uptime, per-Resource counters, and a
/// dump of every meter row.
pub async fn write_status(
    session: &mut Session,
    state: &ProxyState,
    limiter: &RateLimiter,
    started_at_millis: i64,
) -> PResult<()> {
    let now_millis = now_millis();
    let uptime_secs = (now_millis - started_at_millis).max(0) / 1000;

    let mut html = String::new();
    html.push_str("<html><head><title>geoproxy status</title></head><body>");
    html.push_str(&format!("<h1>geoproxy {PROXY_VERSION}</h1>"));
    html.push_str(&format!("<p>Uptime: {uptime_secs}s</p>"));

    html.push_str("<h2>Resources</h2><table border=\"1\"><tr><th>URL</th><th>Total</th><th>First</th><th>Last</th></tr>");
    for resource in &state.resources {
        let (total, first, last) = resource.counters.snapshot();
        html.push_str(&format!(
            "<tr><td>{}</td><td>{total}</td><td>{first}</td><td>{last}</td></tr>",
            html_escape(&resource.pattern.to_url_string())
        ));
    }
    html.push_str("</table>");

    html.push_str("<h2>Meter rows</h2><table border=\"1\"><tr><th>URL</th><th>Referrer</th><th>Count</th><th>Window start</th><th>Total</th><th>Rejected</th></tr>");
    match limiter.dump().await {
        Ok(rows) => {
            for (url, referrer, row) in rows {
                html.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                    html_escape(&url),
                    html_escape(&referrer),
                    row.window_count,
                    row.window_start,
                    row.total,
                    row.rejected
                ));
            }
        }
        Err(e) => {
            html.push_str(&format!("<tr><td colspan=\"6\">meter store unavailable: {}</td></tr>", html_escape(&e.to_string())));
        }
    }
    html.push_str("</table></body></html>");

    write_html(session, 200, html).await
}

/// Serves a file under `static_dir` matching `path`, or `404` if none is
/// configured or the file doesn't exist. Directory traversal via `..` is
/// rejected outright.
pub async fn serve_static(session: &mut Session, static_dir: Option<&str>, path: &str) -> PResult<()> {
    let Some(dir) = static_dir else {
        return write_plain(session, 404, "not found".to_string()).await;
    };

    if path.contains("..") {
        return write_plain(session, 403, "forbidden".to_string()).await;
    }

    let relative = path.trim_start_matches('/');
    let relative = if relative.is_empty() { "index.html" } else { relative };
    let full_path = std::path::Path::new(dir).join(relative);

    match tokio::fs::read(&full_path).await {
        Ok(bytes) => {
            let content_type = guess_content_type(&full_path);
            write_bytes(session, 200, content_type, Bytes::from(bytes)).await
        }
        Err(_) => write_plain(session, 404, "not found".to_string()).await,
    }
}

fn guess_content_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn write_json(session: &mut Session, status: u16, body: Vec<u8>) -> PResult<()> {
    write_bytes(session, status, "application/json", Bytes::from(body)).await
}

async fn write_html(session: &mut Session, status: u16, body: String) -> PResult<()> {
    write_bytes(session, status, "text/html; charset=utf-8", Bytes::from(body)).await
}

async fn write_plain(session: &mut Session, status: u16, body: String) -> PResult<()> {
    write_bytes(session, status, "text/plain; charset=utf-8", Bytes::from(body)).await
}

async fn write_bytes(session: &mut Session, status: u16, content_type: &str, body: Bytes) -> PResult<()> {
    let status_code = http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = ResponseHeader::build(status_code, Some(2))?;
    response.insert_header("Content-Type", content_type)?;
    response.insert_header("Content-Length", body.len().to_string())?;

    session.downstream_session.write_response_header(Box::new(response)).await?;
    session.downstream_session.write_response_body(body, true).await?;
    session.downstream_session.set_keepalive(None);
    Ok(())
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
