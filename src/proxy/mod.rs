//! Request Dispatcher (spec §4.7): the `pingora_proxy::ProxyHttp`
//! implementation orchestrating Normalizer → Referrer Validator → Resource
//! Matcher → Rate Limiter → Token Broker → Forwarder for every inbound
//! request, plus the ping/status/static-file surfaces (spec §6).
//!
//! Every route is fully handled and the response written directly within
//! `request_filter`, short-circuiting pingora's own upstream-connection
//! pipeline the same way the teacher's `SimpleResponse` filter does. This
//! is deliberate: the Forwarder's one-shot-retry contract (§4.4) requires
//! buffering and inspecting a bounded response prefix *before* committing
//! to a downstream write, which doesn't fit pingora's default single-pass
//! `upstream_peer` + streaming model, so upstream I/O is driven directly
//! through `reqwest` instead.

pub mod context;
pub mod forwarder;
pub mod status;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pingora::prelude::HttpPeer;
use pingora::Result as PResult;
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::broker::TokenBroker;
use crate::config::model::synthetic_pass_through;
use crate::core::envelope::RequestEnvelope;
use crate::core::error::ProxyError;
use crate::core::matcher::match_resource;
use crate::core::referrer::{validate_referrer, ReferrerOutcome};
use crate::core::resource::Resource;
use crate::core::url::{parse_proxy_tail, NormalizedUrl};
use crate::proxy::context::{ProxyState, RequestContext, SharedProxyState};
use crate::ratelimit::RateLimiter;

pub struct GeoProxyService {
    pub state: SharedProxyState,
    pub broker: Arc<TokenBroker>,
    pub limiter: Arc<RateLimiter>,
    pub http_client: reqwest::Client,
    pub started_at_millis: i64,
}

#[async_trait]
impl ProxyHttp for GeoProxyService {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        RequestContext {
            state: self.state.load_full(),
            broker: self.broker.clone(),
            limiter: self.limiter.clone(),
            http_client: self.http_client.clone(),
        }
    }

    /// Every request is fully handled here; nothing falls through to
    /// `upstream_peer`.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> PResult<bool>
    where
        Self::CTX: Send + Sync,
    {
        dispatch(session, ctx, self.started_at_millis).await?;
        Ok(true)
    }

    async fn upstream_peer(&self, _session: &mut Session, _ctx: &mut Self::CTX) -> PResult<Box<HttpPeer>> {
        Err(pingora::Error::new(pingora::ErrorType::HTTPStatus(500)))
    }
}

async fn dispatch(session: &mut Session, ctx: &mut RequestContext, started_at_millis: i64) -> PResult<()> {
    let req_header = session.req_header();
    let method = req_header.method.clone();
    let path = req_header.uri.path().to_string();
    let query = req_header.uri.query().unwrap_or("").to_string();
    let referer_header = req_header
        .headers
        .get("referer")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let forward_headers = req_header.headers.clone();

    let state = ctx.state.clone();
    let request_url = if query.is_empty() { path.clone() } else { format!("{path}?{query}") };

    if path == state.server.ping_path {
        let referrer_key = match validate_referrer(referer_header.as_deref(), state.server.accept_any_referrer, &state.referrers) {
            ReferrerOutcome::Accepted(key) => key,
            ReferrerOutcome::Rejected => "denied".to_string(),
        };
        return status::write_ping(session, &referrer_key).await;
    }

    if path == state.server.status_path {
        return status::write_status(session, &state, &ctx.limiter, started_at_millis).await;
    }

    let prefix = state
        .server
        .proxy_prefixes
        .iter()
        .find(|p| path.starts_with(p.as_str()))
        .cloned();

    let Some(prefix) = prefix else {
        return status::serve_static(session, state.server.static_dir.as_deref(), &path).await;
    };

    let result = handle_proxied_request(
        session,
        ctx,
        &state,
        &prefix,
        &path,
        &query,
        &method,
        referer_header.as_deref(),
        forward_headers,
    )
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(err) => write_error(session, err, &request_url).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_proxied_request(
    session: &mut Session,
    ctx: &mut RequestContext,
    state: &ProxyState,
    prefix: &str,
    path: &str,
    query: &str,
    method: &http::Method,
    referer_header: Option<&str>,
    forward_headers: http::HeaderMap,
) -> Result<(), ProxyError> {
    let tail = &path[prefix.len()..];
    let full_tail = if query.is_empty() { tail.to_string() } else { format!("{tail}?{query}") };
    let upstream = parse_proxy_tail(&full_tail);

    let referrer_key = match validate_referrer(referer_header, state.server.accept_any_referrer, &state.referrers) {
        ReferrerOutcome::Accepted(key) => key,
        ReferrerOutcome::Rejected => return Err(ProxyError::ReferrerDenied),
    };

    let resource: Arc<Resource> = match match_resource(&upstream, &state.resources) {
        Some(r) => r.clone(),
        None if !state.server.must_match => Arc::new(synthetic_pass_through(&upstream)),
        None => return Err(ProxyError::NoResource),
    };

    if resource.is_rate_limited() && !ctx.limiter.check(&resource, &referrer_key).await? {
        return Err(ProxyError::RateExceeded);
    }

    let now_millis = status::now_millis();
    resource.counters.record_dispatch(now_millis);

    let body = read_request_body(session).await?;

    forward_with_retry(
        session,
        ctx,
        &resource,
        &upstream,
        &referrer_key,
        method,
        &forward_headers,
        &body,
        state.server.response_peek_bytes,
        now_millis,
    )
    .await
}

enum ForwardOutcome {
    Done,
    RetryAuthExpired,
    RetryTransient,
}

/// Runs the Forwarder, retrying at most once: either because the response
/// carried an auth-expiry signal on a credential-bearing Resource (spec
/// §4.5/§4.4), or because the upstream connection itself failed
/// transiently (spec §5's "a timeout surfaces as a retryable error once").
#[allow(clippy::too_many_arguments)]
async fn forward_with_retry(
    session: &mut Session,
    ctx: &mut RequestContext,
    resource: &Arc<Resource>,
    upstream: &NormalizedUrl,
    referrer_key: &str,
    method: &http::Method,
    forward_headers: &http::HeaderMap,
    body: &Bytes,
    peek_cap: usize,
    now_millis: i64,
) -> Result<(), ProxyError> {
    let mut retried = false;

    loop {
        let live_token = if resource.credentials.is_brokered() {
            Some(ctx.broker.acquire(resource, referrer_key, now_millis).await?)
        } else {
            None
        };

        let params = forwarder::merge_params(resource, &upstream.query, live_token.as_deref());
        let envelope = RequestEnvelope {
            upstream: upstream.clone(),
            referrer_key: referrer_key.to_string(),
            params,
        };
        let url = forwarder::compose_upstream_url(resource, &envelope);

        // Once `retried` is already true, this is the final attempt: a
        // second auth-expiry signal must not trigger another retry but
        // instead stream the upstream's own (unaltered) error response to
        // the client, per spec §4.4/§7.
        let outcome = forward_once(ctx, resource, method, &url, forward_headers, body, peek_cap, session, retried).await?;

        match outcome {
            ForwardOutcome::Done => return Ok(()),
            ForwardOutcome::RetryAuthExpired if !retried => {
                retried = true;
                ctx.broker.refresh(resource, referrer_key, now_millis).await?;
            }
            ForwardOutcome::RetryAuthExpired => {
                unreachable!("forward_once suppresses RetryAuthExpired once `retried` is true")
            }
            ForwardOutcome::RetryTransient if !retried => {
                retried = true;
            }
            ForwardOutcome::RetryTransient => return Err(ProxyError::UpstreamError(502)),
        }
    }
}

/// Performs one upstream round trip. For credential-bearing Resources, the
/// first `peek_cap` bytes of the (decompressed) response are buffered and
/// inspected for an auth-expiry signal before anything is written
/// downstream; everything else streams straight through.
///
/// `suppress_auth_retry` is true once the caller has already retried once:
/// an auth-expiry signal found on this attempt is then written straight
/// through to the client (the upstream's original response) rather than
/// requesting another retry, per spec §4.4's "on second failure the
/// original error response is returned to the client".
#[allow(clippy::too_many_arguments)]
async fn forward_once(
    ctx: &RequestContext,
    resource: &Resource,
    method: &http::Method,
    url: &str,
    forward_headers: &http::HeaderMap,
    body: &Bytes,
    peek_cap: usize,
    session: &mut Session,
    suppress_auth_retry: bool,
) -> Result<ForwardOutcome, ProxyError> {
    let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

    let mut builder = ctx.http_client.request(reqwest_method, url);
    for (name, value) in forward_headers.iter() {
        if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            builder = builder.header(name.as_str(), value_str);
        }
    }
    if !body.is_empty() {
        builder = builder.body(body.clone());
    }

    let mut response = match builder.send().await {
        Ok(r) => r,
        Err(_) => return Ok(ForwardOutcome::RetryTransient),
    };

    let status = response.status().as_u16();
    let content_encoding = response
        .headers()
        .get(reqwest::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let status_code = http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers_out = ResponseHeader::build(status_code, Some(response.headers().len() + 1))
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    for (name, value) in response.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let Ok(value_str) = value.to_str() else { continue };
        let rewritten = if name.as_str().eq_ignore_ascii_case("content-type") {
            forwarder::rewrite_content_type(value_str)
        } else {
            value_str.to_string()
        };
        headers_out
            .insert_header(name.as_str().to_string(), rewritten)
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
    }

    let inspect = resource.credentials.is_brokered();
    let mut prefix = Vec::new();
    let mut exhausted = false;

    if inspect {
        while prefix.len() < peek_cap {
            match response.chunk().await {
                Ok(Some(chunk)) => prefix.extend_from_slice(&chunk),
                Ok(None) => {
                    exhausted = true;
                    break;
                }
                Err(_) => return Ok(ForwardOutcome::RetryTransient),
            }
        }

        if let forwarder::InspectionOutcome::AuthExpired =
            forwarder::inspect_response_prefix(&prefix, content_encoding.as_deref())
        {
            if !suppress_auth_retry {
                return Ok(ForwardOutcome::RetryAuthExpired);
            }
            // Final attempt: fall through and stream the upstream's own
            // error response (headers, buffered prefix, and the rest of
            // the body) to the client unaltered.
        }
    }

    session
        .downstream_session
        .write_response_header(Box::new(headers_out))
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?;

    if !prefix.is_empty() || exhausted {
        session
            .downstream_session
            .write_response_body(Bytes::from(prefix), exhausted)
            .await
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
    }

    if !exhausted {
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    session
                        .downstream_session
                        .write_response_body(chunk, false)
                        .await
                        .map_err(|e| ProxyError::Internal(e.to_string()))?;
                }
                Ok(None) => {
                    session
                        .downstream_session
                        .write_response_body(Bytes::new(), true)
                        .await
                        .map_err(|e| ProxyError::Internal(e.to_string()))?;
                    break;
                }
                Err(e) => return Err(ProxyError::Internal(format!("upstream stream error: {e}"))),
            }
        }
    }

    session.downstream_session.set_keepalive(None);
    Ok(ForwardOutcome::Done)
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

async fn read_request_body(session: &mut Session) -> Result<Bytes, ProxyError> {
    let mut buf = Vec::new();
    while let Some(chunk) = session
        .downstream_session
        .read_request_body()
        .await
        .map_err(|e| ProxyError::Internal(format!("failed to read request body: {e}")))?
    {
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}

async fn write_error(session: &mut Session, err: ProxyError, request_url: &str) -> PResult<()> {
    tracing::warn!(request_url, error = %err, "request failed");

    let (status, envelope) = err.into_envelope(request_url);
    let body = serde_json::to_vec(&envelope).unwrap_or_default();

    let status_code = http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = ResponseHeader::build(status_code, Some(2))?;
    response.insert_header("Content-Type", "application/json")?;
    response.insert_header("Content-Length", body.len().to_string())?;

    session.downstream_session.write_response_header(Box::new(response)).await?;
    session.downstream_session.write_response_body(Bytes::from(body), true).await?;
    session.downstream_session.set_keepalive(None);
    Ok(())
}
