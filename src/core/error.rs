//! Error taxonomy (spec §7) and the uniform JSON envelope surfaced to
//! clients. Credentials and stack traces never reach this envelope.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request URL could not be parsed")]
    BadRequest,
    #[error("referrer not allowed")]
    ReferrerDenied,
    #[error("no resource matched")]
    NoResource,
    #[error("rate limit exceeded")]
    RateExceeded,
    #[error("rate limiter storage unavailable: {0}")]
    LimiterUnavailable(String),
    #[error("token acquisition failed: {0}")]
    TokenAcquisitionFailed(String),
    #[error("upstream returned an error: {0}")]
    UpstreamError(u16),
    #[error("upstream signaled an expired/invalid token")]
    UpstreamAuthExpired,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status code this error is surfaced as (spec §7's table).
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::BadRequest => 403,
            ProxyError::ReferrerDenied => 403,
            ProxyError::NoResource => 404,
            ProxyError::RateExceeded => 429,
            ProxyError::LimiterUnavailable(_) => 420,
            ProxyError::TokenAcquisitionFailed(_) => 502,
            ProxyError::UpstreamError(code) => *code,
            ProxyError::UpstreamAuthExpired => 502,
            ProxyError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn into_envelope(self, request_url: &str) -> (u16, ErrorEnvelope) {
        let code = self.status_code();
        let status = if (100..=599).contains(&code) { code } else { 500 };
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: status,
                message: self.message(),
                details: self.message(),
            },
            request: request_url.to_string(),
        };
        (status, envelope)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
    pub request: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_exceeded_maps_to_429() {
        assert_eq!(ProxyError::RateExceeded.status_code(), 429);
    }

    #[test]
    fn limiter_unavailable_maps_to_420() {
        assert_eq!(
            ProxyError::LimiterUnavailable("db locked".to_string()).status_code(),
            420
        );
    }

    #[test]
    fn envelope_carries_request_url_and_no_internals() {
        let (status, envelope) =
            ProxyError::ReferrerDenied.into_envelope("http://host/path");
        assert_eq!(status, 403);
        assert_eq!(envelope.request, "http://host/path");
        assert_eq!(envelope.error.code, 403);
    }
}
