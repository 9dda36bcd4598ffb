//! Typed TOML configuration model and its conversion into the core data
//! model (`Resource`, `ReferrerPattern`).

use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;

use crate::config::error::{ConfigError, ConfigResult};
use crate::core::referrer_pattern::ReferrerPattern;
use crate::core::resource::{Counters, Credentials, RatePolicy, Resource};
use crate::core::url::{parse_standard_url, NormalizedUrl};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawConfig {
    pub server: ServerConfigToml,
    #[serde(rename = "referrer")]
    pub referrers: Vec<ReferrerConfigToml>,
    #[serde(rename = "resource")]
    pub resources: Vec<ResourceConfigToml>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            server: ServerConfigToml::default(),
            referrers: Vec::new(),
            resources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfigToml {
    pub listen: Vec<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub ping_path: String,
    pub status_path: String,
    pub proxy_prefixes: Vec<String>,
    pub must_match: bool,
    pub accept_any_referrer: bool,
    pub static_dir: Option<String>,
    pub timeout_secs: u64,
    pub response_peek_bytes: usize,
    pub meter_store_path: String,
    pub threads_per_service: usize,
}

impl Default for ServerConfigToml {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:8080".to_string()],
            tls_cert: None,
            tls_key: None,
            ping_path: "/ping".to_string(),
            status_path: "/status".to_string(),
            proxy_prefixes: vec!["/proxy".to_string()],
            must_match: false,
            accept_any_referrer: false,
            static_dir: None,
            timeout_secs: 30,
            response_peek_bytes: 64 * 1024,
            meter_store_path: "./geoproxy-meter.sqlite3".to_string(),
            threads_per_service: 4,
        }
    }
}

impl ServerConfigToml {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferrerConfigToml {
    pub pattern: String,
    #[serde(default)]
    pub match_all: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfigToml {
    pub url: String,
    #[serde(default)]
    pub match_all: bool,
    pub host_redirect: Option<String>,
    #[serde(default)]
    pub credentials: CredentialsConfigToml,
    pub oauth2_endpoint: Option<String>,
    #[serde(default = "default_token_param_name")]
    pub token_param_name: String,
    pub rate: Option<RateConfigToml>,
}

fn default_token_param_name() -> String {
    "token".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfigToml {
    pub token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfigToml {
    pub rate_limit: u32,
    pub rate_limit_period_minutes: u32,
}

pub fn parse_referrer_pattern(cfg: &ReferrerConfigToml) -> ReferrerPattern {
    ReferrerPattern::from_pattern(&cfg.pattern, cfg.match_all)
}

pub fn build_resource(cfg: &ResourceConfigToml) -> ConfigResult<Resource> {
    let credentials = resolve_credentials(&cfg.credentials, &cfg.url)?;

    if matches!(credentials, Credentials::App { .. }) && cfg.oauth2_endpoint.is_none() {
        return Err(ConfigError::Invalid(format!(
            "resource {}: app credentials require oauth2_endpoint",
            cfg.url
        )));
    }

    let rate = match cfg.rate {
        Some(r) if r.rate_limit > 0 && r.rate_limit_period_minutes > 0 => Some(RatePolicy {
            rate_limit: r.rate_limit,
            rate_limit_period_minutes: r.rate_limit_period_minutes,
        }),
        Some(_) => {
            return Err(ConfigError::Invalid(format!(
                "resource {}: rate_limit and rate_limit_period_minutes must both be > 0",
                cfg.url
            )))
        }
        None => None,
    };

    let host_redirect = cfg
        .host_redirect
        .as_deref()
        .map(parse_standard_url)
        .map(Some)
        .unwrap_or(None);

    Ok(Resource {
        pattern: parse_standard_url(&cfg.url),
        match_all: cfg.match_all,
        host_redirect,
        credentials,
        oauth2_endpoint: cfg.oauth2_endpoint.clone(),
        token_param_name: cfg.token_param_name.clone(),
        rate,
        counters: Counters::default(),
        cached_token: RwLock::new(None),
    })
}

fn resolve_credentials(cfg: &CredentialsConfigToml, resource_url: &str) -> ConfigResult<Credentials> {
    let has_static = cfg.token.is_some();
    let has_user = cfg.username.is_some() || cfg.password.is_some();
    let has_app = cfg.client_id.is_some() || cfg.client_secret.is_some();

    let mode_count = [has_static, has_user, has_app].iter().filter(|b| **b).count();
    if mode_count > 1 {
        return Err(ConfigError::Invalid(format!(
            "resource {resource_url}: at most one credential mode (static token, user, app) may be configured"
        )));
    }

    if has_static {
        return Ok(Credentials::Static {
            token: cfg.token.clone().expect("has_static implies token is Some"),
        });
    }

    if has_user {
        let username = cfg
            .username
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("resource {resource_url}: username required with password")))?;
        let password = cfg
            .password
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("resource {resource_url}: password required with username")))?;
        return Ok(Credentials::User { username, password });
    }

    if has_app {
        let client_id = cfg.client_id.clone().ok_or_else(|| {
            ConfigError::Invalid(format!("resource {resource_url}: client_id required with client_secret"))
        })?;
        let client_secret = cfg.client_secret.clone().ok_or_else(|| {
            ConfigError::Invalid(format!("resource {resource_url}: client_secret required with client_id"))
        })?;
        return Ok(Credentials::App {
            client_id,
            client_secret,
        });
    }

    Ok(Credentials::None)
}

/// A resource pattern matching the dispatcher's fallback pass-through
/// resource used when no configured Resource matches and `must_match` is
/// false (spec §4.7 step 3).
pub fn synthetic_pass_through(url: &NormalizedUrl) -> Resource {
    Resource {
        pattern: url.clone(),
        match_all: true,
        host_redirect: None,
        credentials: Credentials::None,
        oauth2_endpoint: None,
        token_param_name: "token".to_string(),
        rate: None,
        counters: Counters::default(),
        cached_token: RwLock::new(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_multiple_credential_modes() {
        let cfg = CredentialsConfigToml {
            token: Some("abc".to_string()),
            username: Some("alice".to_string()),
            password: None,
            client_id: None,
            client_secret: None,
        };
        assert!(resolve_credentials(&cfg, "http://host").is_err());
    }

    #[test]
    fn accepts_static_token_only() {
        let cfg = CredentialsConfigToml {
            token: Some("abc".to_string()),
            ..Default::default()
        };
        let creds = resolve_credentials(&cfg, "http://host").unwrap();
        assert_eq!(creds, Credentials::Static { token: "abc".to_string() });
    }

    #[test]
    fn no_credentials_is_valid() {
        let cfg = CredentialsConfigToml::default();
        let creds = resolve_credentials(&cfg, "http://host").unwrap();
        assert_eq!(creds, Credentials::None);
    }

    #[test]
    fn rate_requires_both_fields_positive() {
        let cfg = ResourceConfigToml {
            url: "http://host/a".to_string(),
            match_all: false,
            host_redirect: None,
            credentials: CredentialsConfigToml::default(),
            oauth2_endpoint: None,
            token_param_name: "token".to_string(),
            rate: Some(RateConfigToml {
                rate_limit: 0,
                rate_limit_period_minutes: 1,
            }),
        };
        assert!(build_resource(&cfg).is_err());
    }

    #[test]
    fn builds_resource_with_valid_rate() {
        let cfg = ResourceConfigToml {
            url: "http://host/a".to_string(),
            match_all: false,
            host_redirect: None,
            credentials: CredentialsConfigToml::default(),
            oauth2_endpoint: None,
            token_param_name: "token".to_string(),
            rate: Some(RateConfigToml {
                rate_limit: 3,
                rate_limit_period_minutes: 1,
            }),
        };
        let resource = build_resource(&cfg).unwrap();
        assert!(resource.is_rate_limited());
    }
}
