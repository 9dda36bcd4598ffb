//! Loads and validates a TOML configuration file into the runtime `Config`.

use std::path::Path;
use std::sync::Arc;

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::model::{build_resource, parse_referrer_pattern, RawConfig, ServerConfigToml};
use crate::core::referrer_pattern::ReferrerPattern;
use crate::core::resource::Resource;

pub struct Config {
    pub server: ServerConfigToml,
    pub referrers: Vec<ReferrerPattern>,
    pub resources: Vec<Arc<Resource>>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, parses it as TOML, converts it into the runtime
    /// `Config`, and validates cross-field invariants.
    pub async fn load(path: &Path) -> ConfigResult<Config> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?;

        Self::load_str(&text)
    }

    pub fn load_str(text: &str) -> ConfigResult<Config> {
        let raw: RawConfig = toml::from_str(text)?;

        let referrers: Vec<ReferrerPattern> = raw.referrers.iter().map(parse_referrer_pattern).collect();

        let mut resources = Vec::with_capacity(raw.resources.len());
        for resource_cfg in &raw.resources {
            resources.push(Arc::new(build_resource(resource_cfg)?));
        }

        let config = Config {
            server: raw.server,
            referrers,
            resources,
        };

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    fn validate(&self) -> ConfigResult<()> {
        if self.server.listen.is_empty() {
            return Err(ConfigError::Invalid("server.listen must name at least one address".to_string()));
        }
        if self.server.proxy_prefixes.is_empty() {
            return Err(ConfigError::Invalid(
                "server.proxy_prefixes must name at least one listen prefix".to_string(),
            ));
        }
        if !self.server.accept_any_referrer && self.referrers.is_empty() {
            tracing::warn!("no [[referrer]] entries configured and accept_any_referrer is false: all requests will be denied");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        listen = ["0.0.0.0:8080"]
        accept_any_referrer = true

        [[resource]]
        url = "http://tiles.example.com/ArcGIS/rest/services"
        match_all = false

        [[resource]]
        url = "http://secure.example.com/ArcGIS/rest/services"
        match_all = false
        oauth2_endpoint = "http://secure.example.com/sharing/oauth2"

        [resource.credentials]
        client_id = "cid"
        client_secret = "secret"

        [resource.rate]
        rate_limit = 100
        rate_limit_period_minutes = 1
    "#;

    #[test]
    fn parses_sample_config() {
        let config = ConfigLoader::load_str(SAMPLE).unwrap();
        assert_eq!(config.resources.len(), 2);
        assert!(config.resources[1].is_rate_limited());
    }

    #[test]
    fn defaults_apply_when_server_table_absent() {
        let config = ConfigLoader::load_str("accept_any_referrer = true\n").unwrap_err();
        // Top-level stray key is a TOML parse error against our strict struct shape.
        assert!(matches!(config, ConfigError::Parse(_)));
    }

    #[test]
    fn empty_config_is_valid_with_defaults() {
        let config = ConfigLoader::load_str("").unwrap();
        assert_eq!(config.server.listen, vec!["0.0.0.0:8080".to_string()]);
        assert!(config.resources.is_empty());
    }
}
