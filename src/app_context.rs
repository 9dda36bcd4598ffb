//! Bootstrap: CLI parsing, config loading, durable store setup, and service
//! wiring (spec §6). Mirrors the teacher's own bootstrap/build_services/ready
//! split, minus the KDL/WASM-plugin machinery this proxy has no use for.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;
use pingora::listeners::tls::TlsSettings;
use pingora::server::Server;
use pingora::services::Service;

use crate::broker::TokenBroker;
use crate::config::cli::Cli;
use crate::config::loader::{Config, ConfigLoader};
use crate::proxy::context::{ProxyState, SharedProxyState};
use crate::proxy::status;
use crate::proxy::GeoProxyService;
use crate::ratelimit::{RateLimiter, SqliteMeterStorage};

pub struct AppContext {
    cli: Cli,
    config: Config,
    state: SharedProxyState,
    broker: Arc<TokenBroker>,
    limiter: Arc<RateLimiter>,
    server: Server,
    started_at_millis: i64,
}

impl AppContext {
    pub async fn bootstrap() -> miette::Result<AppContext> {
        let cli = Cli::parse();

        tracing::info!(config = ?cli.config, "loading configuration");
        let mut config = ConfigLoader::load(&cli.config)
            .await
            .map_err(|e| miette::miette!("{e}"))?;
        apply_cli_overrides(&mut config, &cli);

        if cli.validate_configs {
            tracing::info!("configuration is valid");
            std::process::exit(0);
        }

        let storage = Arc::new(
            SqliteMeterStorage::open(&config.server.meter_store_path).map_err(|e| miette::miette!("{e}"))?,
        );
        let limiter = Arc::new(RateLimiter::new(storage));
        limiter
            .initialize(&config.resources, &config.referrers)
            .await
            .map_err(|e| miette::miette!("{e}"))?;

        let broker = Arc::new(TokenBroker::new(config.server.timeout()));

        let state: SharedProxyState = Arc::new(ArcSwap::from_pointee(ProxyState {
            server: config.server.clone(),
            resources: config.resources.clone(),
            referrers: config.referrers.clone(),
        }));

        let server = Server::new(None).map_err(|e| miette::miette!("failed to construct pingora server: {e}"))?;

        Ok(AppContext {
            cli,
            config,
            state,
            broker,
            limiter,
            server,
            started_at_millis: status::now_millis(),
        })
    }

    /// Wraps the Request Dispatcher into a named pingora service and wires
    /// every `server.listen` address, upgrading to TLS when a cert/key pair
    /// is configured (the teacher's `populate_listners` pattern, inlined
    /// here since this proxy has a single listener group rather than a
    /// per-proxy listener table).
    pub fn build_services(&mut self) -> miette::Result<Vec<Box<dyn Service>>> {
        let http_client = reqwest::Client::builder()
            .timeout(self.config.server.timeout())
            .build()
            .map_err(|e| miette::miette!("failed to build http client: {e}"))?;

        let geo_service = GeoProxyService {
            state: self.state.clone(),
            broker: self.broker.clone(),
            limiter: self.limiter.clone(),
            http_client,
            started_at_millis: self.started_at_millis,
        };

        let mut service =
            pingora_proxy::http_proxy_service_with_name(&self.server.configuration, geo_service, "geoproxy");

        for addr in &self.config.server.listen {
            match (&self.config.server.tls_cert, &self.config.server.tls_key) {
                (Some(cert), Some(key)) => {
                    let settings = TlsSettings::intermediate(cert, key)
                        .map_err(|e| miette::miette!("failed to configure TLS listener on {addr}: {e}"))?;
                    service.add_tls_with_settings(addr, None, settings);
                }
                _ => service.add_tcp(addr),
            }
        }

        Ok(vec![Box::new(service)])
    }

    /// Hands off the built `Server` to the caller, along with a handle that
    /// can still trigger a config reload once the server itself is running
    /// (`Server::run_forever` never returns control to this struct).
    pub fn ready(self) -> (Server, ReloadHandle) {
        let handle = ReloadHandle {
            config_path: self.cli.config,
            state: self.state,
            limiter: self.limiter,
        };
        (self.server, handle)
    }
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(listen) = &cli.listen {
        config.server.listen = vec![listen.clone()];
    }
    if let Some(threads) = cli.threads_per_service {
        config.server.threads_per_service = threads;
    }
}

/// The subset of `AppContext` a SIGHUP handler needs once the server itself
/// has taken ownership of everything else.
#[derive(Clone)]
pub struct ReloadHandle {
    config_path: PathBuf,
    state: SharedProxyState,
    limiter: Arc<RateLimiter>,
}

impl ReloadHandle {
    /// Reloads the configuration file from the path given at startup,
    /// rebuilding the Resource table and Rate Limiter row set and swapping
    /// both in atomically. Per spec §4.6, refresh drops in-flight windows
    /// rather than carrying them across the swap.
    pub async fn reload(&self) {
        let config = match ConfigLoader::load(&self.config_path).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "reload failed, keeping previous configuration");
                return;
            }
        };

        if let Err(e) = self.limiter.refresh(&config.resources, &config.referrers).await {
            tracing::error!(error = %e, "rate limiter refresh failed during reload");
            return;
        }

        self.state.store(Arc::new(ProxyState {
            server: config.server,
            resources: config.resources,
            referrers: config.referrers,
        }));

        tracing::info!("configuration reloaded");
    }
}
