//! Shared end-to-end harness: builds a real `GeoProxyService` on top of an
//! in-memory meter store and boots it on its own pingora `Server` instance
//! in a background thread, the same way the teacher's own `tests/common`
//! setup spins up a proxy against a `wiremock` upstream.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use pingora::server::Server;

use geoproxy::broker::TokenBroker;
use geoproxy::config::model::ServerConfigToml;
use geoproxy::core::referrer_pattern::ReferrerPattern;
use geoproxy::core::resource::Resource;
use geoproxy::proxy::context::{ProxyState, SharedProxyState};
use geoproxy::proxy::GeoProxyService;
use geoproxy::ratelimit::{RateLimiter, SqliteMeterStorage};

pub struct TestProxy {
    pub addr: String,
    pub state: SharedProxyState,
    pub limiter: Arc<RateLimiter>,
}

pub fn default_server_config(addr: &str) -> ServerConfigToml {
    ServerConfigToml {
        listen: vec![addr.to_string()],
        tls_cert: None,
        tls_key: None,
        ping_path: "/ping".to_string(),
        status_path: "/status".to_string(),
        proxy_prefixes: vec!["/proxy".to_string()],
        must_match: false,
        accept_any_referrer: true,
        static_dir: None,
        timeout_secs: 5,
        response_peek_bytes: 4096,
        meter_store_path: ":memory:".to_string(),
        threads_per_service: 1,
    }
}

/// Boots a `GeoProxyService` bound to `server_config.listen[0]` with the
/// given Resources and Referrer Patterns, returning a handle to the live,
/// atomically-swappable state plus the Rate Limiter for follow-up
/// assertions. The server runs until the test binary exits.
pub async fn start_proxy(
    server_config: ServerConfigToml,
    resources: Vec<Arc<Resource>>,
    referrers: Vec<ReferrerPattern>,
) -> TestProxy {
    let addr = server_config.listen[0].clone();

    let storage = Arc::new(SqliteMeterStorage::open_in_memory().expect("in-memory meter store"));
    let limiter = Arc::new(RateLimiter::new(storage));
    limiter
        .initialize(&resources, &referrers)
        .await
        .expect("rate limiter initialization");

    let state: SharedProxyState = Arc::new(ArcSwap::from_pointee(ProxyState {
        server: server_config,
        resources,
        referrers,
    }));

    let broker = Arc::new(TokenBroker::new(Duration::from_secs(5)));
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("http client");

    let geo_service = GeoProxyService {
        state: state.clone(),
        broker,
        limiter: limiter.clone(),
        http_client,
        started_at_millis: 0,
    };

    let mut server = Server::new(None).expect("pingora server");
    server.bootstrap();

    let mut service =
        pingora_proxy::http_proxy_service_with_name(&server.configuration, geo_service, "test-geoproxy");
    service.add_tcp(&addr);
    server.add_services(vec![Box::new(service)]);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        tx.send(()).expect("failed to send ready signal");
        server.run_forever();
    });
    rx.recv().expect("server thread failed to start");

    // `run_forever` binds its listeners on its own event loop after this
    // thread hands off control; give it a moment before the first request.
    tokio::time::sleep(Duration::from_millis(150)).await;

    TestProxy {
        addr,
        state,
        limiter,
    }
}
