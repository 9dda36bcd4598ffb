use std::process;

use tokio::runtime::Runtime;
use tokio::signal::unix::{signal, SignalKind};

use geoproxy::app_context::AppContext;

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt().with_thread_ids(true).init();

    let rt = Runtime::new().expect("Failed to build Tokio runtime");

    let mut ctx = rt.block_on(AppContext::bootstrap())?;

    let services = ctx.build_services()?;

    tracing::info!("Server running (PID: {})", process::id());

    let (server, reload_handle) = ctx.ready();

    server.bootstrap();
    server.add_services(services);

    rt.spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGHUP handler, reload is disabled");
                return;
            }
        };
        loop {
            hangup.recv().await;
            tracing::info!("SIGHUP received, reloading configuration");
            reload_handle.reload().await;
        }
    });

    tracing::info!("Starting proxy server...");

    server.run_forever();
}
