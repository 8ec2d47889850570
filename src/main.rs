//! Hermes event relay daemon.
//!
//! Main entry point. Loads configuration, builds the routing table and
//! relay, serves the HTTP ingress and drains in-flight deliveries on
//! SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use hermes_api::{shutdown_signal, start_server, AppState, Config};
use hermes_delivery::{DeliveryClient, RelayCore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Environment variable selecting the log format (`json` or `pretty`).
const LOG_FORMAT_ENV: &str = "HERMES_LOG_FORMAT";

const DEFAULT_LOG_FILTER: &str = "info,hermes=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting hermes relay");

    let config = Config::load()?;
    let addr = config.server_addr()?;
    info!(
        server_addr = %addr,
        destinations = config.destinations.len(),
        routes = config.routes.len(),
        max_in_flight = config.relay.max_in_flight,
        queue_depth = config.relay.queue_depth,
        signed_ingress = config.server.inbound_secret.is_some(),
        "configuration loaded"
    );

    let routing = Arc::new(config.routing_table()?);
    if routing.route_count() == 0 {
        warn!("no routes configured, every event will be rejected");
    }

    let client = DeliveryClient::new(config.client_config(), config.git_config())
        .context("failed to build delivery client")?;
    let relay = Arc::new(RelayCore::new(config.relay_config(), routing, Arc::new(client)));
    let state = AppState::from_config(relay.clone(), &config);

    let shutdown = CancellationToken::new();

    let signal = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let served = start_server(state, addr, shutdown.clone().cancelled_owned()).await;
    shutdown.cancel();
    signal.abort();

    if let Err(e) = &served {
        error!(error = %e, "http server failed");
    }

    info!(timeout_secs = config.relay.shutdown_timeout_secs, "draining relay");
    let drained = relay.shutdown(config.shutdown_timeout()).await;

    let stats = relay.stats().await;
    info!(
        accepted = stats.accepted,
        in_flight = stats.in_flight,
        dispatchers = stats.dispatchers,
        "hermes shutdown complete"
    );

    served.context("http server failed")?;
    drained.context("relay did not drain before the shutdown timeout")?;
    Ok(())
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` controls filtering. `HERMES_LOG_FORMAT=json` switches to one
/// JSON object per line.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .context("invalid RUST_LOG filter")?;

    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json().with_current_span(true)).try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_file(true).with_line_number(true))
            .try_init()
    }
    .context("failed to install tracing subscriber")
}
