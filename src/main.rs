//! # WebSocket JSON-RPC relay
//!
//! Serves Ethereum JSON-RPC over WebSocket in front of an HTTP relay and a
//! mirror node.
//!
//! ## Features
//! - Optional TLS using `tokio-rustls`
//! - Global and per-IP connection limits with inactivity TTLs
//! - Per-method rate limiting and batch requests
//! - `logs` and `newHeads` subscriptions
//! - Prometheus metrics and liveness over HTTP
//! - Environment-based configuration (`WS_*`)

use std::{sync::Arc, time::Duration};

use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ws_relay::{
    cache,
    config::RelayConfig,
    relay::{MirrorNodeRestClient, RelayServices, UpstreamRelay},
    server::{self, RelayMetrics, ServerState},
    subscriptions::{EventPoller, InMemorySubscriptionRegistry},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Entry point for the relay.
///
/// Initializes logging, loads configuration from the environment, wires the
/// relay collaborators and starts the TCP/TLS listener.
///
/// # Errors
/// Returns an error if configuration validation fails or if the server fails to bind to a port.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env()?;
    config.validate()?;

    let metrics = RelayMetrics::new()?;
    let cache = cache::build_cache_client(&config, metrics.clone())?;
    let upstream = Arc::new(UpstreamRelay::new(config.upstream_url.clone(), cache.clone())?);
    let mirror = Arc::new(MirrorNodeRestClient::new(&config.mirror_node_url, cache)?);
    let subs = Arc::new(InMemorySubscriptionRegistry::new(metrics.clone()));
    let relay = Arc::new(RelayServices::forwarding(upstream.clone(), subs.clone(), mirror));

    let port = config.port;
    let metrics_port = config.metrics_port;
    let shared = config.shared();
    let poller = EventPoller::new(upstream, subs, shared.clone());
    let state = Arc::new(ServerState::new(shared, relay, metrics.clone())?);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(
        "Relay listening on port {} ({})",
        port,
        if state.tls_acceptor.is_some() { "wss" } else { "ws" }
    );

    tokio::spawn(server::health::serve_metrics_http(metrics, metrics_port));
    let _cleanup = state.limiter.spawn_rate_limit_cleanup();
    let _poller = poller.spawn();

    tokio::select! {
        _ = server::accept_connections(listener, state.clone()) => {},
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down gracefully, closing {} connections", state.clients.len());
            state.clients.close_all();
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while !state.clients.is_empty() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if drained.is_err() {
                error!("{} connections did not close in time", state.clients.len());
            }
        }
    }

    Ok(())
}
