use std::net::{IpAddr, SocketAddr};

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::{error, info};

/// Prometheus metrics for connections, requests and cache traffic.
///
/// Cloning is cheap; every clone shares the same registry.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Tracks the number of active WebSocket connections.
    pub connections: IntGauge,
    /// Active connections per client IP.
    pub connections_per_ip: IntGaugeVec,
    /// Connections closed by the limiter, labelled by reason.
    pub limit_rejections: IntCounterVec,
    /// Connections closed after sitting idle past the TTL.
    pub ttl_expirations: IntCounter,
    /// Lifetime of closed connections.
    pub connection_duration: Histogram,
    /// Counts the total number of messages received by the server.
    pub messages_received: IntCounter,
    /// Counts the total number of messages sent by the server.
    pub messages_sent: IntCounter,
    /// Requests per JSON-RPC method.
    pub method_requests: IntCounterVec,
    /// Error responses per JSON-RPC method and error category.
    pub method_errors: IntCounterVec,
    /// Live subscriptions across all connections.
    pub subscriptions: IntGauge,
    /// Cache operations per backend, operation and calling method.
    pub cache_operations: IntCounterVec,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl RelayMetrics {
    /// Creates the metric set and registers it with a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let connections = IntGauge::new("ws_active_connections", "Active WebSocket connections")?;
        let connections_per_ip = IntGaugeVec::new(
            Opts::new("ws_connections_per_ip", "Active WebSocket connections per IP"),
            &["ip"],
        )?;
        let limit_rejections = IntCounterVec::new(
            Opts::new("ws_limit_rejections_total", "Connections closed by a limit"),
            &["reason"],
        )?;
        let ttl_expirations = IntCounter::new(
            "ws_ttl_expirations_total",
            "Connections closed for inactivity",
        )?;
        let connection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ws_connection_duration_seconds",
                "Lifetime of WebSocket connections",
            )
            .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        )?;
        let messages_received =
            IntCounter::new("ws_messages_received_total", "Total messages received")?;
        let messages_sent = IntCounter::new("ws_messages_sent_total", "Total messages sent")?;
        let method_requests = IntCounterVec::new(
            Opts::new("ws_method_requests_total", "JSON-RPC requests per method"),
            &["method"],
        )?;
        let method_errors = IntCounterVec::new(
            Opts::new("ws_method_errors_total", "JSON-RPC error responses per method"),
            &["method", "error"],
        )?;
        let subscriptions = IntGauge::new("ws_active_subscriptions", "Live subscriptions")?;
        let cache_operations = IntCounterVec::new(
            Opts::new("cache_operations_total", "Cache operations"),
            &["cache", "operation", "caller"],
        )?;

        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(connections_per_ip.clone()))?;
        registry.register(Box::new(limit_rejections.clone()))?;
        registry.register(Box::new(ttl_expirations.clone()))?;
        registry.register(Box::new(connection_duration.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(method_requests.clone()))?;
        registry.register(Box::new(method_errors.clone()))?;
        registry.register(Box::new(subscriptions.clone()))?;
        registry.register(Box::new(cache_operations.clone()))?;

        Ok(Self {
            connections,
            connections_per_ip,
            limit_rejections,
            ttl_expirations,
            connection_duration,
            messages_received,
            messages_sent,
            method_requests,
            method_errors,
            subscriptions,
            cache_operations,
            registry,
        })
    }

    pub fn set_ip_connections(&self, ip: IpAddr, count: usize) {
        let label = ip.to_string();
        if count == 0 {
            let _ = self.connections_per_ip.remove_label_values(&[&label]);
        } else {
            self.connections_per_ip
                .with_label_values(&[&label])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
    }

    pub fn record_cache_op(&self, cache: &str, operation: &str, caller: &str) {
        self.cache_operations
            .with_label_values(&[cache, operation, caller])
            .inc();
    }

    pub fn record_method_error(&self, method: &str, error: &str) {
        self.method_errors.with_label_values(&[method, error]).inc();
    }

    /// Exposes the current state of all registered metrics in Prometheus-compatible format.
    pub fn expose_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Starts an HTTP server exposing `/metrics` and `/health/liveness`.
///
/// Runs until the listener fails; errors are logged rather than propagated so
/// a broken metrics port never takes the relay down.
pub async fn serve_metrics_http(metrics: RelayMetrics, port: u16) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health/liveness", get(liveness_handler))
        .with_state(metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Metrics listening on {}", addr);
    if let Err(e) = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
    {
        error!("Metrics server stopped: {}", e);
    }
}

/// Handles the `/metrics` HTTP request and returns the current metrics data.
async fn metrics_handler(State(metrics): State<RelayMetrics>) -> impl IntoResponse {
    metrics.expose_metrics()
}

async fn liveness_handler() -> impl IntoResponse {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_ip_gauge_is_removed_at_zero() {
        let metrics = RelayMetrics::new().unwrap();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        metrics.set_ip_connections(ip, 2);
        assert!(metrics.expose_metrics().contains("10.1.2.3"));
        metrics.set_ip_connections(ip, 0);
        assert!(!metrics.expose_metrics().contains("10.1.2.3"));
    }

    #[test]
    fn cache_operations_are_labelled() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.record_cache_op("lru", "get", "eth_chainId");
        let text = metrics.expose_metrics();
        assert!(text.contains(r#"cache_operations_total{cache="lru",caller="eth_chainId",operation="get"} 1"#));
    }
}
