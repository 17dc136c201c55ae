// src/server/mod.rs
pub mod batch;
pub mod client;
pub mod dispatcher;
pub mod handler;
pub mod health;
pub mod limiter;
pub mod message;
pub mod middleware;
pub mod subscribe;

// Re-export public components
pub use client::{Connection, ConnectionManager};
pub use dispatcher::RequestDispatcher;
pub use handler::{accept_connections, handle_connection};
pub use health::RelayMetrics;
pub use limiter::{AdmissionSnapshot, ConnectionLimiter};
pub use message::{JsonRpcRequest, JsonRpcResponse};

// Import internal dependencies
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

use crate::{config::SharedConfig, relay::Relay, utils::error::RelayError};

/// Everything a connection task needs, shared behind one `Arc`.
pub struct ServerState {
    pub config: SharedConfig,
    pub clients: ConnectionManager,
    pub limiter: Arc<ConnectionLimiter>,
    pub dispatcher: RequestDispatcher,
    pub relay: Arc<dyn Relay>,
    pub metrics: RelayMetrics,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl ServerState {
    /// Wires the limiter and dispatcher around `relay`.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::ConfigurationError` if TLS is enabled and the
    /// certificate or key cannot be loaded.
    pub fn new(
        config: SharedConfig,
        relay: Arc<dyn Relay>,
        metrics: RelayMetrics,
    ) -> Result<Self, RelayError> {
        let tls_acceptor = config.read().create_tls_acceptor()?;
        let limiter = Arc::new(ConnectionLimiter::new(config.clone(), metrics.clone()));
        let dispatcher = RequestDispatcher::new(
            config.clone(),
            relay.clone(),
            limiter.clone(),
            metrics.clone(),
        );
        Ok(Self {
            config,
            clients: ConnectionManager::new(),
            limiter,
            dispatcher,
            relay,
            metrics,
            tls_acceptor,
        })
    }
}
