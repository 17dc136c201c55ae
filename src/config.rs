use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use config::Config;
use parking_lot::RwLock;
use rustls_pemfile::{certs, pkcs8_private_keys};
use serde::Deserialize;
use tokio_rustls::{
    rustls::{Certificate, PrivateKey, ServerConfig as RustlsServerConfig},
    TlsAcceptor,
};

use crate::utils::error::RelayError;

/// Configuration handle shared by every component.
///
/// Components read through it on every check, so mutating it in place takes
/// effect for subsequent connections and requests without a restart.
pub type SharedConfig = Arc<RwLock<RelayConfig>>;

/// Configuration settings for the WebSocket relay.
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// The port on which the WebSocket server will listen.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// The port serving `/metrics`.
    #[serde(default = "defaults::metrics_port")]
    pub metrics_port: u16,
    /// The maximum number of simultaneous connections allowed.
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    /// The maximum number of simultaneous connections from one IP.
    #[serde(default = "defaults::max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    /// Idle time after which a connection is closed.
    #[serde(default = "defaults::max_inactivity_ttl_ms")]
    pub max_inactivity_ttl_ms: u64,
    /// Live subscriptions allowed per connection.
    #[serde(default = "defaults::subscription_limit")]
    pub subscription_limit: usize,
    #[serde(default = "defaults::enabled")]
    pub batch_requests_enabled: bool,
    #[serde(default = "defaults::batch_requests_max_size")]
    pub batch_requests_max_size: usize,
    /// Methods rejected when they appear inside a batch.
    #[serde(default = "defaults::batch_requests_disallowed_methods")]
    pub batch_requests_disallowed_methods: Vec<String>,
    /// Allows `logs` subscriptions on more than one address.
    #[serde(default)]
    pub multiple_addresses_enabled: bool,
    #[serde(default = "defaults::enabled")]
    pub new_heads_enabled: bool,
    /// Keep-alive ping period, 0 disables pings.
    #[serde(default = "defaults::ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// How often the upstream is polled for new blocks while subscriptions exist.
    #[serde(default = "defaults::polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Accept requests without an `id`, answering them with id `"0"`.
    #[serde(default)]
    pub request_id_is_optional: bool,
    #[serde(default)]
    pub rate_limit_disabled: bool,
    #[serde(default = "defaults::rate_limit_duration_ms")]
    pub rate_limit_duration_ms: u64,
    #[serde(default = "defaults::tier_1_rate_limit")]
    pub tier_1_rate_limit: u32,
    #[serde(default = "defaults::tier_2_rate_limit")]
    pub tier_2_rate_limit: u32,
    #[serde(default = "defaults::tier_3_rate_limit")]
    pub tier_3_rate_limit: u32,
    /// Maximum entries in the in-process cache.
    #[serde(default = "defaults::cache_max")]
    pub cache_max: usize,
    /// Default cache TTL, 0 keeps entries until evicted.
    #[serde(default = "defaults::cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    /// Keys that live in the reserved, never-evicted cache space.
    #[serde(default)]
    pub reserved_cache_keys: Vec<String>,
    #[serde(default)]
    pub redis_enabled: bool,
    #[serde(default = "defaults::redis_url")]
    pub redis_url: String,
    #[serde(default = "defaults::redis_reconnect_delay_ms")]
    pub redis_reconnect_delay_ms: u64,
    /// HTTP JSON-RPC relay that executes forwarded methods.
    #[serde(default = "defaults::upstream_url")]
    pub upstream_url: String,
    #[serde(default = "defaults::mirror_node_url")]
    pub mirror_node_url: String,
    /// Path to the TLS certificate file.
    #[serde(default = "defaults::tls_cert_path")]
    pub tls_cert_path: PathBuf,
    /// Path to the TLS private key file.
    #[serde(default = "defaults::tls_key_path")]
    pub tls_key_path: PathBuf,
    /// Whether TLS is enabled for secure communication.
    #[serde(default)]
    pub enable_tls: bool,
}

mod defaults {
    use std::path::PathBuf;

    pub fn port() -> u16 {
        8546
    }
    pub fn metrics_port() -> u16 {
        9080
    }
    pub fn max_connections() -> usize {
        100
    }
    pub fn max_connections_per_ip() -> usize {
        10
    }
    pub fn max_inactivity_ttl_ms() -> u64 {
        300_000
    }
    pub fn subscription_limit() -> usize {
        10
    }
    pub fn enabled() -> bool {
        true
    }
    pub fn batch_requests_max_size() -> usize {
        20
    }
    pub fn batch_requests_disallowed_methods() -> Vec<String> {
        vec!["eth_subscribe".to_string(), "eth_unsubscribe".to_string()]
    }
    pub fn ping_interval_ms() -> u64 {
        100_000
    }
    pub fn polling_interval_ms() -> u64 {
        500
    }
    pub fn rate_limit_duration_ms() -> u64 {
        60_000
    }
    pub fn tier_1_rate_limit() -> u32 {
        100
    }
    pub fn tier_2_rate_limit() -> u32 {
        800
    }
    pub fn tier_3_rate_limit() -> u32 {
        1600
    }
    pub fn cache_max() -> usize {
        1000
    }
    pub fn cache_ttl_ms() -> u64 {
        3_600_000
    }
    pub fn redis_url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }
    pub fn redis_reconnect_delay_ms() -> u64 {
        1000
    }
    pub fn upstream_url() -> String {
        "http://127.0.0.1:7546".to_string()
    }
    pub fn mirror_node_url() -> String {
        "http://127.0.0.1:5551".to_string()
    }
    pub fn tls_cert_path() -> PathBuf {
        PathBuf::from("certs/cert.pem")
    }
    pub fn tls_key_path() -> PathBuf {
        PathBuf::from("certs/key.pem")
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            metrics_port: defaults::metrics_port(),
            max_connections: defaults::max_connections(),
            max_connections_per_ip: defaults::max_connections_per_ip(),
            max_inactivity_ttl_ms: defaults::max_inactivity_ttl_ms(),
            subscription_limit: defaults::subscription_limit(),
            batch_requests_enabled: true,
            batch_requests_max_size: defaults::batch_requests_max_size(),
            batch_requests_disallowed_methods: defaults::batch_requests_disallowed_methods(),
            multiple_addresses_enabled: false,
            new_heads_enabled: true,
            ping_interval_ms: defaults::ping_interval_ms(),
            polling_interval_ms: defaults::polling_interval_ms(),
            request_id_is_optional: false,
            rate_limit_disabled: false,
            rate_limit_duration_ms: defaults::rate_limit_duration_ms(),
            tier_1_rate_limit: defaults::tier_1_rate_limit(),
            tier_2_rate_limit: defaults::tier_2_rate_limit(),
            tier_3_rate_limit: defaults::tier_3_rate_limit(),
            cache_max: defaults::cache_max(),
            cache_ttl_ms: defaults::cache_ttl_ms(),
            reserved_cache_keys: Vec::new(),
            redis_enabled: false,
            redis_url: defaults::redis_url(),
            redis_reconnect_delay_ms: defaults::redis_reconnect_delay_ms(),
            upstream_url: defaults::upstream_url(),
            mirror_node_url: defaults::mirror_node_url(),
            tls_cert_path: defaults::tls_cert_path(),
            tls_key_path: defaults::tls_key_path(),
            enable_tls: false,
        }
    }
}

impl RelayConfig {
    /// Loads the relay configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `WS_`; list values are
    /// comma separated.
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, RelayError> {
        Config::builder()
            .add_source(
                config::Environment::with_prefix("WS")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("batch_requests_disallowed_methods")
                    .with_list_parse_key("reserved_cache_keys"),
            )
            .build()
            .map_err(|e| RelayError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| RelayError::ConfigurationError(e.to_string()))
    }

    /// Wraps the configuration into the handle passed to every component.
    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn inactivity_ttl(&self) -> Duration {
        Duration::from_millis(self.max_inactivity_ttl_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn rate_limit_duration(&self) -> Duration {
        Duration::from_millis(self.rate_limit_duration_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Validates the configuration settings.
    ///
    /// Ensures that required TLS files exist if TLS is enabled and that the
    /// connection, TTL and batch limits are usable.
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.enable_tls {
            if !self.tls_cert_path.exists() {
                return Err(RelayError::ConfigurationError(format!(
                    "Certificate file not found: {:?}",
                    self.tls_cert_path
                )));
            }

            if !self.tls_key_path.exists() {
                return Err(RelayError::ConfigurationError(format!(
                    "Key file not found: {:?}",
                    self.tls_key_path
                )));
            }
        }

        if self.max_connections == 0 {
            return Err(RelayError::ConfigurationError(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.max_connections_per_ip == 0 {
            return Err(RelayError::ConfigurationError(
                "max_connections_per_ip must be greater than 0".into(),
            ));
        }

        if self.max_inactivity_ttl_ms == 0 {
            return Err(RelayError::ConfigurationError(
                "max_inactivity_ttl_ms must be greater than 0".into(),
            ));
        }

        if self.polling_interval_ms == 0 {
            return Err(RelayError::ConfigurationError(
                "polling_interval_ms must be greater than 0".into(),
            ));
        }

        if self.batch_requests_enabled && self.batch_requests_max_size == 0 {
            return Err(RelayError::ConfigurationError(
                "batch_requests_max_size must be greater than 0 when batches are enabled".into(),
            ));
        }

        for (name, value) in [
            ("upstream_url", &self.upstream_url),
            ("mirror_node_url", &self.mirror_node_url),
        ] {
            url::Url::parse(value).map_err(|e| {
                RelayError::ConfigurationError(format!("{name} is not a valid URL ({value}): {e}"))
            })?;
        }

        if self.cache_max == 0 {
            return Err(RelayError::ConfigurationError(
                "cache_max must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Creates a TLS acceptor for secure WebSocket connections.
    ///
    /// If TLS is disabled, returns `None`. Otherwise, loads the TLS certificate and private key,
    /// and initializes a Rustls TLS acceptor.
    ///
    /// # Errors
    /// Returns a `RelayError::ConfigurationError` if any part of the TLS setup fails.
    pub fn create_tls_acceptor(&self) -> Result<Option<Arc<TlsAcceptor>>, RelayError> {
        if !self.enable_tls {
            return Ok(None);
        }

        let cert_chain = fs::read(&self.tls_cert_path).map_err(|e| {
            RelayError::ConfigurationError(format!(
                "Certificate error: {} (path: {:?})",
                e, self.tls_cert_path
            ))
        })?;

        let key_der = fs::read(&self.tls_key_path).map_err(|e| {
            RelayError::ConfigurationError(format!(
                "Key error: {} (path: {:?})",
                e, self.tls_key_path
            ))
        })?;

        let certs = certs(&mut cert_chain.as_slice())
            .map_err(|e| RelayError::ConfigurationError(format!("Cert parse error: {}", e)))?;

        let key = pkcs8_private_keys(&mut key_der.as_slice())
            .map_err(|e| RelayError::ConfigurationError(format!("Key parse error: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RelayError::ConfigurationError(format!(
                    "No PKCS#8 private key in {:?}",
                    self.tls_key_path
                ))
            })?;

        let config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs.into_iter().map(Certificate).collect(), PrivateKey(key))
            .map_err(|e| RelayError::ConfigurationError(format!("TLS config error: {}", e)))?;

        Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(config)))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = RelayConfig {
            max_connections_per_ip: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RelayError::ConfigurationError(_))
        ));
    }

    #[test]
    fn zero_polling_interval_is_rejected() {
        let config = RelayConfig {
            polling_interval_ms: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(
            RelayConfig::default().polling_interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn zero_ping_interval_disables_pings() {
        let config = RelayConfig {
            ping_interval_ms: 0,
            ..RelayConfig::default()
        };
        assert_eq!(config.ping_interval(), None);
    }

    #[test]
    fn missing_tls_files_fail_validation() {
        let config = RelayConfig {
            enable_tls: true,
            tls_cert_path: PathBuf::from("/nonexistent/cert.pem"),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_upstream_url_fails_validation() {
        let config = RelayConfig {
            upstream_url: "not a url".into(),
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn shared_config_is_mutable_in_place() {
        let shared = RelayConfig::default().shared();
        let other = shared.clone();
        other.write().subscription_limit = 1;
        assert_eq!(shared.read().subscription_limit, 1);
    }
}
