//! Cache clients fronting expensive upstream and mirror-node calls.
//!
//! Two interchangeable backends implement [`CacheClient`]: the in-process
//! [`LocalLruCache`] and the remote [`RedisCache`]. Every operation takes a
//! calling-method label and an optional [`RequestContext`]; both are used only
//! for logging and metrics.

pub mod glob;
pub mod local;
pub mod redact;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{config::RelayConfig, context::RequestContext, server::health::RelayMetrics};

pub use self::local::LocalLruCache;
pub use self::redis::RedisCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid key pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Capability contract shared by both cache backends.
///
/// TTLs are in milliseconds. `None` applies the backend's default TTL and
/// `Some(0)` stores the value without expiry. A miss is `Ok(None)`, never an
/// error.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn keys(
        &self,
        pattern: &str,
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<Vec<String>, CacheError>;

    async fn get(
        &self,
        key: &str,
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<Option<Value>, CacheError>;

    async fn set(
        &self,
        key: &str,
        value: &Value,
        calling_method: &str,
        ttl_ms: Option<u64>,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError>;

    /// Stores every pair with the default TTL.
    async fn multi_set(
        &self,
        entries: &[(String, Value)],
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError>;

    /// Stores every pair with the same TTL in a single backend round trip.
    async fn pipeline_set(
        &self,
        entries: &[(String, Value)],
        calling_method: &str,
        ttl_ms: Option<u64>,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError>;

    async fn delete(
        &self,
        key: &str,
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

/// Builds the cache selected by the configuration.
pub fn build_cache_client(
    config: &RelayConfig,
    metrics: RelayMetrics,
) -> Result<Arc<dyn CacheClient>, CacheError> {
    if config.redis_enabled {
        let cache = RedisCache::connect(
            &config.redis_url,
            std::time::Duration::from_millis(config.redis_reconnect_delay_ms),
            config.cache_ttl_ms,
            metrics,
        )?;
        Ok(Arc::new(cache))
    } else {
        Ok(Arc::new(LocalLruCache::new(
            config.cache_max,
            config.cache_ttl_ms,
            config.reserved_cache_keys.iter().cloned(),
            metrics,
        )))
    }
}

/// Log prefix shared by both backends.
pub(crate) fn log_prefix(ctx: Option<&RequestContext>) -> String {
    ctx.map(ToString::to_string).unwrap_or_default()
}
