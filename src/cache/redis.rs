use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, RedisResult};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{error, info, trace, warn, Level};

use super::{log_prefix, redact::redact, CacheClient, CacheError};
use crate::{context::RequestContext, server::health::RelayMetrics};

const CACHE_LABEL: &str = "redis";

/// Delay before reconnect attempt number `attempt` (1-based).
pub fn reconnect_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

fn encode(value: &Value) -> Result<String, CacheError> {
    Ok(serde_json::to_string(value)?)
}

fn decode(raw: Option<String>) -> Result<Option<Value>, CacheError> {
    raw.map(|raw| serde_json::from_str(&raw)).transpose().map_err(CacheError::from)
}

/// Cache client backed by a remote cache server.
///
/// A supervisor task owns the connection lifecycle and publishes the current
/// connection through a watch channel; every command first waits for a live
/// connection. Connection-level failures wake the supervisor, which
/// reconnects with a linearly growing delay.
pub struct RedisCache {
    connection: watch::Receiver<Option<MultiplexedConnection>>,
    reconnect: Arc<Notify>,
    default_ttl_ms: u64,
    metrics: RelayMetrics,
}

impl RedisCache {
    /// Opens the client and starts connecting in the background.
    ///
    /// Only a malformed URL fails here; an unreachable server is retried
    /// forever and commands simply wait for it.
    pub fn connect(
        url: &str,
        reconnect_base_delay: Duration,
        default_ttl_ms: u64,
        metrics: RelayMetrics,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let (state_tx, connection) = watch::channel(None);
        let reconnect = Arc::new(Notify::new());

        tokio::spawn(supervise(
            client,
            reconnect_base_delay,
            state_tx,
            reconnect.clone(),
        ));

        Ok(Self {
            connection,
            reconnect,
            default_ttl_ms,
            metrics,
        })
    }

    /// Resolves once the supervisor has published a live connection.
    pub async fn connected(&self) -> Result<MultiplexedConnection, CacheError> {
        let mut rx = self.connection.clone();
        let current = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CacheError::Backend("cache connection supervisor stopped".into()))?;
        current
            .clone()
            .ok_or_else(|| CacheError::Backend("cache connection unavailable".into()))
    }

    async fn run<T, F, Fut>(&self, command: F) -> Result<T, CacheError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connected().await?;
        command(conn).await.map_err(|e| {
            if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                self.reconnect.notify_one();
            }
            CacheError::Backend(e.to_string())
        })
    }

    fn effective_ttl(&self, ttl_ms: Option<u64>) -> u64 {
        ttl_ms.unwrap_or(self.default_ttl_ms)
    }
}

async fn supervise(
    client: redis::Client,
    base_delay: Duration,
    state: watch::Sender<Option<MultiplexedConnection>>,
    reconnect: Arc<Notify>,
) {
    let mut attempt: u32 = 0;
    loop {
        match client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                if attempt > 0 {
                    info!("Reconnected to cache server after {} attempts", attempt);
                } else {
                    info!("Connected to cache server");
                }
                attempt = 0;
                if state.send(Some(conn)).is_err() {
                    return;
                }

                tokio::select! {
                    _ = reconnect.notified() => {}
                    _ = state.closed() => return,
                }
                warn!("Cache server connection lost, reconnecting");
                let _ = state.send(None);
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = reconnect_delay(base_delay, attempt);
                error!(
                    "Cache server connection attempt {} failed: {}; retrying in {:?}",
                    attempt, e, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = state.closed() => return,
                }
            }
        }
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn keys(
        &self,
        pattern: &str,
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<Vec<String>, CacheError> {
        let keys: Vec<String> = self
            .run(|mut conn| async move { conn.keys(pattern).await })
            .await?;

        self.metrics.record_cache_op(CACHE_LABEL, "keys", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!(
                "{} retrieving keys matching {} on {} call: {:?}",
                log_prefix(ctx),
                pattern,
                calling_method,
                keys
            );
        }
        Ok(keys)
    }

    async fn get(
        &self,
        key: &str,
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<Option<Value>, CacheError> {
        let raw: Option<String> = self.run(|mut conn| async move { conn.get(key).await }).await?;

        self.metrics.record_cache_op(CACHE_LABEL, "get", calling_method);
        if let Some(raw) = &raw {
            if tracing::enabled!(Level::TRACE) {
                trace!(
                    "{} returning cached value {}:{} on {} call",
                    log_prefix(ctx),
                    key,
                    redact(raw),
                    calling_method
                );
            }
        }
        decode(raw)
    }

    async fn set(
        &self,
        key: &str,
        value: &Value,
        calling_method: &str,
        ttl_ms: Option<u64>,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError> {
        let serialized = encode(value)?;
        let ttl = self.effective_ttl(ttl_ms);
        let payload = serialized.as_str();
        self.run(|mut conn| async move {
            if ttl > 0 {
                conn.pset_ex::<_, _, ()>(key, payload, ttl as usize).await
            } else {
                conn.set::<_, _, ()>(key, payload).await
            }
        })
        .await?;

        self.metrics.record_cache_op(CACHE_LABEL, "set", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!(
                "{} caching {}:{} on {} for {} ms",
                log_prefix(ctx),
                key,
                redact(&serialized),
                calling_method,
                ttl
            );
        }
        Ok(())
    }

    async fn multi_set(
        &self,
        entries: &[(String, Value)],
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        if self.default_ttl_ms > 0 {
            return self.pipeline_set(entries, calling_method, None, ctx).await;
        }

        let items = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), encode(value)?)))
            .collect::<Result<Vec<(String, String)>, CacheError>>()?;
        let pairs = items.as_slice();
        self.run(|mut conn| async move { conn.mset::<_, _, ()>(pairs).await })
            .await?;

        self.metrics.record_cache_op(CACHE_LABEL, "multi_set", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!(
                "{} caching {} entries on {}",
                log_prefix(ctx),
                entries.len(),
                calling_method
            );
        }
        Ok(())
    }

    async fn pipeline_set(
        &self,
        entries: &[(String, Value)],
        calling_method: &str,
        ttl_ms: Option<u64>,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let ttl = self.effective_ttl(ttl_ms);

        let mut pipeline = redis::pipe();
        for (key, value) in entries {
            let serialized = encode(value)?;
            if ttl > 0 {
                pipeline.pset_ex(key, serialized, ttl as usize).ignore();
            } else {
                pipeline.set(key, serialized).ignore();
            }
        }
        let pipeline = &pipeline;
        self.run(|mut conn| async move { pipeline.query_async::<_, ()>(&mut conn).await })
            .await?;

        self.metrics.record_cache_op(CACHE_LABEL, "pipeline_set", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!(
                "{} caching {} entries on {} for {} ms",
                log_prefix(ctx),
                entries.len(),
                calling_method,
                ttl
            );
        }
        Ok(())
    }

    async fn delete(
        &self,
        key: &str,
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError> {
        self.run(|mut conn| async move { conn.del::<_, ()>(key).await })
            .await?;

        self.metrics.record_cache_op(CACHE_LABEL, "delete", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!("{} delete cache for {} on {}", log_prefix(ctx), key, calling_method);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.run(|mut conn| async move { redis::cmd("FLUSHALL").query_async::<_, ()>(&mut conn).await })
            .await?;
        trace!("cleared remote cache");
        Ok(())
    }
}
