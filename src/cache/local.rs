use std::{collections::HashSet, num::NonZeroUsize, time::Duration};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{trace, Level};

use super::{glob, log_prefix, redact::redact, CacheClient, CacheError};
use crate::{context::RequestContext, server::health::RelayMetrics};

const CACHE_LABEL: &str = "lru";

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Store = Mutex<LruCache<String, CacheEntry>>;

/// Bounded in-process cache.
///
/// Keys listed at construction live in a separate reserved store sized to
/// exactly that list, so pressure on the general store can never evict them.
pub struct LocalLruCache {
    general: Store,
    reserved: Option<Store>,
    reserved_keys: HashSet<String>,
    default_ttl_ms: u64,
    metrics: RelayMetrics,
}

impl LocalLruCache {
    pub fn new(
        max_entries: usize,
        default_ttl_ms: u64,
        reserved_keys: impl IntoIterator<Item = String>,
        metrics: RelayMetrics,
    ) -> Self {
        let reserved_keys: HashSet<String> = reserved_keys.into_iter().collect();
        let reserved = NonZeroUsize::new(reserved_keys.len()).map(|cap| Mutex::new(LruCache::new(cap)));
        let general_cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);

        Self {
            general: Mutex::new(LruCache::new(general_cap)),
            reserved,
            reserved_keys,
            default_ttl_ms,
            metrics,
        }
    }

    /// Routes a key to its store; the decision is identical for every operation.
    fn store_for(&self, key: &str) -> &Store {
        match &self.reserved {
            Some(reserved) if self.reserved_keys.contains(key) => reserved,
            _ => &self.general,
        }
    }

    fn stores(&self) -> impl Iterator<Item = &Store> {
        std::iter::once(&self.general).chain(self.reserved.iter())
    }

    fn expiry(&self, ttl_ms: Option<u64>) -> Option<Instant> {
        let ttl = ttl_ms.unwrap_or(self.default_ttl_ms);
        (ttl > 0).then(|| Instant::now() + Duration::from_millis(ttl))
    }

    fn insert(&self, key: &str, value: &Value, expires_at: Option<Instant>) {
        self.store_for(key).lock().put(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at,
            },
        );
    }

    /// Number of live entries across both stores.
    pub fn len(&self) -> usize {
        self.stores().map(|store| store.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheClient for LocalLruCache {
    async fn keys(
        &self,
        pattern: &str,
        calling_method: &str,
        ctx: Option<&RequestContext>,
    ) -> Result<Vec<String>, CacheError> {
        let regex = glob::compile(pattern)?;
        let now = Instant::now();
        let mut keys = Vec::new();
        for store in self.stores() {
            let store = store.lock();
            keys.extend(
                store
                    .iter()
                    .filter(|(key, entry)| !entry.is_expired(now) && regex.is_match(key))
                    .map(|(key, _)| key.clone()),
            );
        }

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
        let value = {
            let mut store = self.store_for(key).lock();
            let now = Instant::now();
            match store.peek(key).map(|entry| entry.is_expired(now)) {
                Some(true) => {
                    store.pop(key);
                    None
                }
                Some(false) => store.get(key).map(|entry| entry.value.clone()),
                None => None,
            }
        };

        self.metrics.record_cache_op(CACHE_LABEL, "get", calling_method);
        if let Some(value) = &value {
            if tracing::enabled!(Level::TRACE) {
                trace!(
                    "{} returning cached value {}:{} on {} call",
                    log_prefix(ctx),
                    key,
                    redact(&value.to_string()),
                    calling_method
                );
            }
        }
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: &Value,
        calling_method: &str,
        ttl_ms: Option<u64>,
        ctx: Option<&RequestContext>,
    ) -> Result<(), CacheError> {
        self.insert(key, value, self.expiry(ttl_ms));

        self.metrics.record_cache_op(CACHE_LABEL, "set", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!(
                "{} caching {}:{} on {} for {} ms",
                log_prefix(ctx),
                key,
                redact(&value.to_string()),
                calling_method,
                ttl_ms.unwrap_or(self.default_ttl_ms)
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
        let expires_at = self.expiry(None);
        for (key, value) in entries {
            self.insert(key, value, expires_at);
        }

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
        let expires_at = self.expiry(ttl_ms);
        for (key, value) in entries {
            self.insert(key, value, expires_at);
        }

        self.metrics.record_cache_op(CACHE_LABEL, "pipeline_set", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!(
                "{} caching {} entries on {} for {} ms",
                log_prefix(ctx),
                entries.len(),
                calling_method,
                ttl_ms.unwrap_or(self.default_ttl_ms)
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
        self.store_for(key).lock().pop(key);

        self.metrics.record_cache_op(CACHE_LABEL, "delete", calling_method);
        if tracing::enabled!(Level::TRACE) {
            trace!("{} delete cache for {} on {}", log_prefix(ctx), key, calling_method);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        for store in self.stores() {
            store.lock().clear();
        }
        trace!("cleared in-process cache");
        Ok(())
    }
}
