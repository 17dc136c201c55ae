use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::RelayNamespace;
use crate::{
    cache::CacheClient,
    context::RequestContext,
    server::message::JSONRPC_VERSION,
    utils::error::{JsonRpcError, RelayError},
};

/// Results that never change for the lifetime of a network.
const IMMUTABLE_METHODS: [&str; 3] = ["eth_chainId", "net_version", "web3_clientVersion"];

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// Forwards JSON-RPC calls to the HTTP relay.
pub struct UpstreamRelay {
    client: Client,
    url: String,
    cache: Arc<dyn CacheClient>,
}

impl UpstreamRelay {
    /// # Errors
    ///
    /// Returns `RelayError::Upstream` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, cache: Arc<dyn CacheClient>) -> Result<Self, RelayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            cache,
        })
    }

    fn cache_key(method: &str) -> Option<String> {
        IMMUTABLE_METHODS
            .contains(&method)
            .then(|| format!("upstream.{method}"))
    }

    async fn cached(&self, key: &str, method: &str, ctx: &RequestContext) -> Option<Value> {
        match self.cache.get(key, method, Some(ctx)).await {
            Ok(value) => value,
            Err(e) => {
                warn!("{} cache read for {} failed: {}", ctx, method, e);
                None
            }
        }
    }

    async fn forward(
        &self,
        method: &str,
        params: &[Value],
        ctx: &RequestContext,
    ) -> Result<Value, RelayError> {
        let body = json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": ctx.request_id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .header("X-Forwarded-For", ctx.ip.to_string())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let payload: UpstreamResponse = response.json().await.map_err(|e| {
            RelayError::Upstream(format!("invalid response from relay ({status}): {e}"))
        })?;

        match (payload.result, payload.error) {
            (_, Some(error)) => {
                debug!("{} relay returned error for {}: {}", ctx, method, error);
                Err(RelayError::Rpc(error))
            }
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[async_trait]
impl RelayNamespace for UpstreamRelay {
    #[instrument(skip(self, params, ctx), fields(request_id = %ctx.request_id))]
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        ctx: &RequestContext,
    ) -> Result<Value, RelayError> {
        let Some(key) = Self::cache_key(method) else {
            return self.forward(method, &params, ctx).await;
        };

        if let Some(value) = self.cached(&key, method, ctx).await {
            return Ok(value);
        }

        let value = self.forward(method, &params, ctx).await?;
        if let Err(e) = self.cache.set(&key, &value, method, Some(0), Some(ctx)).await {
            warn!("{} cache write for {} failed: {}", ctx, method, e);
        }
        Ok(value)
    }
}
