use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::{EntityType, MirrorNodeClient};
use crate::{cache::CacheClient, context::RequestContext, utils::error::RelayError};

const CALLER: &str = "resolveEntityType";

/// Maps an address whose leading 12 bytes are zero to its ledger entity id
/// (`0.0.<num>`).
pub fn long_zero_entity_id(address: &str) -> Option<String> {
    let digits = address.strip_prefix("0x")?;
    if digits.len() != 40 || !digits[..24].bytes().all(|b| b == b'0') {
        return None;
    }
    u64::from_str_radix(&digits[24..], 16)
        .ok()
        .map(|num| format!("0.0.{num}"))
}

/// Resolves addresses through the mirror node REST API.
pub struct MirrorNodeRestClient {
    client: Client,
    base_url: String,
    cache: Arc<dyn CacheClient>,
}

impl MirrorNodeRestClient {
    /// # Errors
    ///
    /// Returns `RelayError::Upstream` if the HTTP client cannot be built.
    pub fn new(base_url: &str, cache: Arc<dyn CacheClient>) -> Result<Self, RelayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
        })
    }

    /// `true` on 200, `false` on 404; anything else is an error.
    async fn exists(&self, path: &str) -> Result<bool, RelayError> {
        let url = format!("{}/api/v1/{}", self.base_url, path);
        let response = self.client.get(&url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RelayError::Upstream(format!(
                "mirror node returned {status} for {url}"
            ))),
        }
    }
}

#[async_trait]
impl MirrorNodeClient for MirrorNodeRestClient {
    async fn resolve_entity_type(
        &self,
        address: &str,
        ctx: &RequestContext,
    ) -> Result<Option<EntityType>, RelayError> {
        let address = address.to_lowercase();
        let key = format!("resolvedEntityType.{address}");

        match self.cache.get(&key, CALLER, Some(ctx)).await {
            Ok(Some(cached)) => match serde_json::from_value(cached) {
                Ok(entity) => return Ok(Some(entity)),
                Err(e) => warn!("{} ignoring corrupt cache entry {}: {}", ctx, key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("{} cache read for {} failed: {}", ctx, key, e),
        }

        let entity = if self.exists(&format!("contracts/{address}")).await? {
            Some(EntityType::Contract)
        } else {
            match long_zero_entity_id(&address) {
                Some(id) if self.exists(&format!("tokens/{id}")).await? => Some(EntityType::Token),
                _ => None,
            }
        };

        debug!("{} resolved {} to {:?}", ctx, address, entity);
        if let Some(entity) = entity {
            let value = serde_json::to_value(entity)?;
            if let Err(e) = self.cache.set(&key, &value, CALLER, None, Some(ctx)).await {
                warn!("{} cache write for {} failed: {}", ctx, key, e);
            }
        }
        Ok(entity)
    }
}
