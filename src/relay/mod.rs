//! Collaborators that actually execute forwarded methods.
//!
//! The WebSocket layer only ever talks to these traits; [`RelayServices`]
//! bundles concrete implementations for the binary.

pub mod methods;
pub mod mirror;
pub mod upstream;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    context::RequestContext, subscriptions::SubscriptionRegistry, utils::error::RelayError,
};
use methods::Namespace;

pub use mirror::MirrorNodeRestClient;
pub use upstream::UpstreamRelay;

/// One namespace (`eth`, `net`, `web3`) of the relay.
#[async_trait]
pub trait RelayNamespace: Send + Sync {
    /// Executes `method` with parameters already normalized to its declared arity.
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        ctx: &RequestContext,
    ) -> Result<Value, RelayError>;
}

/// What a ledger address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Contract,
    Token,
}

#[async_trait]
pub trait MirrorNodeClient: Send + Sync {
    /// Resolves `address`, returning `None` when it is neither a contract nor a token.
    async fn resolve_entity_type(
        &self,
        address: &str,
        ctx: &RequestContext,
    ) -> Result<Option<EntityType>, RelayError>;
}

/// Everything the WebSocket layer needs from the relay.
pub trait Relay: Send + Sync {
    fn eth(&self) -> &dyn RelayNamespace;
    fn net(&self) -> &dyn RelayNamespace;
    fn web3(&self) -> &dyn RelayNamespace;
    fn subs(&self) -> &dyn SubscriptionRegistry;
    fn mirror_client(&self) -> &dyn MirrorNodeClient;

    fn namespace(&self, namespace: Namespace) -> &dyn RelayNamespace {
        match namespace {
            Namespace::Eth => self.eth(),
            Namespace::Net => self.net(),
            Namespace::Web3 => self.web3(),
        }
    }
}

/// [`Relay`] assembled from independent parts.
pub struct RelayServices {
    pub eth: Arc<dyn RelayNamespace>,
    pub net: Arc<dyn RelayNamespace>,
    pub web3: Arc<dyn RelayNamespace>,
    pub subs: Arc<dyn SubscriptionRegistry>,
    pub mirror: Arc<dyn MirrorNodeClient>,
}

impl RelayServices {
    /// Serves every namespace from one forwarding client.
    pub fn forwarding(
        upstream: Arc<UpstreamRelay>,
        subs: Arc<dyn SubscriptionRegistry>,
        mirror: Arc<dyn MirrorNodeClient>,
    ) -> Self {
        Self {
            eth: upstream.clone(),
            net: upstream.clone(),
            web3: upstream,
            subs,
            mirror,
        }
    }
}

impl Relay for RelayServices {
    fn eth(&self) -> &dyn RelayNamespace {
        self.eth.as_ref()
    }

    fn net(&self) -> &dyn RelayNamespace {
        self.net.as_ref()
    }

    fn web3(&self) -> &dyn RelayNamespace {
        self.web3.as_ref()
    }

    fn subs(&self) -> &dyn SubscriptionRegistry {
        self.subs.as_ref()
    }

    fn mirror_client(&self) -> &dyn MirrorNodeClient {
        self.mirror.as_ref()
    }
}
