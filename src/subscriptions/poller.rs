use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EventKind, InMemorySubscriptionRegistry};
use crate::{
    config::SharedConfig, context::RequestContext, relay::RelayNamespace,
    utils::error::RelayError,
};

/// Polls the upstream relay for new blocks and logs and feeds them to the
/// subscription registry.
///
/// Each event kind keeps its own block cursor. A cursor is dropped while the
/// kind has no subscribers, so a new subscriber starts from the current head
/// instead of replaying history.
pub struct EventPoller {
    upstream: Arc<dyn RelayNamespace>,
    registry: Arc<InMemorySubscriptionRegistry>,
    config: SharedConfig,
    last_head: Option<u64>,
    last_logs: Option<u64>,
}

fn parse_quantity(value: &str) -> Option<u64> {
    u64::from_str_radix(value.strip_prefix("0x")?, 16).ok()
}

fn quantity(value: u64) -> String {
    format!("0x{value:x}")
}

impl EventPoller {
    pub fn new(
        upstream: Arc<dyn RelayNamespace>,
        registry: Arc<InMemorySubscriptionRegistry>,
        config: SharedConfig,
    ) -> Self {
        Self {
            upstream,
            registry,
            config,
            last_head: None,
            last_logs: None,
        }
    }

    /// Runs [`poll_once`](Self::poll_once) every polling interval until the
    /// task is aborted. Upstream failures are logged and retried next round.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let period = self.config.read().polling_interval();
                tokio::time::sleep(period).await;
                if let Err(e) = self.poll_once().await {
                    warn!("Polling upstream for subscription events failed: {}", e);
                }
            }
        })
    }

    /// One polling round. Returns the number of events delivered.
    ///
    /// # Errors
    ///
    /// Returns the upstream error if fetching the latest block or its logs
    /// fails. Cursors only advance for the data that was delivered.
    pub async fn poll_once(&mut self) -> Result<usize, RelayError> {
        let wants_heads = self.registry.has_subscribers(EventKind::NewHeads);
        let wants_logs = self.registry.has_subscribers(EventKind::Logs);
        if !wants_heads {
            self.last_head = None;
        }
        if !wants_logs {
            self.last_logs = None;
        }
        if !wants_heads && !wants_logs {
            return Ok(0);
        }

        let ctx = RequestContext::new(Uuid::nil(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let head = self
            .upstream
            .call(
                "eth_getBlockByNumber",
                vec![json!("latest"), json!(false)],
                &ctx,
            )
            .await?;
        let Some(number) = head
            .get("number")
            .and_then(Value::as_str)
            .and_then(parse_quantity)
        else {
            debug!("{} Upstream returned no latest block", ctx);
            return Ok(0);
        };

        let mut delivered = 0;
        if wants_heads && self.last_head.map_or(true, |last| number > last) {
            delivered += self.registry.publish_new_head(&head);
            self.last_head = Some(number);
        }

        if wants_logs {
            let from = match self.last_logs {
                Some(last) if number <= last => return Ok(delivered),
                Some(last) => last + 1,
                None => number,
            };
            let range = json!({ "fromBlock": quantity(from), "toBlock": quantity(number) });
            let logs = self.upstream.call("eth_getLogs", vec![range], &ctx).await?;
            for log in logs.as_array().into_iter().flatten() {
                delivered += self.registry.publish_log(log);
            }
            self.last_logs = Some(number);
        }

        Ok(delivered)
    }
}
