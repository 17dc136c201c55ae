use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{EventKind, LogFilter, SubscriptionRegistry};
use crate::server::{client::Connection, health::RelayMetrics, message};

struct Subscription {
    connection: Arc<Connection>,
    kind: EventKind,
    filter: LogFilter,
}

/// Keeps subscriptions in process and fans published events out to them.
///
/// Events for one subscription are queued on its connection in publish order.
pub struct InMemorySubscriptionRegistry {
    subscriptions: DashMap<String, Subscription>,
    by_connection: DashMap<Uuid, HashSet<String>>,
    metrics: RelayMetrics,
}

/// `0x` followed by 16 random bytes in hex.
pub fn generate_subscription_id() -> String {
    format!("0x{}", hex::encode(rand::random::<[u8; 16]>()))
}

impl InMemorySubscriptionRegistry {
    pub fn new(metrics: RelayMetrics) -> Self {
        Self {
            subscriptions: DashMap::new(),
            by_connection: DashMap::new(),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Whether any live subscription of `kind` exists.
    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        self.subscriptions.iter().any(|entry| entry.kind == kind)
    }

    /// Pushes a log to every `logs` subscription whose filter matches it.
    /// Returns the number of deliveries.
    pub fn publish_log(&self, log: &Value) -> usize {
        self.publish(EventKind::Logs, log)
    }

    /// Pushes a block header to every `newHeads` subscription.
    pub fn publish_new_head(&self, header: &Value) -> usize {
        self.publish(EventKind::NewHeads, header)
    }

    fn publish(&self, kind: EventKind, event: &Value) -> usize {
        let targets: Vec<(String, Arc<Connection>)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.kind == kind && entry.filter.matches(event))
            .map(|entry| (entry.key().clone(), entry.connection.clone()))
            .collect();

        let mut delivered = 0;
        for (id, connection) in targets {
            match connection.send(message::create_subscription_event(&id, event)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // Closed or writer gone: the subscription can never deliver again.
                    debug!(
                        "Dropping {} subscription {} on dead connection {}: {}",
                        kind.as_str(),
                        id,
                        connection.id,
                        e
                    );
                    self.unsubscribe(connection.id, Some(&id));
                }
            }
        }
        delivered
    }

    fn remove(&self, id: &str) -> bool {
        if self.subscriptions.remove(id).is_some() {
            self.metrics.subscriptions.dec();
            true
        } else {
            false
        }
    }
}

impl SubscriptionRegistry for InMemorySubscriptionRegistry {
    fn subscribe(
        &self,
        connection: &Arc<Connection>,
        kind: EventKind,
        filter: Option<LogFilter>,
    ) -> String {
        let id = generate_subscription_id();
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                connection: connection.clone(),
                kind,
                filter: filter.unwrap_or_default(),
            },
        );
        self.by_connection
            .entry(connection.id)
            .or_default()
            .insert(id.clone());
        self.metrics.subscriptions.inc();

        info!(
            "Connection {}: subscribed to {} with id {}",
            connection.id,
            kind.as_str(),
            id
        );
        id
    }

    fn unsubscribe(&self, connection_id: Uuid, subscription_id: Option<&str>) -> usize {
        match subscription_id {
            Some(id) => {
                let owned = self
                    .by_connection
                    .get_mut(&connection_id)
                    .is_some_and(|mut ids| ids.remove(id));
                self.by_connection
                    .remove_if(&connection_id, |_, ids| ids.is_empty());
                if !owned {
                    warn!(
                        "Connection {}: no subscription with id {}",
                        connection_id, id
                    );
                    return 0;
                }
                usize::from(self.remove(id))
            }
            None => {
                let Some((_, ids)) = self.by_connection.remove(&connection_id) else {
                    return 0;
                };
                let removed = ids.iter().filter(|id| self.remove(id)).count();
                if removed > 0 {
                    info!(
                        "Connection {}: removed {} subscriptions",
                        connection_id, removed
                    );
                }
                removed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tungstenite::Message;

    const ADDRESS: &str = "0x00000000000000000000000000000000000003e8";

    fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new("127.0.0.1:5000".parse().unwrap(), tx), rx)
    }

    fn registry() -> InMemorySubscriptionRegistry {
        InMemorySubscriptionRegistry::new(RelayMetrics::new().unwrap())
    }

    fn frame_json(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn ids_are_prefixed_128_bit_hex() {
        let id = generate_subscription_id();
        assert!(id.starts_with("0x"));
        assert_eq!(id.len(), 34);
        assert_ne!(id, generate_subscription_id());
    }

    #[tokio::test]
    async fn unsubscribe_only_removes_own_subscriptions() {
        let registry = registry();
        let (a, _rx_a) = connection();
        let (b, _rx_b) = connection();
        let id = registry.subscribe(&a, EventKind::NewHeads, None);

        assert_eq!(registry.unsubscribe(b.id, Some(&id)), 0);
        assert_eq!(registry.unsubscribe(a.id, Some(&id)), 1);
        assert_eq!(registry.unsubscribe(a.id, Some(&id)), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_connection() {
        let registry = registry();
        let (a, _rx) = connection();
        registry.subscribe(&a, EventKind::NewHeads, None);
        registry.subscribe(&a, EventKind::Logs, None);
        assert_eq!(registry.unsubscribe(a.id, None), 2);
        assert_eq!(registry.unsubscribe(a.id, None), 0);
        assert_eq!(registry.metrics.subscriptions.get(), 0);
    }

    #[tokio::test]
    async fn logs_fan_out_only_to_matching_filters() {
        let registry = registry();
        let (a, mut rx_a) = connection();
        let (b, mut rx_b) = connection();
        let filter = LogFilter::from_param(Some(&json!({ "address": ADDRESS }))).unwrap();
        let id = registry.subscribe(&a, EventKind::Logs, Some(filter));
        registry.subscribe(&b, EventKind::NewHeads, None);

        let log = json!({ "address": ADDRESS, "topics": [] });
        assert_eq!(registry.publish_log(&log), 1);
        assert_eq!(
            registry.publish_log(&json!({ "address": "0x0000000000000000000000000000000000000001" })),
            0
        );

        let frame = frame_json(rx_a.recv().await.unwrap());
        assert_eq!(frame["method"], "eth_subscription");
        assert_eq!(frame["params"]["subscription"], json!(id));
        assert_eq!(frame["params"]["result"], log);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_prunes_closed_connections() {
        let registry = registry();
        let (live, mut rx) = connection();
        let (closed, _rx_closed) = connection();
        registry.subscribe(&live, EventKind::NewHeads, None);
        registry.subscribe(&closed, EventKind::NewHeads, None);
        closed.mark_closed();

        assert_eq!(registry.publish_new_head(&json!({ "number": "0x1" })), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.unsubscribe(closed.id, None), 0);
        assert_eq!(registry.metrics.subscriptions.get(), 1);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let registry = registry();
        let (a, mut rx) = connection();
        registry.subscribe(&a, EventKind::NewHeads, None);
        for number in 1..=3 {
            registry.publish_new_head(&json!({ "number": number }));
        }
        for number in 1..=3 {
            let frame = frame_json(rx.recv().await.unwrap());
            assert_eq!(frame["params"]["result"]["number"], json!(number));
        }
    }
}
