//! Live event subscriptions.

pub mod filter;
pub mod poller;
pub mod registry;

use std::sync::Arc;

use uuid::Uuid;

pub use filter::LogFilter;
pub use poller::EventPoller;
pub use registry::InMemorySubscriptionRegistry;

use crate::server::client::Connection;

/// The event streams a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Logs,
    NewHeads,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Logs => "logs",
            EventKind::NewHeads => "newHeads",
        }
    }
}

/// Owns subscription records and pushes events to their connections.
pub trait SubscriptionRegistry: Send + Sync {
    /// Registers a subscription and returns its id.
    fn subscribe(
        &self,
        connection: &Arc<Connection>,
        kind: EventKind,
        filter: Option<LogFilter>,
    ) -> String;

    /// Removes one subscription of the connection, or all of them when
    /// `subscription_id` is `None`. Returns how many were removed.
    fn unsubscribe(&self, connection_id: Uuid, subscription_id: Option<&str>) -> usize;
}
