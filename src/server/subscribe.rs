use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{debug, info};

use super::dispatcher::RequestDispatcher;
use crate::{
    context::RequestContext,
    server::client::Connection,
    subscriptions::{EventKind, LogFilter},
    utils::error::{JsonRpcError, RelayError},
};

impl RequestDispatcher {
    /// `eth_subscribe`: registers a `logs` or `newHeads` subscription and
    /// returns its id.
    ///
    /// # Errors
    ///
    /// * Invalid-parameter errors for malformed filters, addresses the mirror
    ///   node cannot resolve, or more than one address when multi-address
    ///   subscriptions are disabled.
    /// * `UNSUPPORTED_METHOD` for unknown kinds or disabled `newHeads`.
    pub(crate) async fn handle_subscribe(
        &self,
        conn: &Arc<Connection>,
        params: &[Value],
        ctx: &RequestContext,
    ) -> Result<Value, RelayError> {
        let kind = params.first().and_then(Value::as_str).unwrap_or_default();

        let (kind, filter) = match kind {
            "logs" => {
                let filter = LogFilter::from_param(params.get(1))?;
                self.validate_log_addresses(&filter, ctx).await?;
                if filter.addresses().len() > 1 && !self.config.read().multiple_addresses_enabled {
                    return Err(JsonRpcError::invalid_parameter(
                        "filters.address",
                        "Only one contract address is allowed",
                    )
                    .into());
                }
                (EventKind::Logs, Some(filter))
            }
            "newHeads" if self.config.read().new_heads_enabled => (EventKind::NewHeads, None),
            other => {
                debug!("{} Unsupported subscription kind {:?}", ctx, other);
                return Err(JsonRpcError::unsupported_method().into());
            }
        };

        // Teardown may have run while the mirror lookups were pending.
        if conn.is_closed() {
            debug!("{} Connection {} closed before subscribing", ctx, conn.id);
            return Err(RelayError::ConnectionError("connection closed".into()));
        }
        let subs = self.relay.subs();
        let id = subs.subscribe(conn, kind, filter);
        if conn.is_closed() {
            subs.unsubscribe(conn.id, Some(&id));
            debug!("{} Connection {} closed while subscribing", ctx, conn.id);
            return Err(RelayError::ConnectionError("connection closed".into()));
        }
        self.limiter.increment_subs(conn);
        Ok(Value::String(id))
    }

    /// Every address of a `logs` filter must be a known contract or token.
    async fn validate_log_addresses(
        &self,
        filter: &LogFilter,
        ctx: &RequestContext,
    ) -> Result<(), RelayError> {
        let mirror = self.relay.mirror_client();
        let lookups = filter
            .addresses()
            .iter()
            .map(|address| mirror.resolve_entity_type(address, ctx));
        let resolved = join_all(lookups).await;

        for (address, entity) in filter.addresses().iter().zip(resolved) {
            if entity?.is_none() {
                return Err(JsonRpcError::invalid_parameter(
                    "filters.address",
                    &format!("{address} is not a valid contract or token type or does not exist"),
                )
                .into());
            }
        }
        Ok(())
    }

    /// `eth_unsubscribe`: `true` when a subscription owned by this connection
    /// was removed.
    pub(crate) fn handle_unsubscribe(
        &self,
        conn: &Connection,
        params: &[Value],
        ctx: &RequestContext,
    ) -> Result<Value, RelayError> {
        let id = params.first().and_then(Value::as_str).unwrap_or_default();
        let removed = self.relay.subs().unsubscribe(conn.id, Some(id));
        self.limiter.decrement_subs(conn, removed);
        info!(
            "{} Unsubscribe {} on connection {}: removed {}",
            ctx, id, conn.id, removed
        );
        Ok(Value::Bool(removed > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RelayConfig,
        server::dispatcher::tests::{
            connection, ctx, dispatcher, dispatcher_with_mirror_delay, CONTRACT,
        },
    };
    use serde_json::json;

    const OTHER_CONTRACT: &str = "0x1111111111111111111111111111111111111111";

    fn subscribe(params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": 1, "method": "eth_subscribe", "params": params })
    }

    fn unsubscribe(id: &Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": 2, "method": "eth_unsubscribe", "params": [id] })
    }

    #[tokio::test]
    async fn logs_subscription_returns_id_and_counts() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let response = dispatcher
            .dispatch(&conn, subscribe(json!(["logs", { "address": CONTRACT }])), &ctx(&conn))
            .await;
        let id = response.result.unwrap();
        assert!(id.as_str().unwrap().starts_with("0x"));
        assert_eq!(conn.subscription_count(), 1);
    }

    #[tokio::test]
    async fn unresolvable_address_is_rejected_by_name() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let error = dispatcher
            .dispatch(
                &conn,
                subscribe(json!(["logs", { "address": OTHER_CONTRACT }])),
                &ctx(&conn),
            )
            .await
            .error
            .unwrap();
        assert_eq!(error.code, -32602);
        assert!(error.message.contains("filters.address"));
        assert!(error.message.contains(OTHER_CONTRACT));
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn multiple_addresses_need_the_flag() {
        let params = json!(["logs", { "address": [CONTRACT, CONTRACT] }]);

        let dispatcher_off = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let error = dispatcher_off
            .dispatch(&conn, subscribe(params.clone()), &ctx(&conn))
            .await
            .error
            .unwrap();
        assert!(error.message.contains("Only one contract address is allowed"));

        let dispatcher_on = dispatcher(RelayConfig {
            multiple_addresses_enabled: true,
            ..RelayConfig::default()
        });
        let response = dispatcher_on
            .dispatch(&conn, subscribe(params), &ctx(&conn))
            .await;
        assert!(!response.is_error());
    }

    #[tokio::test]
    async fn address_existence_is_checked_before_the_multi_address_gate() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let error = dispatcher
            .dispatch(
                &conn,
                subscribe(json!(["logs", { "address": [CONTRACT, OTHER_CONTRACT] }])),
                &ctx(&conn),
            )
            .await
            .error
            .unwrap();
        assert!(error.message.contains(OTHER_CONTRACT));
    }

    #[tokio::test]
    async fn new_heads_follows_flag() {
        let (conn, _rx) = connection();
        let enabled = dispatcher(RelayConfig::default());
        assert!(!enabled
            .dispatch(&conn, subscribe(json!(["newHeads"])), &ctx(&conn))
            .await
            .is_error());

        let disabled = dispatcher(RelayConfig {
            new_heads_enabled: false,
            ..RelayConfig::default()
        });
        let error = disabled
            .dispatch(&conn, subscribe(json!(["newHeads"])), &ctx(&conn))
            .await
            .error
            .unwrap();
        assert_eq!(error, JsonRpcError::unsupported_method());
    }

    #[tokio::test]
    async fn closed_connection_gets_no_subscription() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        conn.mark_closed();
        assert_eq!(dispatcher.relay.subs().unsubscribe(conn.id, None), 0);

        let response = dispatcher
            .dispatch(&conn, subscribe(json!(["newHeads"])), &ctx(&conn))
            .await;
        assert!(response.is_error());
        assert_eq!(dispatcher.relay.subs().unsubscribe(conn.id, None), 0);
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_address_lookup_registers_nothing() {
        let dispatcher = dispatcher_with_mirror_delay(
            RelayConfig::default(),
            std::time::Duration::from_millis(100),
        );
        let (conn, _rx) = connection();
        let request = subscribe(json!(["logs", { "address": CONTRACT }]));
        let context = ctx(&conn);

        let (response, removed) = tokio::join!(dispatcher.dispatch(&conn, request, &context), async {
            conn.mark_closed();
            dispatcher.relay.subs().unsubscribe(conn.id, None)
        });
        assert_eq!(removed, 0);
        assert!(response.is_error());
        assert_eq!(dispatcher.relay.subs().unsubscribe(conn.id, None), 0);
    }

    #[tokio::test]
    async fn unknown_kind_is_unsupported() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let error = dispatcher
            .dispatch(&conn, subscribe(json!(["pendingTransactions"])), &ctx(&conn))
            .await
            .error
            .unwrap();
        assert_eq!(error, JsonRpcError::unsupported_method());
    }

    #[tokio::test]
    async fn subscription_limit_is_enforced() {
        let dispatcher = dispatcher(RelayConfig {
            subscription_limit: 1,
            ..RelayConfig::default()
        });
        let (conn, _rx) = connection();
        assert!(!dispatcher
            .dispatch(&conn, subscribe(json!(["newHeads"])), &ctx(&conn))
            .await
            .is_error());
        let error = dispatcher
            .dispatch(&conn, subscribe(json!(["newHeads"])), &ctx(&conn))
            .await
            .error
            .unwrap();
        assert_eq!(error, JsonRpcError::max_subscriptions());
    }

    #[tokio::test]
    async fn unsubscribe_reports_removal_and_frees_quota() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let id = dispatcher
            .dispatch(&conn, subscribe(json!(["newHeads"])), &ctx(&conn))
            .await
            .result
            .unwrap();

        let removed = dispatcher.dispatch(&conn, unsubscribe(&id), &ctx(&conn)).await;
        assert_eq!(removed.result, Some(json!(true)));
        assert_eq!(conn.subscription_count(), 0);

        let again = dispatcher.dispatch(&conn, unsubscribe(&id), &ctx(&conn)).await;
        assert_eq!(again.result, Some(json!(false)));
    }

    #[tokio::test]
    async fn cannot_unsubscribe_someone_elses_subscription() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (owner, _rx1) = connection();
        let (intruder, _rx2) = connection();
        let id = dispatcher
            .dispatch(&owner, subscribe(json!(["newHeads"])), &ctx(&owner))
            .await
            .result
            .unwrap();
        let response = dispatcher
            .dispatch(&intruder, unsubscribe(&id), &ctx(&intruder))
            .await;
        assert_eq!(response.result, Some(json!(false)));
        assert_eq!(owner.subscription_count(), 1);
    }
}
