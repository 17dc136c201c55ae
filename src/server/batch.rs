use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use super::dispatcher::RequestDispatcher;
use crate::{
    context::RequestContext,
    server::{client::Connection, message::JsonRpcResponse},
    utils::error::JsonRpcError,
};

impl RequestDispatcher {
    /// Executes a batch concurrently and returns responses in request order.
    ///
    /// A disabled or oversized batch is answered with a single error element.
    /// Element errors have their `data` payload stripped.
    pub async fn dispatch_batch(
        &self,
        conn: &Arc<Connection>,
        requests: Vec<Value>,
        ctx: &RequestContext,
    ) -> Vec<JsonRpcResponse> {
        let (enabled, max_size, disallowed) = {
            let config = self.config.read();
            (
                config.batch_requests_enabled,
                config.batch_requests_max_size,
                config.batch_requests_disallowed_methods.clone(),
            )
        };

        if !enabled {
            warn!("{} Batch request rejected, batches are disabled", ctx);
            return vec![JsonRpcResponse::error(
                JsonRpcError::batch_requests_disabled(),
                Value::Null,
            )];
        }
        if requests.len() > max_size {
            warn!(
                "{} Batch of {} requests exceeds the maximum of {}",
                ctx,
                requests.len(),
                max_size
            );
            return vec![JsonRpcResponse::error(
                JsonRpcError::batch_requests_amount_max_exceeded(requests.len(), max_size),
                Value::Null,
            )];
        }
        if requests.is_empty() {
            return vec![JsonRpcResponse::error(
                JsonRpcError::invalid_request(),
                Value::Null,
            )];
        }

        info!("{} Processing batch of {} requests", ctx, requests.len());
        let disallowed = &disallowed;
        let responses = requests.into_iter().map(|request| {
            let ctx = ctx.child();
            async move {
                let method = request.get("method").and_then(Value::as_str);
                if let Some(method) = method.filter(|m| disallowed.iter().any(|d| d.as_str() == *m)) {
                    let id = request.get("id").cloned().unwrap_or(Value::Null);
                    return JsonRpcResponse::error(
                        JsonRpcError::batch_method_not_permitted(method),
                        id,
                    );
                }

                let mut response = self.dispatch(conn, request, &ctx).await;
                response.error = response.error.take().map(JsonRpcError::without_data);
                response
            }
        });

        join_all(responses).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RelayConfig,
        server::dispatcher::tests::{connection, ctx, dispatcher},
    };
    use serde_json::json;

    fn request(id: u64, method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    #[tokio::test]
    async fn responses_follow_request_order() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let batch = vec![
            request(1, "eth_chainId", json!([])),
            request(2, "eth_sign", json!([])),
            request(3, "net_version", json!([])),
        ];
        let responses = dispatcher.dispatch_batch(&conn, batch, &ctx(&conn)).await;

        let ids: Vec<_> = responses.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
        assert!(!responses[0].is_error());
        assert_eq!(responses[1].error.as_ref().unwrap().code, -32601);
        assert_eq!(responses[2].result.as_ref().unwrap()["method"], "net_version");
    }

    #[tokio::test]
    async fn disabled_batches_get_one_error() {
        let dispatcher = dispatcher(RelayConfig {
            batch_requests_enabled: false,
            ..RelayConfig::default()
        });
        let (conn, _rx) = connection();
        let responses = dispatcher
            .dispatch_batch(&conn, vec![request(1, "eth_chainId", json!([]))], &ctx(&conn))
            .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].error.as_ref().unwrap().code, -32202);
    }

    #[tokio::test]
    async fn oversized_batches_name_both_sizes() {
        let dispatcher = dispatcher(RelayConfig {
            batch_requests_max_size: 2,
            ..RelayConfig::default()
        });
        let (conn, _rx) = connection();
        let batch = (0..3).map(|i| request(i, "eth_chainId", json!([]))).collect();
        let responses = dispatcher.dispatch_batch(&conn, batch, &ctx(&conn)).await;
        assert_eq!(responses.len(), 1);
        let error = responses[0].error.as_ref().unwrap();
        assert_eq!(error.code, -32203);
        assert_eq!(error.data, Some(json!({ "amount": 3, "max": 2 })));
    }

    #[tokio::test]
    async fn disallowed_methods_are_rejected_per_element() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let batch = vec![
            request(1, "eth_subscribe", json!(["newHeads"])),
            request(2, "eth_chainId", json!([])),
        ];
        let responses = dispatcher.dispatch_batch(&conn, batch, &ctx(&conn)).await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, -32007);
        assert_eq!(responses[0].id, json!(1));
        assert!(!responses[1].is_error());
        assert_eq!(conn.subscription_count(), 0);
    }

    #[tokio::test]
    async fn element_errors_drop_their_data() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let batch = vec![
            request(1, "eth_sendRawTransaction", json!(["0x01"])),
            request(2, "eth_mining", json!([])),
        ];
        let responses = dispatcher.dispatch_batch(&conn, batch, &ctx(&conn)).await;
        for response in responses {
            let error = response.error.unwrap();
            assert!(error.data.is_none(), "{error:?}");
        }
    }

    #[tokio::test]
    async fn empty_batch_is_invalid() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let responses = dispatcher.dispatch_batch(&conn, vec![], &ctx(&conn)).await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, -32600);
    }
}
