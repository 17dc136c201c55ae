use std::{panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, instrument, warn, Level};

use crate::{
    config::SharedConfig,
    context::RequestContext,
    relay::{
        methods::{self, MethodSpec, ETH_SUBSCRIBE, ETH_UNSUBSCRIBE},
        Relay,
    },
    server::{
        client::Connection,
        health::RelayMetrics,
        limiter::ConnectionLimiter,
        message::{JsonRpcRequest, JsonRpcResponse},
        middleware::validation,
    },
    utils::error::{JsonRpcError, RelayError},
};

/// Turns one decoded request into exactly one response.
///
/// Every failure along the way, including a panicking handler, becomes a
/// JSON-RPC error response; nothing here can tear down the connection.
pub struct RequestDispatcher {
    pub(crate) config: SharedConfig,
    pub(crate) relay: Arc<dyn Relay>,
    pub(crate) limiter: Arc<ConnectionLimiter>,
    pub(crate) metrics: RelayMetrics,
}

impl RequestDispatcher {
    pub fn new(
        config: SharedConfig,
        relay: Arc<dyn Relay>,
        limiter: Arc<ConnectionLimiter>,
        metrics: RelayMetrics,
    ) -> Self {
        Self {
            config,
            relay,
            limiter,
            metrics,
        }
    }

    /// Validates, rate limits and executes a single request.
    ///
    /// # Arguments
    ///
    /// * `conn` - The connection the request arrived on.
    /// * `raw` - The decoded JSON value of the request.
    /// * `ctx` - Request context carried into logs.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, connection_id = %ctx.connection_id))]
    pub async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        raw: Value,
        ctx: &RequestContext,
    ) -> JsonRpcResponse {
        let id_is_optional = self.config.read().request_id_is_optional;
        let request = match validation::validate_envelope(raw, id_is_optional, ctx) {
            Ok(request) => request,
            Err(rejected) => {
                warn!("{} Invalid request envelope", ctx);
                self.metrics.record_method_error("unknown", &rejected.error.name);
                return JsonRpcResponse::error(rejected.error, rejected.id);
            }
        };

        let Some(spec) = methods::lookup(&request.method) else {
            warn!("{} Method {} not found", ctx, request.method);
            let error = JsonRpcError::method_not_found(&request.method);
            self.metrics.record_method_error("unsupported", &error.name);
            return JsonRpcResponse::error(error, request.id);
        };
        self.metrics.method_requests.with_label_values(&[spec.name]).inc();

        if let Err(error) = self.admit(conn, spec, &request, ctx) {
            self.metrics.record_method_error(spec.name, &error.name);
            return JsonRpcResponse::error(error, request.id);
        }

        let id = request.id.clone();
        let outcome = AssertUnwindSafe(self.execute(conn, spec, request.params, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(JsonRpcError::internal_error(&format!("handler for {} panicked", spec.name)).into())
            });

        match outcome {
            Ok(result) => {
                if tracing::enabled!(Level::DEBUG) {
                    debug!("{} Successfully executed method {}", ctx, spec.name);
                }
                JsonRpcResponse::success(result, id)
            }
            Err(err) => {
                let error = err.into_rpc_error();
                error!(
                    "{} Error invoking {}: code={} message={}",
                    ctx, spec.name, error.code, error.message
                );
                self.metrics.record_method_error(spec.name, &error.name);
                JsonRpcResponse::error(error, id)
            }
        }
    }

    /// Rate limit, subscription quota and parameter checks, in that order.
    fn admit(
        &self,
        conn: &Connection,
        spec: &MethodSpec,
        request: &JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Result<(), JsonRpcError> {
        if self
            .limiter
            .should_rate_limit_on_method(ctx.ip, spec.name, &ctx.request_id)
        {
            return Err(JsonRpcError::ip_rate_limit_exceeded(spec.name));
        }

        if spec.name == ETH_SUBSCRIBE && !self.limiter.validate_subscription_limit(conn) {
            warn!(
                "{} Connection {} reached its subscription limit",
                ctx, conn.id
            );
            return Err(JsonRpcError::max_subscriptions());
        }

        validation::validate_params(spec, &request.params).map_err(|error| {
            debug!("{} Invalid parameters for {}: {}", ctx, spec.name, error);
            error
        })
    }

    async fn execute(
        &self,
        conn: &Arc<Connection>,
        spec: &'static MethodSpec,
        params: Vec<Value>,
        ctx: &RequestContext,
    ) -> Result<Value, RelayError> {
        match spec.name {
            ETH_SUBSCRIBE => self.handle_subscribe(conn, &params, ctx).await,
            ETH_UNSUBSCRIBE => self.handle_unsubscribe(conn, &params, ctx),
            _ => {
                let params = spec.normalize_params(params);
                self.relay
                    .namespace(spec.namespace)
                    .call(spec.name, params, ctx)
                    .await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::RelayConfig,
        relay::{EntityType, MirrorNodeClient, RelayNamespace},
        subscriptions::{InMemorySubscriptionRegistry, SubscriptionRegistry},
    };
    use async_trait::async_trait;
    use prometheus::core::Collector;
    use serde_json::json;
    use std::{net::SocketAddr, time::Duration};
    use tokio::sync::mpsc;
    use tungstenite::Message;

    pub(crate) const CONTRACT: &str = "0x00000000000000000000000000000000000003e8";

    /// Echoes the method and params back, or fails for a few magic methods.
    pub(crate) struct EchoNamespace;

    #[async_trait]
    impl RelayNamespace for EchoNamespace {
        async fn call(
            &self,
            method: &str,
            params: Vec<Value>,
            _ctx: &RequestContext,
        ) -> Result<Value, RelayError> {
            match method {
                "eth_sendRawTransaction" => Err(RelayError::Rpc(
                    JsonRpcError::new(-32000, "REVERTED", "execution reverted")
                        .with_data(json!("0xdead")),
                )),
                "eth_mining" => Err(RelayError::Upstream("socket hang up".into())),
                "eth_hashrate" => panic!("boom"),
                _ => Ok(json!({ "method": method, "params": params })),
            }
        }
    }

    /// Knows exactly one contract address, answering after `delay`.
    pub(crate) struct StaticMirror {
        pub(crate) delay: Duration,
    }

    #[async_trait]
    impl MirrorNodeClient for StaticMirror {
        async fn resolve_entity_type(
            &self,
            address: &str,
            _ctx: &RequestContext,
        ) -> Result<Option<EntityType>, RelayError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok((address.to_lowercase() == CONTRACT).then_some(EntityType::Contract))
        }
    }

    pub(crate) struct TestRelay {
        pub(crate) namespace: EchoNamespace,
        pub(crate) subs: InMemorySubscriptionRegistry,
        pub(crate) mirror: StaticMirror,
    }

    impl Relay for TestRelay {
        fn eth(&self) -> &dyn RelayNamespace {
            &self.namespace
        }
        fn net(&self) -> &dyn RelayNamespace {
            &self.namespace
        }
        fn web3(&self) -> &dyn RelayNamespace {
            &self.namespace
        }
        fn subs(&self) -> &dyn SubscriptionRegistry {
            &self.subs
        }
        fn mirror_client(&self) -> &dyn MirrorNodeClient {
            &self.mirror
        }
    }

    pub(crate) fn dispatcher(config: RelayConfig) -> RequestDispatcher {
        dispatcher_with_mirror_delay(config, Duration::ZERO)
    }

    pub(crate) fn dispatcher_with_mirror_delay(
        config: RelayConfig,
        delay: Duration,
    ) -> RequestDispatcher {
        let metrics = RelayMetrics::new().unwrap();
        let config = config.shared();
        let relay = Arc::new(TestRelay {
            namespace: EchoNamespace,
            subs: InMemorySubscriptionRegistry::new(metrics.clone()),
            mirror: StaticMirror { delay },
        });
        let limiter = Arc::new(ConnectionLimiter::new(config.clone(), metrics.clone()));
        RequestDispatcher::new(config, relay, limiter, metrics)
    }

    pub(crate) fn connection() -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        (Connection::new(addr, tx), rx)
    }

    pub(crate) fn ctx(conn: &Connection) -> RequestContext {
        RequestContext::new(conn.id, conn.ip())
    }

    fn request(method: &str, params: Value) -> Value {
        json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params })
    }

    #[tokio::test]
    async fn forwards_with_padded_params() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let response = dispatcher
            .dispatch(&conn, request("eth_getCode", json!([CONTRACT])), &ctx(&conn))
            .await;
        assert_eq!(
            response.result,
            Some(json!({ "method": "eth_getCode", "params": [CONTRACT, null] }))
        );
        assert_eq!(response.id, json!(1));
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let response = dispatcher
            .dispatch(&conn, request("eth_sign", json!([])), &ctx(&conn))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(response.id, json!(1));
    }

    #[tokio::test]
    async fn unknown_methods_share_one_error_series() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        for i in 0..20 {
            let method = format!("junk_{i}");
            let response = dispatcher
                .dispatch(&conn, request(&method, json!([])), &ctx(&conn))
                .await;
            assert_eq!(response.error.unwrap().code, -32601);
        }

        let series: usize = dispatcher
            .metrics
            .method_errors
            .collect()
            .iter()
            .map(|family| family.get_metric().len())
            .sum();
        assert_eq!(series, 1);
        assert_eq!(
            dispatcher
                .metrics
                .method_errors
                .with_label_values(&["unsupported", "METHOD_NOT_FOUND"])
                .get(),
            20
        );
    }

    #[tokio::test]
    async fn invalid_envelope_uses_null_id_when_missing() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let response = dispatcher
            .dispatch(
                &conn,
                json!({ "jsonrpc": "2.0", "method": "eth_chainId" }),
                &ctx(&conn),
            )
            .await;
        assert_eq!(response.error.unwrap().code, -32600);
        assert_eq!(response.id, Value::Null);
    }

    #[tokio::test]
    async fn optional_id_defaults_to_zero() {
        let dispatcher = dispatcher(RelayConfig {
            request_id_is_optional: true,
            ..RelayConfig::default()
        });
        let (conn, _rx) = connection();
        let response = dispatcher
            .dispatch(
                &conn,
                json!({ "jsonrpc": "2.0", "method": "eth_chainId" }),
                &ctx(&conn),
            )
            .await;
        assert!(!response.is_error());
        assert_eq!(response.id, json!("0"));
    }

    #[tokio::test]
    async fn domain_errors_pass_through_and_others_are_wrapped() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();

        let reverted = dispatcher
            .dispatch(&conn, request("eth_sendRawTransaction", json!(["0x01"])), &ctx(&conn))
            .await
            .error
            .unwrap();
        assert_eq!(reverted.code, -32000);
        assert_eq!(reverted.data, Some(json!("0xdead")));

        let wrapped = dispatcher
            .dispatch(&conn, request("eth_mining", json!([])), &ctx(&conn))
            .await
            .error
            .unwrap();
        assert_eq!(wrapped.code, -32603);
        assert!(wrapped.message.contains("socket hang up"));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal_error() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let response = dispatcher
            .dispatch(&conn, request("eth_hashrate", json!([])), &ctx(&conn))
            .await;
        assert_eq!(response.error.unwrap().code, -32603);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_runs_before_param_validation() {
        let dispatcher = dispatcher(RelayConfig {
            tier_1_rate_limit: 1,
            ..RelayConfig::default()
        });
        let (conn, _rx) = connection();
        let first = dispatcher
            .dispatch(&conn, request("eth_call", json!([])), &ctx(&conn))
            .await;
        assert_eq!(first.error.unwrap().code, -32602);

        let second = dispatcher
            .dispatch(&conn, request("eth_call", json!([])), &ctx(&conn))
            .await;
        assert_eq!(second.error.unwrap().code, -32605);
    }

    #[tokio::test]
    async fn missing_required_parameter() {
        let dispatcher = dispatcher(RelayConfig::default());
        let (conn, _rx) = connection();
        let error = dispatcher
            .dispatch(&conn, request("eth_getBalance", json!([CONTRACT])), &ctx(&conn))
            .await
            .error
            .unwrap();
        assert_eq!(error, JsonRpcError::missing_required_parameter(1));
    }
}
