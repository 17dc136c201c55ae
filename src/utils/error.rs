use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::cache::CacheError;

/// Represents the internal errors that can occur in the relay.
///
/// These never reach a client verbatim: the dispatcher turns them into
/// [`JsonRpcError::internal_error`] responses.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Represents a general connection error.
    ///
    /// This error occurs when the WebSocket connection fails or encounters issues.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Indicates a failure in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Represents an error in the relay configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A cache backend failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// The upstream relay or mirror node could not be reached or answered garbage.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// A JSON-RPC error produced by a collaborator, passed through to the client.
    #[error(transparent)]
    Rpc(#[from] JsonRpcError),

    /// Represents an error related to connection bookkeeping.
    #[error("Client error: {0}")]
    ClientError(#[from] crate::server::client::ClientError),
}

/// Implements conversion from `serde_json::Error` to `RelayError`.
///
/// This allows serialization errors to be automatically converted into
/// `RelayError::SerializationError`.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Upstream(err.to_string())
    }
}

impl RelayError {
    /// Converts any relay error into the client-facing error object.
    ///
    /// Domain errors pass through verbatim, anything else is wrapped as an
    /// internal error carrying the stringified cause.
    pub fn into_rpc_error(self) -> JsonRpcError {
        match self {
            RelayError::Rpc(err) => err,
            other => JsonRpcError::internal_error(&other.to_string()),
        }
    }
}

/// JSON-RPC 2.0 error object sent back to clients.
///
/// `name` is a short stable category used in logs and metrics; it is not part
/// of the wire format.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip, default)]
    pub name: Cow<'static, str>,
}

pub mod codes {
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const IP_RATE_LIMIT_EXCEEDED: i32 = -32605;
    pub const MAX_SUBSCRIPTIONS: i32 = -32608;
    pub const BATCH_REQUESTS_METHOD_NOT_PERMITTED: i32 = -32007;
    pub const WS_BATCH_REQUESTS_DISABLED: i32 = -32202;
    pub const BATCH_REQUESTS_AMOUNT_MAX_EXCEEDED: i32 = -32203;
}

impl JsonRpcError {
    pub fn new(code: i32, name: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            name: Cow::Borrowed(name),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Drops the `data` payload; batch responses stay minimal.
    pub fn without_data(mut self) -> Self {
        self.data = None;
        self
    }

    pub fn invalid_request() -> Self {
        Self::new(codes::INVALID_REQUEST, "INVALID_REQUEST", "Invalid Request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            "METHOD_NOT_FOUND",
            format!("Method {method} not found"),
        )
    }

    pub fn unsupported_method() -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            "UNSUPPORTED_METHOD",
            "Unsupported JSON-RPC method",
        )
    }

    pub fn invalid_parameters(reason: &str) -> Self {
        Self::new(
            codes::INVALID_PARAMS,
            "INVALID_PARAMETERS",
            format!("Invalid params: {reason}"),
        )
    }

    pub fn invalid_parameter(name: impl std::fmt::Display, reason: &str) -> Self {
        Self::new(
            codes::INVALID_PARAMS,
            "INVALID_PARAMETER",
            format!("Invalid parameter {name}: {reason}"),
        )
    }

    pub fn missing_required_parameter(index: usize) -> Self {
        Self::new(
            codes::INVALID_PARAMS,
            "MISSING_REQUIRED_PARAMETER",
            format!("Missing value for required parameter {index}"),
        )
    }

    pub fn internal_error(cause: &str) -> Self {
        Self::new(
            codes::INTERNAL_ERROR,
            "INTERNAL_ERROR",
            format!("Error invoking RPC: {cause}"),
        )
        .with_data(Value::String(cause.to_string()))
    }

    pub fn ip_rate_limit_exceeded(method: &str) -> Self {
        Self::new(
            codes::IP_RATE_LIMIT_EXCEEDED,
            "IP_RATE_LIMIT_EXCEEDED",
            format!("IP Rate limit exceeded on {method}"),
        )
    }

    pub fn max_subscriptions() -> Self {
        Self::new(
            codes::MAX_SUBSCRIPTIONS,
            "MAX_SUBSCRIPTIONS",
            "Exceeded maximum allowed subscriptions",
        )
    }

    pub fn batch_requests_disabled() -> Self {
        Self::new(
            codes::WS_BATCH_REQUESTS_DISABLED,
            "WS_BATCH_REQUESTS_DISABLED",
            "WS batch requests are disabled",
        )
    }

    pub fn batch_requests_amount_max_exceeded(amount: usize, max: usize) -> Self {
        Self::new(
            codes::BATCH_REQUESTS_AMOUNT_MAX_EXCEEDED,
            "BATCH_REQUESTS_AMOUNT_MAX_EXCEEDED",
            format!("Batch request amount {amount} exceeds max {max}"),
        )
        .with_data(json!({ "amount": amount, "max": max }))
    }

    pub fn batch_method_not_permitted(method: &str) -> Self {
        Self::new(
            codes::BATCH_REQUESTS_METHOD_NOT_PERMITTED,
            "BATCH_REQUESTS_METHOD_NOT_PERMITTED",
            format!("Method {method} is not permitted as part of batch requests"),
        )
    }
}

/// Whole-connection failures, reported with a JSON error frame followed by a
/// WebSocket close frame carrying the same code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ConnectionLimitExceeded { limit: usize },
    IpLimitExceeded { limit: usize },
    TtlExpired { ttl_ms: u64 },
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ConnectionLimitExceeded { .. } => 4001,
            CloseReason::IpLimitExceeded { .. } => 4002,
            CloseReason::TtlExpired { .. } => 4003,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            CloseReason::ConnectionLimitExceeded { .. } => "Connection limit exceeded",
            CloseReason::IpLimitExceeded { .. } => "Exceeded maximum connections from a single IP address",
            CloseReason::TtlExpired { .. } => "Connection timeout expired",
        }
    }

    /// JSON body sent just before the close frame.
    pub fn to_error(&self) -> JsonRpcError {
        let (name, data) = match self {
            CloseReason::ConnectionLimitExceeded { limit } => {
                ("CONNECTION_LIMIT_EXCEEDED", json!(limit.to_string()))
            }
            CloseReason::IpLimitExceeded { limit } => {
                ("CONNECTION_IP_LIMIT_EXCEEDED", json!(limit.to_string()))
            }
            CloseReason::TtlExpired { ttl_ms } => ("TTL_EXPIRED", json!(ttl_ms.to_string())),
        };
        JsonRpcError::new(i32::from(self.code()), name, self.message()).with_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_wraps_cause_as_payload() {
        let err = RelayError::Upstream("connection refused".into()).into_rpc_error();
        assert_eq!(err.code, codes::INTERNAL_ERROR);
        assert_eq!(err.data, Some(json!("Upstream error: connection refused")));
    }

    #[test]
    fn domain_errors_pass_through() {
        let err = RelayError::from(JsonRpcError::max_subscriptions()).into_rpc_error();
        assert_eq!(err, JsonRpcError::max_subscriptions());
    }

    #[test]
    fn name_is_not_serialized() {
        let value = serde_json::to_value(JsonRpcError::invalid_request()).unwrap();
        assert_eq!(value, json!({ "code": -32600, "message": "Invalid Request" }));
    }

    #[test]
    fn close_reasons_echo_the_limit() {
        let err = CloseReason::IpLimitExceeded { limit: 3 }.to_error();
        assert_eq!(err.code, 4002);
        assert_eq!(err.data, Some(json!("3")));
        assert_eq!(CloseReason::TtlExpired { ttl_ms: 10 }.code(), 4003);
    }

    #[test]
    fn batch_amount_error_names_both_sizes() {
        let err = JsonRpcError::batch_requests_amount_max_exceeded(25, 20);
        assert!(err.message.contains("25"));
        assert!(err.message.contains("20"));
    }
}
