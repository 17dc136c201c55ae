use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tungstenite::{
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};

use crate::utils::error::{CloseReason, JsonRpcError, RelayError};

pub const JSONRPC_VERSION: &str = "2.0";

/// A JSON-RPC request whose envelope has already been validated.
///
/// `params` is always a sequence; clients that omit it get an empty one.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub id: Value,
}

/// JSON-RPC 2.0 response. Exactly one of `result` and `error` is meaningful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn success(result: Value, id: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(error: JsonRpcError, id: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Converts a response into a text frame.
impl TryFrom<&JsonRpcResponse> for Message {
    type Error = RelayError;

    fn try_from(response: &JsonRpcResponse) -> Result<Self, Self::Error> {
        Ok(Message::Text(serde_json::to_string(response)?))
    }
}

/// Serializes a batch of responses into one text frame.
pub fn create_batch_message(responses: &[JsonRpcResponse]) -> Result<Message, RelayError> {
    Ok(Message::Text(serde_json::to_string(responses)?))
}

/// Unsolicited subscription push.
pub fn create_subscription_event(subscription_id: &str, result: &Value) -> Message {
    let frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": "eth_subscription",
        "params": {
            "subscription": subscription_id,
            "result": result,
        }
    });
    Message::Text(frame.to_string())
}

/// Keep-alive frame: a response with neither id nor result.
pub fn create_ping_message() -> Message {
    Message::Text(json!({ "jsonrpc": JSONRPC_VERSION, "id": null, "result": null }).to_string())
}

/// Error frame sent before a connection is closed, as a bare error object.
pub fn create_close_error_message(reason: &CloseReason) -> Result<Message, RelayError> {
    Ok(Message::Text(serde_json::to_string(&reason.to_error())?))
}

/// The close frame that follows [`create_close_error_message`].
pub fn create_close_frame(reason: &CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: Cow::Borrowed(reason.message()),
    }))
}
