use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    context::RequestContext,
    relay::methods::{MethodSpec, ParamType},
    server::message::{JsonRpcRequest, JSONRPC_VERSION},
    utils::error::JsonRpcError,
};

/// Id assigned to requests that omit one when ids are optional.
pub const DEFAULT_REQUEST_ID: &str = "0";

const BLOCK_TAGS: [&str; 5] = ["latest", "earliest", "pending", "safe", "finalized"];
const MAX_TOPIC_SLOTS: usize = 4;
const MAX_REWARD_PERCENTILES: usize = 100;

/// An envelope that failed validation, with the id to answer it under.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRequest {
    pub id: Value,
    pub error: JsonRpcError,
}

impl RejectedRequest {
    fn invalid(id: Value) -> Self {
        Self {
            id,
            error: JsonRpcError::invalid_request(),
        }
    }
}

/// Validates the JSON-RPC envelope of one request.
///
/// # Arguments
///
/// * `raw` - The decoded request object.
/// * `id_is_optional` - Whether a missing `id` is replaced by [`DEFAULT_REQUEST_ID`].
/// * `ctx` - Request context used for logging.
///
/// # Errors
///
/// Returns a [`RejectedRequest`] carrying an invalid-request error when the
/// value is not an object, `jsonrpc` is not `"2.0"`, `method` is missing or not
/// a string, `params` is neither absent nor an array, or `id` is missing and
/// ids are required.
pub fn validate_envelope(
    raw: Value,
    id_is_optional: bool,
    ctx: &RequestContext,
) -> Result<JsonRpcRequest, RejectedRequest> {
    let Value::Object(mut object) = raw else {
        return Err(RejectedRequest::invalid(Value::Null));
    };

    let id = object.remove("id");
    let reply_id = id.clone().unwrap_or(Value::Null);

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(RejectedRequest::invalid(reply_id));
    }

    let method = match object.remove("method") {
        Some(Value::String(method)) => method,
        _ => return Err(RejectedRequest::invalid(reply_id)),
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params,
        Some(_) => return Err(RejectedRequest::invalid(reply_id)),
    };

    let id = match id {
        Some(id) => id,
        None if id_is_optional => {
            warn!(
                "{} Request to {} has no id, answering with id {}",
                ctx, method, DEFAULT_REQUEST_ID
            );
            Value::String(DEFAULT_REQUEST_ID.to_string())
        }
        None => return Err(RejectedRequest::invalid(Value::Null)),
    };

    Ok(JsonRpcRequest { method, params, id })
}

/// Checks `params` against the method's parameter rules.
///
/// # Errors
///
/// Returns an invalid-parameters error when too many parameters are given, a
/// missing-parameter error when a required one is absent or `null`, and an
/// invalid-parameter error naming the position when a value has the wrong shape.
pub fn validate_params(spec: &MethodSpec, params: &[Value]) -> Result<(), JsonRpcError> {
    if params.len() > spec.params.len() {
        return Err(JsonRpcError::invalid_parameters(&format!(
            "Expected at most {} parameters for {}, got {}",
            spec.params.len(),
            spec.name,
            params.len()
        )));
    }

    for (index, rule) in spec.params.iter().enumerate() {
        match params.get(index) {
            None | Some(Value::Null) if rule.required => {
                return Err(JsonRpcError::missing_required_parameter(index));
            }
            None | Some(Value::Null) => {}
            Some(value) => validate_param(rule.kind, value)
                .map_err(|reason| JsonRpcError::invalid_parameter(index, &reason))?,
        }
    }
    Ok(())
}

fn validate_param(kind: ParamType, value: &Value) -> Result<(), String> {
    match kind {
        ParamType::Address => expect_str(value, is_address, ADDRESS_EXPECTATION),
        ParamType::BlockNumber => expect_str(value, is_block_number, BLOCK_NUMBER_EXPECTATION),
        ParamType::BlockHash | ParamType::TransactionHash | ParamType::StorageSlot => {
            expect_str(value, is_hash, HASH_EXPECTATION)
        }
        ParamType::BlockNumberOrHash => validate_block_number_or_hash(value),
        ParamType::Hex => expect_str(value, is_hex, HEX_EXPECTATION),
        ParamType::Quantity => match value {
            Value::Number(n) if n.is_u64() => Ok(()),
            Value::String(s) if is_quantity(s) => Ok(()),
            _ => Err(format!("{QUANTITY_EXPECTATION}, value: {value}")),
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Ok(()),
            _ => Err(format!("Expected boolean type, value: {value}")),
        },
        ParamType::TransactionObject => match value {
            Value::Object(object) => validate_transaction(object),
            _ => Err(format!("Expected TransactionObject, value: {value}")),
        },
        ParamType::Filter => match value {
            Value::Object(object) => validate_filter(object),
            _ => Err(format!("Expected FilterObject, value: {value}")),
        },
        ParamType::RewardPercentiles => validate_reward_percentiles(value),
        ParamType::SubscriptionKind | ParamType::SubscriptionId => match value {
            Value::String(s) if !s.is_empty() => Ok(()),
            _ => Err(format!("Expected non-empty string, value: {value}")),
        },
        ParamType::Any => Ok(()),
    }
}

const ADDRESS_EXPECTATION: &str =
    "Expected 0x prefixed string representing the address (20 bytes)";
const BLOCK_NUMBER_EXPECTATION: &str =
    "Expected 0x prefixed hexadecimal block number, or the string \"latest\", \"earliest\", \"pending\", \"safe\" or \"finalized\"";
const HASH_EXPECTATION: &str = "Expected 0x prefixed string representing the hash (32 bytes)";
const HEX_EXPECTATION: &str = "Expected 0x prefixed hexadecimal value";
const QUANTITY_EXPECTATION: &str = "Expected 0x prefixed hexadecimal quantity or a non-negative integer";

fn expect_str(value: &Value, check: fn(&str) -> bool, expectation: &str) -> Result<(), String> {
    match value.as_str() {
        Some(s) if check(s) => Ok(()),
        _ => Err(format!("{expectation}, value: {value}")),
    }
}

fn hex_digits(s: &str) -> Option<&str> {
    s.strip_prefix("0x")
        .filter(|digits| digits.bytes().all(|b| b.is_ascii_hexdigit()))
}

pub fn is_hex(s: &str) -> bool {
    hex_digits(s).is_some()
}

pub fn is_address(s: &str) -> bool {
    hex_digits(s).is_some_and(|digits| digits.len() == 40)
}

pub fn is_hash(s: &str) -> bool {
    hex_digits(s).is_some_and(|digits| digits.len() == 64)
}

/// Non-empty hex quantity that fits in 64 bits.
pub fn is_quantity(s: &str) -> bool {
    hex_digits(s).is_some_and(|digits| !digits.is_empty() && digits.len() <= 16)
}

pub fn is_block_number(s: &str) -> bool {
    BLOCK_TAGS.contains(&s) || is_quantity(s)
}

fn validate_block_number_or_hash(value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) if is_block_number(s) || is_hash(s) => Ok(()),
        Value::Object(object) => match (object.get("blockHash"), object.get("blockNumber")) {
            (Some(Value::String(hash)), None) if is_hash(hash) => Ok(()),
            (None, Some(Value::String(number))) if is_block_number(number) => Ok(()),
            _ => Err(format!(
                "Expected an object with exactly one of blockHash or blockNumber, value: {value}"
            )),
        },
        _ => Err(format!(
            "{BLOCK_NUMBER_EXPECTATION}, or a block hash, value: {value}"
        )),
    }
}

fn validate_transaction(object: &Map<String, Value>) -> Result<(), String> {
    for (field, value) in object {
        if value.is_null() {
            continue;
        }
        let valid = match field.as_str() {
            "from" | "to" => value.as_str().is_some_and(is_address),
            "data" | "input" => value.as_str().is_some_and(is_hex),
            "gas" | "gasPrice" | "value" | "nonce" | "maxFeePerGas"
            | "maxPriorityFeePerGas" | "type" => value.as_str().is_some_and(is_quantity),
            _ => true,
        };
        if !valid {
            return Err(format!("Invalid '{field}' in TransactionObject, value: {value}"));
        }
    }
    Ok(())
}

fn validate_filter(object: &Map<String, Value>) -> Result<(), String> {
    if object.contains_key("blockHash")
        && (object.contains_key("fromBlock") || object.contains_key("toBlock"))
    {
        return Err("Can't use both blockHash and toBlock/fromBlock".to_string());
    }
    if let Some(hash) = object.get("blockHash") {
        expect_str(hash, is_hash, HASH_EXPECTATION)?;
    }
    for field in ["fromBlock", "toBlock"] {
        if let Some(block) = object.get(field) {
            expect_str(block, is_block_number, BLOCK_NUMBER_EXPECTATION)?;
        }
    }
    if let Some(address) = object.get("address") {
        validate_addresses(address)?;
    }
    if let Some(topics) = object.get("topics") {
        validate_topics(topics)?;
    }
    Ok(())
}

/// A filter address: a single address or an array of them.
pub fn validate_addresses(value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) if is_address(s) => Ok(()),
        Value::Array(items)
            if items
                .iter()
                .all(|item| item.as_str().is_some_and(is_address)) =>
        {
            Ok(())
        }
        _ => Err(format!(
            "{ADDRESS_EXPECTATION} or an array of addresses, value: {value}"
        )),
    }
}

/// A topics filter: up to four positions, each `null`, a 32-byte topic, or an
/// array of 32-byte topics.
pub fn validate_topics(value: &Value) -> Result<(), String> {
    let Value::Array(slots) = value else {
        return Err(format!("Expected an array of topics, value: {value}"));
    };
    if slots.len() > MAX_TOPIC_SLOTS {
        return Err(format!(
            "Expected at most {MAX_TOPIC_SLOTS} topic positions, got {}",
            slots.len()
        ));
    }
    for slot in slots {
        let valid = match slot {
            Value::Null => true,
            Value::String(topic) => is_hash(topic),
            Value::Array(alternatives) => alternatives
                .iter()
                .all(|topic| topic.is_null() || topic.as_str().is_some_and(is_hash)),
            _ => false,
        };
        if !valid {
            return Err(format!(
                "Expected an array or array of arrays containing {}, value: {value}",
                HASH_EXPECTATION.trim_start_matches("Expected ")
            ));
        }
    }
    Ok(())
}

fn validate_reward_percentiles(value: &Value) -> Result<(), String> {
    let Value::Array(items) = value else {
        return Err(format!("Expected an array of reward percentiles, value: {value}"));
    };
    if items.len() > MAX_REWARD_PERCENTILES {
        return Err(format!(
            "Expected at most {MAX_REWARD_PERCENTILES} reward percentiles"
        ));
    }
    let mut previous = 0.0;
    for item in items {
        match item.as_f64() {
            Some(p) if (0.0..=100.0).contains(&p) && p >= previous => previous = p,
            _ => {
                return Err(format!(
                    "Expected monotonically increasing percentiles between 0 and 100, value: {value}"
                ))
            }
        }
    }
    Ok(())
}
