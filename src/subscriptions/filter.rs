use serde_json::{Map, Value};

use crate::{
    server::middleware::validation::{validate_addresses, validate_topics},
    utils::error::JsonRpcError,
};

/// The narrowed filter of a `logs` subscription.
///
/// Only `address` and `topics` survive narrowing; addresses are stored
/// lowercased so matching is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    addresses: Vec<String>,
    /// One entry per topic position; `None` matches anything at that position.
    topics: Vec<Option<Vec<String>>>,
}

impl LogFilter {
    /// Narrows a raw subscription filter and validates what remains.
    ///
    /// Unknown keys are dropped. A missing filter subscribes to every log.
    ///
    /// # Errors
    ///
    /// Returns an invalid-parameter error when the filter is not an object or
    /// `address` / `topics` are malformed.
    pub fn from_param(raw: Option<&Value>) -> Result<Self, JsonRpcError> {
        let object = match raw {
            None | Some(Value::Null) => return Ok(Self::default()),
            Some(Value::Object(object)) => object,
            Some(other) => {
                return Err(JsonRpcError::invalid_parameter(
                    1,
                    &format!("Expected FilterObject, value: {other}"),
                ))
            }
        };

        Ok(Self {
            addresses: Self::parse_addresses(object)?,
            topics: Self::parse_topics(object)?,
        })
    }

    fn parse_addresses(object: &Map<String, Value>) -> Result<Vec<String>, JsonRpcError> {
        let Some(value) = object.get("address").filter(|v| !v.is_null()) else {
            return Ok(Vec::new());
        };
        validate_addresses(value)
            .map_err(|reason| JsonRpcError::invalid_parameter("filters.address", &reason))?;

        let addresses = match value {
            Value::String(address) => vec![address.to_lowercase()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_lowercase)
                .collect(),
            _ => Vec::new(),
        };
        Ok(addresses)
    }

    fn parse_topics(
        object: &Map<String, Value>,
    ) -> Result<Vec<Option<Vec<String>>>, JsonRpcError> {
        let Some(value) = object.get("topics").filter(|v| !v.is_null()) else {
            return Ok(Vec::new());
        };
        validate_topics(value)
            .map_err(|reason| JsonRpcError::invalid_parameter("filters.topics", &reason))?;

        let topics = value
            .as_array()
            .map(|slots| slots.iter().map(Self::parse_slot).collect())
            .unwrap_or_default();
        Ok(topics)
    }

    fn parse_slot(slot: &Value) -> Option<Vec<String>> {
        match slot {
            Value::String(topic) => Some(vec![topic.to_lowercase()]),
            Value::Array(alternatives) => {
                if alternatives.iter().any(Value::is_null) {
                    return None;
                }
                Some(
                    alternatives
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_lowercase)
                        .collect(),
                )
            }
            _ => None,
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Whether a log object matches this filter.
    pub fn matches(&self, log: &Value) -> bool {
        if !self.addresses.is_empty() {
            let address = log
                .get("address")
                .and_then(Value::as_str)
                .map(str::to_lowercase);
            match address {
                Some(address) if self.addresses.contains(&address) => {}
                _ => return false,
            }
        }

        let log_topics: Vec<String> = log
            .get("topics")
            .and_then(Value::as_array)
            .map(|topics| {
                topics
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();

        self.topics
            .iter()
            .enumerate()
            .all(|(position, slot)| match slot {
                None => true,
                Some(alternatives) => log_topics
                    .get(position)
                    .is_some_and(|topic| alternatives.contains(topic)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ADDRESS: &str = "0x00000000000000000000000000000000000003E8";
    const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
    const OTHER: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn log(address: &str, topics: &[&str]) -> Value {
        json!({ "address": address, "topics": topics, "data": "0x" })
    }

    #[test]
    fn narrowing_drops_unknown_keys() {
        let filter = LogFilter::from_param(Some(&json!({
            "address": ADDRESS,
            "fromBlock": "0x1",
            "extra": true
        })))
        .unwrap();
        assert_eq!(filter.addresses(), [ADDRESS.to_lowercase()]);
    }

    #[test]
    fn missing_filter_matches_everything() {
        let filter = LogFilter::from_param(None).unwrap();
        assert!(filter.matches(&log(ADDRESS, &[TRANSFER])));
    }

    #[test]
    fn non_object_filter_is_rejected() {
        let err = LogFilter::from_param(Some(&json!("logs"))).unwrap_err();
        assert!(err.message.starts_with("Invalid parameter 1"));
    }

    #[test]
    fn bad_address_names_the_field() {
        let err = LogFilter::from_param(Some(&json!({ "address": "0x12" }))).unwrap_err();
        assert!(err.message.starts_with("Invalid parameter filters.address"));
    }

    #[test]
    fn bad_topics_are_rejected() {
        let err = LogFilter::from_param(Some(&json!({ "topics": ["0x12"] }))).unwrap_err();
        assert!(err.message.starts_with("Invalid parameter filters.topics"));
    }

    #[test]
    fn address_match_is_case_insensitive() {
        let filter = LogFilter::from_param(Some(&json!({ "address": ADDRESS }))).unwrap();
        assert!(filter.matches(&log(&ADDRESS.to_lowercase(), &[])));
        assert!(!filter.matches(&log("0x0000000000000000000000000000000000000001", &[])));
    }

    #[test]
    fn topics_match_positionally_with_wildcards() {
        let filter = LogFilter::from_param(Some(&json!({
            "topics": [null, [OTHER, TRANSFER]]
        })))
        .unwrap();
        assert!(filter.matches(&log(ADDRESS, &[OTHER, TRANSFER])));
        assert!(!filter.matches(&log(ADDRESS, &[OTHER])));
        assert!(!filter.matches(&log(ADDRESS, &[OTHER, OTHER.replace('1', "2").as_str()])));
    }
}
