//! Registry of supported JSON-RPC methods.
//!
//! Built once on first use; the dispatcher resolves a method name to its
//! [`MethodSpec`] and never inspects the relay dynamically.

use std::{collections::HashMap, sync::LazyLock};

use serde_json::Value;

use crate::config::RelayConfig;

pub const ETH_SUBSCRIBE: &str = "eth_subscribe";
pub const ETH_UNSUBSCRIBE: &str = "eth_unsubscribe";

/// Relay namespace that executes a forwarded method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Eth,
    Net,
    Web3,
}

/// Rate-limit tier; tier 1 is the most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateTier {
    Tier1,
    Tier2,
    Tier3,
}

impl RateTier {
    pub fn limit(self, config: &RelayConfig) -> u32 {
        match self {
            RateTier::Tier1 => config.tier_1_rate_limit,
            RateTier::Tier2 => config.tier_2_rate_limit,
            RateTier::Tier3 => config.tier_3_rate_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// 0x-prefixed 20-byte hex.
    Address,
    /// Block tag or hex quantity.
    BlockNumber,
    /// Block number, block hash, or an EIP-1898 object.
    BlockNumberOrHash,
    /// 0x-prefixed 32-byte hex.
    BlockHash,
    TransactionHash,
    /// 32-byte storage slot.
    StorageSlot,
    /// Any 0x-prefixed hex string.
    Hex,
    /// Hex quantity or non-negative integer.
    Quantity,
    Boolean,
    TransactionObject,
    Filter,
    /// Array of reward percentiles between 0 and 100.
    RewardPercentiles,
    SubscriptionKind,
    SubscriptionId,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRule {
    pub kind: ParamType,
    pub required: bool,
}

const fn req(kind: ParamType) -> ParamRule {
    ParamRule {
        kind,
        required: true,
    }
}

const fn opt(kind: ParamType) -> ParamRule {
    ParamRule {
        kind,
        required: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSpec {
    pub name: &'static str,
    pub namespace: Namespace,
    pub tier: RateTier,
    pub params: &'static [ParamRule],
}

impl MethodSpec {
    pub fn is_subscription(&self) -> bool {
        self.name == ETH_SUBSCRIBE || self.name == ETH_UNSUBSCRIBE
    }

    /// Pads absent optional trailing parameters with `null` so every upstream
    /// call sees the method's full arity.
    pub fn normalize_params(&self, mut params: Vec<Value>) -> Vec<Value> {
        if params.len() < self.params.len() {
            params.resize(self.params.len(), Value::Null);
        }
        params
    }
}

const fn method(
    name: &'static str,
    namespace: Namespace,
    tier: RateTier,
    params: &'static [ParamRule],
) -> MethodSpec {
    MethodSpec {
        name,
        namespace,
        tier,
        params,
    }
}

use Namespace::{Eth, Net, Web3};
use ParamType::*;
use RateTier::{Tier1, Tier2, Tier3};

pub static METHODS: &[MethodSpec] = &[
    method("eth_accounts", Eth, Tier3, &[]),
    method("eth_blockNumber", Eth, Tier2, &[]),
    method("eth_call", Eth, Tier1, &[req(TransactionObject), opt(BlockNumberOrHash)]),
    method("eth_chainId", Eth, Tier2, &[]),
    method("eth_coinbase", Eth, Tier3, &[]),
    method("eth_estimateGas", Eth, Tier2, &[req(TransactionObject), opt(BlockNumber)]),
    method(
        "eth_feeHistory",
        Eth,
        Tier2,
        &[req(Quantity), req(BlockNumber), opt(RewardPercentiles)],
    ),
    method("eth_gasPrice", Eth, Tier2, &[]),
    method("eth_getBalance", Eth, Tier2, &[req(Address), req(BlockNumberOrHash)]),
    method("eth_getBlockByHash", Eth, Tier2, &[req(BlockHash), req(Boolean)]),
    method("eth_getBlockByNumber", Eth, Tier2, &[req(BlockNumber), req(Boolean)]),
    method("eth_getBlockReceipts", Eth, Tier2, &[req(BlockNumberOrHash)]),
    method("eth_getBlockTransactionCountByHash", Eth, Tier2, &[req(BlockHash)]),
    method("eth_getBlockTransactionCountByNumber", Eth, Tier2, &[req(BlockNumber)]),
    method("eth_getCode", Eth, Tier2, &[req(Address), opt(BlockNumberOrHash)]),
    method("eth_getLogs", Eth, Tier2, &[req(Filter)]),
    method(
        "eth_getStorageAt",
        Eth,
        Tier2,
        &[req(Address), req(StorageSlot), opt(BlockNumberOrHash)],
    ),
    method(
        "eth_getTransactionByBlockHashAndIndex",
        Eth,
        Tier2,
        &[req(BlockHash), req(Quantity)],
    ),
    method(
        "eth_getTransactionByBlockNumberAndIndex",
        Eth,
        Tier2,
        &[req(BlockNumber), req(Quantity)],
    ),
    method("eth_getTransactionByHash", Eth, Tier2, &[req(TransactionHash)]),
    method(
        "eth_getTransactionCount",
        Eth,
        Tier2,
        &[req(Address), req(BlockNumberOrHash)],
    ),
    method("eth_getTransactionReceipt", Eth, Tier2, &[req(TransactionHash)]),
    method("eth_getUncleByBlockHashAndIndex", Eth, Tier3, &[req(BlockHash), req(Quantity)]),
    method(
        "eth_getUncleByBlockNumberAndIndex",
        Eth,
        Tier3,
        &[req(BlockNumber), req(Quantity)],
    ),
    method("eth_getUncleCountByBlockHash", Eth, Tier3, &[req(BlockHash)]),
    method("eth_getUncleCountByBlockNumber", Eth, Tier3, &[req(BlockNumber)]),
    method("eth_hashrate", Eth, Tier3, &[]),
    method("eth_maxPriorityFeePerGas", Eth, Tier2, &[]),
    method("eth_mining", Eth, Tier3, &[]),
    method("eth_sendRawTransaction", Eth, Tier1, &[req(Hex)]),
    method(ETH_SUBSCRIBE, Eth, Tier1, &[req(SubscriptionKind), opt(Any)]),
    method("eth_syncing", Eth, Tier3, &[]),
    method(ETH_UNSUBSCRIBE, Eth, Tier1, &[req(SubscriptionId)]),
    method("net_listening", Net, Tier3, &[]),
    method("net_peerCount", Net, Tier3, &[]),
    method("net_version", Net, Tier3, &[]),
    method("web3_clientVersion", Web3, Tier3, &[]),
    method("web3_sha3", Web3, Tier3, &[req(Hex)]),
];

static REGISTRY: LazyLock<HashMap<&'static str, &'static MethodSpec>> =
    LazyLock::new(|| METHODS.iter().map(|spec| (spec.name, spec)).collect());

/// Resolves a supported method.
pub fn lookup(method: &str) -> Option<&'static MethodSpec> {
    REGISTRY.get(method).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_are_unique() {
        assert_eq!(REGISTRY.len(), METHODS.len());
    }

    #[test]
    fn namespaces_follow_prefixes() {
        for spec in METHODS {
            let expected = match spec.name.split('_').next() {
                Some("eth") => Namespace::Eth,
                Some("net") => Namespace::Net,
                Some("web3") => Namespace::Web3,
                other => panic!("unexpected prefix {other:?}"),
            };
            assert_eq!(spec.namespace, expected, "{}", spec.name);
        }
    }

    #[test]
    fn unknown_methods_are_not_supported() {
        assert!(lookup("eth_chainId").is_some());
        assert!(lookup("eth_sign").is_none());
        assert!(lookup("debug_traceTransaction").is_none());
    }

    #[test]
    fn optional_params_are_padded() {
        let spec = lookup("eth_call").unwrap();
        assert_eq!(
            spec.normalize_params(vec![json!({ "to": "0x0" })]),
            vec![json!({ "to": "0x0" }), Value::Null]
        );
    }

    #[test]
    fn tiers_map_to_config_ceilings() {
        let config = RelayConfig {
            tier_1_rate_limit: 1,
            tier_2_rate_limit: 2,
            tier_3_rate_limit: 3,
            ..RelayConfig::default()
        };
        assert_eq!(lookup("eth_sendRawTransaction").unwrap().tier.limit(&config), 1);
        assert_eq!(lookup("eth_getLogs").unwrap().tier.limit(&config), 2);
        assert_eq!(lookup("net_version").unwrap().tier.limit(&config), 3);
    }
}
