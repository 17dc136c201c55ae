//! WebSocket front end for an Ethereum JSON-RPC relay.
//!
//! Accepts JSON-RPC 2.0 over WebSocket, enforces connection, subscription and
//! rate limits, and forwards supported `eth_`/`net_`/`web3_` methods to a
//! relay behind the [`relay::Relay`] seam.

pub mod cache;
pub mod config;
pub mod context;
pub mod relay;
pub mod server;
pub mod subscriptions;
pub mod utils;
