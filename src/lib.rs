//! Dogecoin ↔ EVM bridge relay - Library interface
//!
//! Re-exports internal modules for the binary and integration tests.

pub mod address_manager;
pub mod api;
pub mod config;
pub mod deposit_monitor;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod resilience;
pub mod rpc_fallback;
pub mod service;
pub mod settlement;
pub mod source;
pub mod tx_builder;
pub mod types;
pub mod withdrawal;

pub use error::{BridgeError, BridgeResult};
