//! Settlement (EVM) chain access
//!
//! The token contract mints bridged value, burns it on withdrawal and emits
//! `WithdrawalRequested` events that the relay pays out on the source chain.

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::types::SettlementEvent;

pub mod contract;
pub mod evm;

pub use evm::{EvmSettlementClient, SettlementClientConfig};

/// Remote operations the relay needs from the settlement chain
#[async_trait]
pub trait SettlementChain: Send + Sync {
    /// Mint `amount_units` to `recipient` for a source-chain deposit.
    ///
    /// The contract rejects a `deposit_id` it has already seen, which is
    /// surfaced as `AlreadyProcessed`.
    async fn mint(&self, recipient: &str, amount_units: u64, deposit_id: [u8; 32])
        -> BridgeResult<String>;

    /// Burn `amount_units` from `holder` on behalf of an API withdrawal
    async fn burn(&self, holder: &str, amount_units: u64) -> BridgeResult<String>;

    /// `processedDeposits(depositId)`
    async fn is_deposit_processed(&self, deposit_id: [u8; 32]) -> BridgeResult<bool>;

    /// Record the source-chain payout for an on-chain withdrawal request
    async fn confirm_withdrawal(&self, request_id: u64, source_txid: &str) -> BridgeResult<String>;

    /// Latest block number
    async fn latest_block(&self) -> BridgeResult<u64>;

    /// Decoded token events in `[from_block, to_block]`
    async fn fetch_events(&self, from_block: u64, to_block: u64)
        -> BridgeResult<Vec<SettlementEvent>>;
}
