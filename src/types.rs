//! Common types for cross-chain operations

use alloy::primitives::keccak256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Source Chain Types
// ============================================================================

/// Unspent transaction output as reported by the source-chain node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    /// Value in base units (1 DOGE = 100_000_000)
    pub value_units: u64,
    pub confirmations: u32,
    /// Hex-encoded locking script
    pub script_pubkey: String,
    /// Address the output pays to, when the node reports it
    #[serde(default)]
    pub address: Option<String>,
}

/// Identity of a deposit: one source transaction paying one watched address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepositId {
    pub txid: String,
    pub address: String,
}

impl DepositId {
    pub fn new(txid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            address: address.into(),
        }
    }

    /// 32-byte id used by the settlement contract's `processedDeposits` map
    pub fn to_bytes32(&self) -> [u8; 32] {
        keccak256(format!("{}:{}", self.txid, self.address).as_bytes()).0
    }
}

impl fmt::Display for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.address)
    }
}

/// Confirmed deposit detected at a watched address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub txid: String,
    pub address: String,
    pub amount_units: u64,
    pub confirmations: u32,
}

impl DepositEvent {
    pub fn id(&self) -> DepositId {
        DepositId::new(&self.txid, &self.address)
    }
}

// ============================================================================
// Withdrawal Types
// ============================================================================

/// Processing status of a withdrawal request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawalStatus::Completed | WithdrawalStatus::Failed)
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a withdrawal request came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WithdrawalSource {
    /// `WithdrawalRequested` event; tokens were already burned on-chain
    Event { request_id: u64, block_number: u64 },
    /// Submitted through the API; the relay burns the holder's tokens itself
    Api,
}

/// A request to pay out source-chain funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub source: WithdrawalSource,
    /// Settlement-chain account that requested (or holds) the tokens
    pub requester: String,
    /// Source-chain address receiving the payout
    pub recipient_address: String,
    pub amount_units: u64,
    pub requested_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    /// Stable id used for duplicate detection.
    ///
    /// Event requests use the contract's request id; API requests hash
    /// requester, amount and timestamp.
    pub fn withdrawal_id(&self) -> String {
        match &self.source {
            WithdrawalSource::Event { request_id, .. } => format!("evm-{}", request_id),
            WithdrawalSource::Api => {
                let preimage = format!(
                    "{}|{}|{}",
                    self.requester.to_lowercase(),
                    self.amount_units,
                    self.requested_at.timestamp_millis()
                );
                format!("api-{}", hex::encode(&keccak256(preimage.as_bytes())[..16]))
            }
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match &self.source {
            WithdrawalSource::Event { request_id, .. } => Some(*request_id),
            WithdrawalSource::Api => None,
        }
    }
}

/// Tracked state of a withdrawal request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub withdrawal_id: String,
    pub request: WithdrawalRequest,
    pub status: WithdrawalStatus,
    pub error: Option<String>,
    /// Txid of the broadcast payout, set on completion
    pub source_txid: Option<String>,
    /// Settlement tx that burned the holder's tokens, for API requests
    #[serde(default)]
    pub burn_tx: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PendingWithdrawal {
    pub fn new(request: WithdrawalRequest) -> Self {
        Self {
            withdrawal_id: request.withdrawal_id(),
            request,
            status: WithdrawalStatus::Pending,
            error: None,
            source_txid: None,
            burn_tx: None,
            updated_at: Utc::now(),
        }
    }
}

// ============================================================================
// Settlement Chain Types
// ============================================================================

/// Events observed on the settlement token contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementEvent {
    Mint {
        recipient: String,
        amount_units: u64,
        deposit_id: [u8; 32],
        tx_hash: String,
    },
    WithdrawalRequested(WithdrawalRequest),
}

/// Message consumed by the orchestrator
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Deposit(DepositEvent),
    Withdrawal(WithdrawalRequest),
    MintObserved { deposit_id: [u8; 32], tx_hash: String },
    /// Re-attempt mints that previously failed
    RetryFailedMints,
}
