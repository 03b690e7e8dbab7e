//! Error taxonomy for the relay
//!
//! Every remote or validation failure that crosses a component boundary is a
//! [`BridgeError`]. Retry and circuit-breaker decisions are driven by
//! [`BridgeError::is_transient`]; everything else is reported to the caller.

use thiserror::Error;

/// Result alias used across the relay
pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    // ========================================================================
    // Startup Errors
    // ========================================================================

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    // ========================================================================
    // Remote Errors
    // ========================================================================

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC call timed out after {0} ms")]
    Timeout(u64),

    /// The remote node understood the request and refused it
    #[error("Rejected by node (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("Circuit open for {dependency}, try later")]
    CircuitOpen { dependency: String },

    // ========================================================================
    // Input Errors
    // ========================================================================

    #[error("Insufficient funds: need {needed}, available {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Amount {amount} is below dust threshold {threshold}")]
    DustThreshold { amount: u64, threshold: u64 },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    // ========================================================================
    // Flow Control
    // ========================================================================

    #[error("Already processed: {0}")]
    AlreadyProcessed(String),

    #[error("Rate limited: retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl BridgeError {
    /// Transient errors are retried with backoff and counted by the circuit breaker
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Rpc(_) | BridgeError::Timeout(_))
    }

    /// Idempotency short-circuit, callers that re-submit treat this as success
    pub fn is_already_processed(&self) -> bool {
        matches!(self, BridgeError::AlreadyProcessed(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Configuration(_) => "configuration",
            BridgeError::KeyGeneration(_) => "key_generation",
            BridgeError::Rpc(_) => "rpc",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::Rejected { .. } => "rejected",
            BridgeError::CircuitOpen { .. } => "circuit_open",
            BridgeError::InsufficientFunds { .. } => "insufficient_funds",
            BridgeError::DustThreshold { .. } => "dust_threshold",
            BridgeError::InvalidAddress(_) => "invalid_address",
            BridgeError::InvalidAmount(_) => "invalid_amount",
            BridgeError::InvalidTransaction(_) => "invalid_transaction",
            BridgeError::Signing(_) => "signing",
            BridgeError::AlreadyProcessed(_) => "already_processed",
            BridgeError::RateLimited { .. } => "rate_limited",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Unauthorized(_) => "unauthorized",
        }
    }
}

/// Classify an error message returned by a remote node.
///
/// Both the source-chain node and the EVM provider only give us strings, so
/// the mapping works on lowercase substrings.
pub fn classify_node_error(code: i64, message: &str) -> BridgeError {
    let lower = message.to_lowercase();

    if lower.contains("already in block chain")
        || lower.contains("already in the block chain")
        || lower.contains("txn-already-known")
        || lower.contains("txn-already-in-mempool")
        || lower.contains("already known")
        || lower.contains("already processed")
        || lower.contains("deposit processed")
    {
        return BridgeError::AlreadyProcessed(message.to_string());
    }

    if lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("network")
        || lower.contains("too many requests")
        || lower.contains("rate limit")
        || lower.contains("503")
        || lower.contains("502")
        || lower.contains("temporarily unavailable")
        || lower.contains("loading block index")
        || lower.contains("warming up")
    {
        return BridgeError::Rpc(message.to_string());
    }

    if lower.contains("bad-txns")
        || lower.contains("dust")
        || lower.contains("insufficient")
        || lower.contains("min relay fee")
        || lower.contains("script-verify")
        || lower.contains("missing inputs")
        || lower.contains("missingorspent")
        || lower.contains("reverted")
        || lower.contains("invalid")
    {
        return BridgeError::Rejected {
            code,
            message: message.to_string(),
        };
    }

    BridgeError::Rpc(message.to_string())
}
