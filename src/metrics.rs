//! Prometheus metrics for the relay
//!
//! Exposed on the `/metrics` endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_gauge_vec, CounterVec, GaugeVec,
    IntGaugeVec,
};

lazy_static! {
    // Deposit direction
    pub static ref DEPOSITS_DETECTED: CounterVec = register_counter_vec!(
        "relay_deposits_detected_total",
        "Confirmed source-chain deposits forwarded to the orchestrator",
        &["network"]
    ).unwrap();

    pub static ref MINTS: CounterVec = register_counter_vec!(
        "relay_mints_total",
        "Mint attempts on the settlement chain",
        &["outcome"]
    ).unwrap();

    // Withdrawal direction
    pub static ref WITHDRAWALS: CounterVec = register_counter_vec!(
        "relay_withdrawals_total",
        "Withdrawal requests reaching a terminal or rejected state",
        &["outcome"]
    ).unwrap();

    // Resilience
    pub static ref CIRCUIT_STATE: IntGaugeVec = register_int_gauge_vec!(
        "relay_circuit_open",
        "1 when the circuit breaker for a dependency is open",
        &["dependency"]
    ).unwrap();

    pub static ref REMOTE_ERRORS: CounterVec = register_counter_vec!(
        "relay_remote_errors_total",
        "Remote call failures by dependency and error kind",
        &["dependency", "kind"]
    ).unwrap();

    pub static ref RATE_LIMITED: CounterVec = register_counter_vec!(
        "relay_rate_limited_total",
        "Requests rejected by the rate limiter",
        &["endpoint"]
    ).unwrap();

    // Liveness
    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "relay_last_successful_poll_timestamp",
        "Unix timestamp of the last completed poll pass",
        &["chain"]
    ).unwrap();

    pub static ref SETTLEMENT_CURSOR: IntGaugeVec = register_int_gauge_vec!(
        "relay_settlement_cursor_block",
        "Next settlement block the withdrawal monitor will scan",
        &["chain"]
    ).unwrap();
}

/// Record the completion time of a poll pass
pub fn mark_poll(chain: &str) {
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[chain])
        .set(chrono::Utc::now().timestamp() as f64);
}
