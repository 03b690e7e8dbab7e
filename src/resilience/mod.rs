//! Resilience primitives for remote calls
//!
//! - `retry`: exponential backoff with jitter
//! - `circuit_breaker`: Closed/Open breaker per dependency
//!
//! [`ResilientCaller`] composes the two with a per-call timeout, and
//! [`Resilient`] applies a caller to every method of a chain client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::settlement::SettlementChain;
use crate::source::SourceChainRpc;
use crate::types::{SettlementEvent, Utxo};

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::RetryConfig;

/// Retry + circuit breaker + timeout around one remote dependency
pub struct ResilientCaller {
    name: String,
    retry: RetryConfig,
    call_timeout: Duration,
    breaker: Mutex<CircuitBreaker>,
}

impl ResilientCaller {
    pub fn new(
        name: impl Into<String>,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        let name = name.into();
        metrics::CIRCUIT_STATE.with_label_values(&[&name]).set(0);
        Self {
            name,
            retry,
            call_timeout,
            breaker: Mutex::new(CircuitBreaker::new(breaker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> CircuitState {
        self.breaker.lock().await.state()
    }

    /// Run `op` with retries on transient errors.
    ///
    /// The breaker is consulted before every attempt; an open circuit returns
    /// `CircuitOpen` immediately. Permanent errors are returned unchanged
    /// after the first attempt.
    pub async fn call<T, F, Fut>(&self, op_name: &str, mut op: F) -> BridgeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let mut attempts = 0u32;
        loop {
            self.check_circuit(op_name).await?;
            attempts += 1;

            match self.bounded(op()).await {
                Ok(value) => {
                    self.on_success().await;
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    self.on_failure(op_name, &e).await;
                    if !self.retry.should_retry(attempts) {
                        warn!(
                            dependency = %self.name,
                            op = op_name,
                            attempts,
                            error = %e,
                            "Giving up after retries"
                        );
                        return Err(e);
                    }
                    let delay = self.retry.delay_with_jitter(attempts - 1);
                    debug!(
                        dependency = %self.name,
                        op = op_name,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics::REMOTE_ERRORS
                        .with_label_values(&[&self.name, e.kind()])
                        .inc();
                    return Err(e);
                }
            }
        }
    }

    /// Single attempt with circuit check and timeout, for calls that must not
    /// be repeated.
    pub async fn call_once<T, Fut>(&self, op_name: &str, fut: Fut) -> BridgeResult<T>
    where
        Fut: Future<Output = BridgeResult<T>>,
    {
        self.check_circuit(op_name).await?;
        match self.bounded(fut).await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(e) => {
                if e.is_transient() {
                    self.on_failure(op_name, &e).await;
                } else {
                    metrics::REMOTE_ERRORS
                        .with_label_values(&[&self.name, e.kind()])
                        .inc();
                }
                Err(e)
            }
        }
    }

    async fn bounded<T, Fut>(&self, fut: Fut) -> BridgeResult<T>
    where
        Fut: Future<Output = BridgeResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(self.call_timeout.as_millis() as u64)),
        }
    }

    async fn check_circuit(&self, op_name: &str) -> BridgeResult<()> {
        let mut breaker = self.breaker.lock().await;
        if breaker.allow() {
            metrics::CIRCUIT_STATE.with_label_values(&[&self.name]).set(0);
            return Ok(());
        }
        debug!(dependency = %self.name, op = op_name, "Circuit open, failing fast");
        Err(BridgeError::CircuitOpen {
            dependency: self.name.clone(),
        })
    }

    async fn on_success(&self) {
        self.breaker.lock().await.record_success();
    }

    async fn on_failure(&self, op_name: &str, error: &BridgeError) {
        metrics::REMOTE_ERRORS
            .with_label_values(&[&self.name, error.kind()])
            .inc();

        let mut breaker = self.breaker.lock().await;
        let was_open = breaker.state() == CircuitState::Open;
        breaker.record_failure();
        if !was_open && breaker.state() == CircuitState::Open {
            metrics::CIRCUIT_STATE.with_label_values(&[&self.name]).set(1);
            warn!(
                dependency = %self.name,
                op = op_name,
                failures = breaker.failure_count(),
                "Circuit breaker tripped"
            );
        }
    }
}

/// Chain client decorated with a [`ResilientCaller`]
pub struct Resilient<T> {
    inner: T,
    caller: Arc<ResilientCaller>,
}

impl<T> Resilient<T> {
    pub fn new(inner: T, caller: Arc<ResilientCaller>) -> Self {
        Self { inner, caller }
    }

    pub fn caller(&self) -> &Arc<ResilientCaller> {
        &self.caller
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: SourceChainRpc> SourceChainRpc for Resilient<T> {
    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> BridgeResult<Vec<Utxo>> {
        let inner = &self.inner;
        self.caller
            .call("listunspent", move || inner.list_unspent(min_conf, max_conf, addresses))
            .await
    }

    async fn send_raw_transaction(&self, raw_hex: &str) -> BridgeResult<String> {
        let inner = &self.inner;
        self.caller
            .call("sendrawtransaction", move || inner.send_raw_transaction(raw_hex))
            .await
    }

    async fn import_address(&self, address: &str, label: &str) -> BridgeResult<()> {
        let inner = &self.inner;
        self.caller
            .call("importaddress", move || inner.import_address(address, label))
            .await
    }
}

#[async_trait]
impl<T: SettlementChain> SettlementChain for Resilient<T> {
    async fn mint(
        &self,
        recipient: &str,
        amount_units: u64,
        deposit_id: [u8; 32],
    ) -> BridgeResult<String> {
        let inner = &self.inner;
        self.caller
            .call("mint", move || inner.mint(recipient, amount_units, deposit_id))
            .await
    }

    async fn burn(&self, holder: &str, amount_units: u64) -> BridgeResult<String> {
        // A retried burn could debit the holder twice
        self.caller
            .call_once("burn", self.inner.burn(holder, amount_units))
            .await
    }

    async fn is_deposit_processed(&self, deposit_id: [u8; 32]) -> BridgeResult<bool> {
        let inner = &self.inner;
        self.caller
            .call("processedDeposits", move || inner.is_deposit_processed(deposit_id))
            .await
    }

    async fn confirm_withdrawal(&self, request_id: u64, source_txid: &str) -> BridgeResult<String> {
        let inner = &self.inner;
        self.caller
            .call("confirmWithdrawal", move || {
                inner.confirm_withdrawal(request_id, source_txid)
            })
            .await
    }

    async fn latest_block(&self) -> BridgeResult<u64> {
        let inner = &self.inner;
        self.caller
            .call("latest_block", move || inner.latest_block())
            .await
    }

    async fn fetch_events(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<SettlementEvent>> {
        let inner = &self.inner;
        self.caller
            .call("get_logs", move || inner.fetch_events(from_block, to_block))
            .await
    }
}
