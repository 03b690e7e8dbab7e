//! Single consumer of the relay queue
//!
//! Deposits become mints, withdrawal requests go through the
//! [`WithdrawalProcessor`], and observed `Mint` events confirm earlier
//! submissions. Each message is handled to completion before the next one or
//! a shutdown signal is looked at.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::address_manager::AddressManager;
use crate::error::BridgeError;
use crate::metrics;
use crate::settlement::SettlementChain;
use crate::types::{
    DepositEvent, DepositId, RelayMessage, WithdrawalRequest, WithdrawalSource, WithdrawalStatus,
};
use crate::withdrawal::WithdrawalProcessor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MintStatus {
    /// Mint transaction mined successfully
    Submitted { tx_hash: String },
    /// Seen on-chain, either as our `Mint` event or via `processedDeposits`
    Confirmed { tx_hash: Option<String> },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MintRecord {
    pub deposit: DepositEvent,
    pub owner: Option<String>,
    pub status: MintStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Deposit id → mint outcome
#[derive(Default)]
pub struct MintTable {
    records: HashMap<DepositId, MintRecord>,
    by_contract_id: HashMap<[u8; 32], DepositId>,
}

impl MintTable {
    pub fn get(&self, id: &DepositId) -> Option<&MintRecord> {
        self.records.get(id)
    }

    /// True once a mint went through or the contract reports the id as processed
    pub fn is_settled(&self, id: &DepositId) -> bool {
        matches!(
            self.records.get(id).map(|r| &r.status),
            Some(MintStatus::Submitted { .. } | MintStatus::Confirmed { .. })
        )
    }

    pub fn failed(&self) -> Vec<MintRecord> {
        let mut failed: Vec<MintRecord> = self
            .records
            .values()
            .filter(|r| matches!(r.status, MintStatus::Failed { .. }))
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.deposit.id().cmp(&b.deposit.id()));
        failed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn settled_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| !matches!(r.status, MintStatus::Failed { .. }))
            .count()
    }

    fn record(&mut self, deposit: &DepositEvent, owner: Option<String>, status: MintStatus) {
        let id = deposit.id();
        self.by_contract_id.insert(id.to_bytes32(), id.clone());
        let attempts = self.records.get(&id).map_or(0, |r| r.attempts) + 1;
        self.records.insert(
            id,
            MintRecord {
                deposit: deposit.clone(),
                owner,
                status,
                attempts,
                updated_at: Utc::now(),
            },
        );
    }

    /// Returns false when the contract id belongs to no deposit we handled
    fn confirm(&mut self, contract_id: &[u8; 32], tx_hash: &str) -> bool {
        let Some(id) = self.by_contract_id.get(contract_id) else {
            return false;
        };
        match self.records.get_mut(id) {
            Some(record) => {
                record.status = MintStatus::Confirmed {
                    tx_hash: Some(tx_hash.to_string()),
                };
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}

pub type SharedMintTable = Arc<RwLock<MintTable>>;

pub struct BridgeOrchestrator {
    settlement: Arc<dyn SettlementChain>,
    addresses: Arc<AddressManager>,
    processor: WithdrawalProcessor,
    mints: SharedMintTable,
    /// Set while a `RetryFailedMints` message sits in the queue
    retry_queued: Arc<AtomicBool>,
}

impl BridgeOrchestrator {
    pub fn new(
        settlement: Arc<dyn SettlementChain>,
        addresses: Arc<AddressManager>,
        processor: WithdrawalProcessor,
    ) -> Self {
        Self {
            settlement,
            addresses,
            processor,
            mints: Arc::new(RwLock::new(MintTable::default())),
            retry_queued: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag producers use to queue at most one retry request at a time
    pub fn retry_flag(&self) -> Arc<AtomicBool> {
        self.retry_queued.clone()
    }

    /// Read handle on the mint table
    pub fn mints(&self) -> SharedMintTable {
        self.mints.clone()
    }

    pub async fn handle(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Deposit(event) => self.handle_deposit(event).await,
            RelayMessage::Withdrawal(request) => self.handle_withdrawal(request).await,
            RelayMessage::MintObserved { deposit_id, tx_hash } => {
                if self.mints.write().await.confirm(&deposit_id, &tx_hash) {
                    debug!(tx_hash = %tx_hash, "Mint confirmed on settlement chain");
                } else {
                    debug!(
                        deposit_id = %hex::encode(deposit_id),
                        tx_hash = %tx_hash,
                        "Mint event for a deposit not handled by this relay"
                    );
                }
            }
            RelayMessage::RetryFailedMints => {
                // Cleared first so failures during this pass can be queued again
                self.retry_queued.store(false, Ordering::SeqCst);
                let retried = self.retry_failed_mints().await;
                info!(retried, "Retried failed mints");
            }
        }
    }

    async fn handle_deposit(&mut self, event: DepositEvent) {
        let id = event.id();
        if self.mints.read().await.is_settled(&id) {
            debug!(deposit = %id, "Deposit already minted");
            return;
        }

        let Some(owner) = self.addresses.owner_of(&event.address).await else {
            warn!(deposit = %id, "Deposit to an address with no owner");
            self.mints.write().await.record(
                &event,
                None,
                MintStatus::Failed {
                    error: BridgeError::NotFound(format!("owner of {}", event.address)).to_string(),
                },
            );
            return;
        };

        let contract_id = id.to_bytes32();
        let status = match self.settlement.is_deposit_processed(contract_id).await {
            Ok(true) => {
                info!(deposit = %id, "Deposit already processed on settlement chain");
                metrics::MINTS.with_label_values(&["already_processed"]).inc();
                MintStatus::Confirmed { tx_hash: None }
            }
            Ok(false) => self.mint(&id, &owner, &event, contract_id).await,
            Err(e) => {
                error!(deposit = %id, error = %e, "Could not check deposit status, mint deferred");
                metrics::MINTS.with_label_values(&["failed"]).inc();
                MintStatus::Failed {
                    error: e.to_string(),
                }
            }
        };

        self.mints.write().await.record(&event, Some(owner), status);
    }

    async fn mint(
        &self,
        id: &DepositId,
        owner: &str,
        event: &DepositEvent,
        contract_id: [u8; 32],
    ) -> MintStatus {
        match self
            .settlement
            .mint(owner, event.amount_units, contract_id)
            .await
        {
            Ok(tx_hash) => {
                info!(deposit = %id, recipient = owner, amount = event.amount_units, tx_hash = %tx_hash, "Minted");
                metrics::MINTS.with_label_values(&["minted"]).inc();
                MintStatus::Submitted { tx_hash }
            }
            Err(e) if e.is_already_processed() => {
                info!(deposit = %id, "Mint rejected as duplicate, treating as done");
                metrics::MINTS.with_label_values(&["already_processed"]).inc();
                MintStatus::Confirmed { tx_hash: None }
            }
            Err(e) => {
                error!(deposit = %id, error = %e, "Mint failed");
                metrics::MINTS.with_label_values(&["failed"]).inc();
                MintStatus::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn handle_withdrawal(&mut self, request: WithdrawalRequest) {
        let record = match self.processor.process(request).await {
            Ok(record) => record,
            Err(e) if e.is_already_processed() => {
                debug!(error = %e, "Withdrawal already handled");
                return;
            }
            Err(e) => {
                error!(error = %e, "Withdrawal could not be recorded");
                return;
            }
        };

        if record.status != WithdrawalStatus::Completed {
            return;
        }
        let (WithdrawalSource::Event { request_id, .. }, Some(txid)) =
            (&record.request.source, record.source_txid.as_deref())
        else {
            return;
        };

        match self.settlement.confirm_withdrawal(*request_id, txid).await {
            Ok(tx_hash) => {
                info!(request_id, source_txid = %txid, tx_hash = %tx_hash, "Withdrawal confirmed on settlement chain");
            }
            Err(e) => {
                // The payout itself stands; the settlement record is behind
                error!(request_id, source_txid = %txid, error = %e, "confirmWithdrawal failed");
            }
        }
    }

    /// Re-run every failed mint. Safe to repeat: the contract rejects ids it
    /// has already processed.
    pub async fn retry_failed_mints(&mut self) -> usize {
        let failed = self.mints.read().await.failed();
        let count = failed.len();
        for record in failed {
            self.handle_deposit(record.deposit).await;
        }
        count
    }

    /// Handle messages until the queue closes or shutdown is signalled.
    /// A message already taken off the queue is always finished.
    pub async fn run(
        mut self,
        mut receiver: mpsc::Receiver<RelayMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(operator = %self.processor.operator_address(), "Orchestrator started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Orchestrator stopped");
    }
}
