//! Withdrawal processing
//!
//! [`WithdrawalProcessor`] drives a request through
//! `pending → processing → completed | failed` and records every transition in
//! the [`WithdrawalLedger`]. The API reads the ledger; only the processor
//! writes it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::metrics;
use crate::settlement::SettlementChain;
use crate::source::{SourceChainRpc, MAX_CONFIRMATIONS};
use crate::tx_builder::TransactionBuilder;
use crate::types::{PendingWithdrawal, Utxo, WithdrawalRequest, WithdrawalSource, WithdrawalStatus};

pub mod monitor;

pub use monitor::{WithdrawalMonitor, WithdrawalMonitorConfig};

pub type SharedLedger = Arc<RwLock<WithdrawalLedger>>;

/// In-memory withdrawal records with bounded retention.
///
/// Terminal records (`completed`, `failed`) are dropped once older than the
/// retention period, or oldest-first when the ledger is over capacity.
/// Records still `pending` or `processing` are never evicted.
pub struct WithdrawalLedger {
    records: HashMap<String, PendingWithdrawal>,
    retention: Duration,
    max_records: usize,
}

impl WithdrawalLedger {
    pub fn new(retention: std::time::Duration, max_records: usize) -> Self {
        Self {
            records: HashMap::new(),
            retention: Duration::from_std(retention).unwrap_or_else(|_| Duration::days(1)),
            max_records,
        }
    }

    pub fn shared(retention: std::time::Duration, max_records: usize) -> SharedLedger {
        Arc::new(RwLock::new(Self::new(retention, max_records)))
    }

    pub fn contains(&self, withdrawal_id: &str) -> bool {
        self.records.contains_key(withdrawal_id)
    }

    pub fn get(&self, withdrawal_id: &str) -> Option<&PendingWithdrawal> {
        self.records.get(withdrawal_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a new record; fails when the id is already tracked
    pub fn insert(&mut self, record: PendingWithdrawal) -> BridgeResult<()> {
        self.evict_at(Utc::now());
        if self.records.contains_key(&record.withdrawal_id) {
            return Err(BridgeError::AlreadyProcessed(record.withdrawal_id));
        }
        self.records.insert(record.withdrawal_id.clone(), record);
        Ok(())
    }

    /// Move a record forward. Terminal records and backwards moves are refused.
    pub fn transition(
        &mut self,
        withdrawal_id: &str,
        status: WithdrawalStatus,
        error: Option<String>,
        source_txid: Option<String>,
    ) -> BridgeResult<PendingWithdrawal> {
        let record = self
            .records
            .get_mut(withdrawal_id)
            .ok_or_else(|| BridgeError::NotFound(format!("withdrawal {}", withdrawal_id)))?;

        if record.status.is_terminal() || status == WithdrawalStatus::Pending {
            return Err(BridgeError::InvalidTransaction(format!(
                "withdrawal {} cannot move from {} to {}",
                withdrawal_id, record.status, status
            )));
        }

        record.status = status;
        record.error = error;
        if source_txid.is_some() {
            record.source_txid = source_txid;
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Attach the settlement burn tx to a record
    pub fn record_burn(&mut self, withdrawal_id: &str, burn_tx: &str) -> BridgeResult<()> {
        let record = self
            .records
            .get_mut(withdrawal_id)
            .ok_or_else(|| BridgeError::NotFound(format!("withdrawal {}", withdrawal_id)))?;
        record.burn_tx = Some(burn_tx.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Records still `processing`: a payout may or may not have reached the node
    pub fn in_flight(&self) -> Vec<PendingWithdrawal> {
        let mut records: Vec<PendingWithdrawal> = self
            .records
            .values()
            .filter(|r| r.status == WithdrawalStatus::Processing)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        records
    }

    /// Count of records per status
    pub fn status_counts(&self) -> HashMap<WithdrawalStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn evict_at(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        let retention = self.retention;
        self.records
            .retain(|_, r| !r.status.is_terminal() || now - r.updated_at < retention);

        while self.records.len() >= self.max_records {
            let oldest = self
                .records
                .values()
                .filter(|r| r.status.is_terminal())
                .min_by_key(|r| r.updated_at)
                .map(|r| r.withdrawal_id.clone());
            match oldest {
                Some(id) => {
                    self.records.remove(&id);
                }
                None => break,
            }
        }

        before - self.records.len()
    }
}

/// Where a payout stopped
enum PayoutFailure {
    /// Nothing irreversible happened, or the node refused the payout outright
    Failed(BridgeError),
    /// A burn or broadcast may have taken effect
    Unresolved(BridgeError),
}

impl From<BridgeError> for PayoutFailure {
    fn from(e: BridgeError) -> Self {
        PayoutFailure::Failed(e)
    }
}

pub struct WithdrawalProcessor {
    source: Arc<dyn SourceChainRpc>,
    settlement: Arc<dyn SettlementChain>,
    builder: TransactionBuilder,
    ledger: SharedLedger,
    /// Operator outputs spent by our own broadcasts that the node may still list
    reserved: HashSet<(String, u32)>,
}

impl WithdrawalProcessor {
    pub fn new(
        source: Arc<dyn SourceChainRpc>,
        settlement: Arc<dyn SettlementChain>,
        builder: TransactionBuilder,
        ledger: SharedLedger,
    ) -> Self {
        Self {
            source,
            settlement,
            builder,
            ledger,
            reserved: HashSet::new(),
        }
    }

    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }

    pub fn operator_address(&self) -> String {
        self.builder.operator_address()
    }

    /// Process one request.
    ///
    /// Returns `AlreadyProcessed` for a known id without touching the UTXO
    /// pool. Every other failure is recorded on the returned record. A record
    /// is left `processing` when a burn or broadcast may have gone through
    /// without the relay seeing the result.
    pub async fn process(&mut self, request: WithdrawalRequest) -> BridgeResult<PendingWithdrawal> {
        let withdrawal_id = request.withdrawal_id();

        {
            let mut ledger = self.ledger.write().await;
            if ledger.contains(&withdrawal_id) {
                debug!(withdrawal_id = %withdrawal_id, "Duplicate withdrawal request");
                metrics::WITHDRAWALS.with_label_values(&["duplicate"]).inc();
                return Err(BridgeError::AlreadyProcessed(withdrawal_id));
            }
            ledger.insert(PendingWithdrawal::new(request.clone()))?;
        }

        info!(
            withdrawal_id = %withdrawal_id,
            recipient = %request.recipient_address,
            amount = request.amount_units,
            "Withdrawal accepted"
        );

        if let Err(e) = self
            .builder
            .validate_payout(&request.recipient_address, request.amount_units)
        {
            return self.fail(&withdrawal_id, e).await;
        }

        self.transition(&withdrawal_id, WithdrawalStatus::Processing, None, None)
            .await?;

        match self.pay_out(&withdrawal_id, &request).await {
            Ok(txid) => {
                info!(withdrawal_id = %withdrawal_id, txid = %txid, "Withdrawal paid out");
                metrics::WITHDRAWALS.with_label_values(&["completed"]).inc();
                self.transition(&withdrawal_id, WithdrawalStatus::Completed, None, Some(txid))
                    .await
            }
            Err(PayoutFailure::Failed(e)) => self.fail(&withdrawal_id, e).await,
            Err(PayoutFailure::Unresolved(e)) => {
                error!(
                    withdrawal_id = %withdrawal_id,
                    error = %e,
                    "Withdrawal outcome unknown, left processing for reconciliation"
                );
                metrics::WITHDRAWALS.with_label_values(&["unresolved"]).inc();
                self.transition(
                    &withdrawal_id,
                    WithdrawalStatus::Processing,
                    Some(e.to_string()),
                    None,
                )
                .await
            }
        }
    }

    /// Select, sign, burn (API requests only), then broadcast.
    ///
    /// The burn happens only once a signed payout exists, so pool and
    /// validation failures never cost the holder tokens.
    async fn pay_out(
        &mut self,
        withdrawal_id: &str,
        request: &WithdrawalRequest,
    ) -> Result<String, PayoutFailure> {
        let operator = self.builder.operator_address();
        let listed = self
            .source
            .list_unspent(1, MAX_CONFIRMATIONS, std::slice::from_ref(&operator))
            .await?;

        // Outputs the node no longer lists are spent for good
        let listed_outpoints: HashSet<(String, u32)> =
            listed.iter().map(|u| (u.txid.clone(), u.vout)).collect();
        self.reserved.retain(|o| listed_outpoints.contains(o));

        let pool: Vec<_> = listed
            .into_iter()
            .filter(|u| !self.reserved.contains(&(u.txid.clone(), u.vout)))
            .collect();

        let built = self
            .builder
            .build(&request.recipient_address, request.amount_units, &pool)?;

        if request.source == WithdrawalSource::Api {
            let burn_tx = match self
                .settlement
                .burn(&request.requester, request.amount_units)
                .await
            {
                Ok(tx_hash) => tx_hash,
                // The burn may have been mined without a receipt reaching us
                Err(e) if e.is_transient() => return Err(PayoutFailure::Unresolved(e)),
                Err(e) => return Err(PayoutFailure::Failed(e)),
            };
            info!(holder = %request.requester, tx_hash = %burn_tx, "Burned tokens for withdrawal");
            if let Err(e) = self.ledger.write().await.record_burn(withdrawal_id, &burn_tx) {
                error!(withdrawal_id, tx_hash = %burn_tx, error = %e, "Could not record burn");
            }
        }

        let txid = match self.source.send_raw_transaction(&built.raw_hex).await {
            Ok(node_txid) => {
                if node_txid != built.txid {
                    warn!(local = %built.txid, node = %node_txid, "Node reported a different txid");
                }
                node_txid
            }
            Err(e) if e.is_already_processed() => {
                debug!(txid = %built.txid, "Payout already known to node");
                built.txid.clone()
            }
            Err(e) if e.is_transient() => {
                // The node may hold the transaction; keep its inputs out of later payouts
                self.reserve(&built.inputs);
                return Err(PayoutFailure::Unresolved(e));
            }
            Err(e) => return Err(PayoutFailure::Failed(e)),
        };

        self.reserve(&built.inputs);
        Ok(txid)
    }

    fn reserve(&mut self, inputs: &[Utxo]) {
        self.reserved
            .extend(inputs.iter().map(|u| (u.txid.clone(), u.vout)));
    }

    async fn transition(
        &self,
        withdrawal_id: &str,
        status: WithdrawalStatus,
        error: Option<String>,
        source_txid: Option<String>,
    ) -> BridgeResult<PendingWithdrawal> {
        self.ledger
            .write()
            .await
            .transition(withdrawal_id, status, error, source_txid)
    }

    async fn fail(&self, withdrawal_id: &str, cause: BridgeError) -> BridgeResult<PendingWithdrawal> {
        error!(withdrawal_id = %withdrawal_id, error = %cause, "Withdrawal failed");
        metrics::WITHDRAWALS.with_label_values(&["failed"]).inc();
        let record = self
            .transition(
                withdrawal_id,
                WithdrawalStatus::Failed,
                Some(cause.to_string()),
                None,
            )
            .await?;
        if let Some(burn_tx) = &record.burn_tx {
            error!(
                withdrawal_id = %withdrawal_id,
                burn_tx = %burn_tx,
                "Tokens burned without a payout, re-mint required"
            );
            metrics::WITHDRAWALS.with_label_values(&["burned_unpaid"]).inc();
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(id: u64) -> WithdrawalRequest {
        WithdrawalRequest {
            source: WithdrawalSource::Event {
                request_id: id,
                block_number: 1,
            },
            requester: "0x0000000000000000000000000000000000000009".to_string(),
            recipient_address: "DLCDJhnh6aGotar6b182jpzbNEyXb3C361".to_string(),
            amount_units: 1_000,
            requested_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn ledger(max: usize) -> WithdrawalLedger {
        WithdrawalLedger::new(std::time::Duration::from_secs(3600), max)
    }

    #[test]
    fn test_insert_rejects_duplicate() {
        let mut ledger = ledger(10);
        ledger.insert(PendingWithdrawal::new(request(1))).unwrap();
        assert_eq!(
            ledger.insert(PendingWithdrawal::new(request(1))),
            Err(BridgeError::AlreadyProcessed("evm-1".into()))
        );
    }

    #[test]
    fn test_status_never_returns_to_pending() {
        let mut ledger = ledger(10);
        ledger.insert(PendingWithdrawal::new(request(1))).unwrap();
        ledger
            .transition("evm-1", WithdrawalStatus::Processing, None, None)
            .unwrap();
        assert!(ledger
            .transition("evm-1", WithdrawalStatus::Pending, None, None)
            .is_err());

        let done = ledger
            .transition("evm-1", WithdrawalStatus::Completed, None, Some("ab".into()))
            .unwrap();
        assert_eq!(done.source_txid.as_deref(), Some("ab"));
        assert!(ledger
            .transition("evm-1", WithdrawalStatus::Failed, Some("late".into()), None)
            .is_err());
    }

    #[test]
    fn test_record_burn_survives_failure() {
        let mut ledger = ledger(10);
        ledger.insert(PendingWithdrawal::new(request(1))).unwrap();
        ledger.record_burn("evm-1", "0xburn").unwrap();
        let failed = ledger
            .transition("evm-1", WithdrawalStatus::Failed, Some("rejected".into()), None)
            .unwrap();
        assert_eq!(failed.burn_tx.as_deref(), Some("0xburn"));
        assert!(ledger.record_burn("evm-9", "0x00").is_err());
    }

    #[test]
    fn test_in_flight_lists_processing_only() {
        let mut ledger = ledger(10);
        for id in 1..=3 {
            ledger.insert(PendingWithdrawal::new(request(id))).unwrap();
        }
        ledger
            .transition("evm-2", WithdrawalStatus::Processing, None, None)
            .unwrap();
        let in_flight = ledger.in_flight();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].withdrawal_id, "evm-2");
    }

    #[test]
    fn test_evicts_expired_terminal_records_only() {
        let mut ledger = ledger(10);
        ledger.insert(PendingWithdrawal::new(request(1))).unwrap();
        ledger.insert(PendingWithdrawal::new(request(2))).unwrap();
        ledger
            .transition("evm-1", WithdrawalStatus::Failed, Some("x".into()), None)
            .unwrap();

        let removed = ledger.evict_at(Utc::now() + Duration::hours(2));
        assert_eq!(removed, 1);
        assert!(!ledger.contains("evm-1"));
        assert!(ledger.contains("evm-2"));
    }

    #[test]
    fn test_capacity_evicts_oldest_terminal() {
        let mut ledger = ledger(2);
        ledger.insert(PendingWithdrawal::new(request(1))).unwrap();
        ledger
            .transition("evm-1", WithdrawalStatus::Failed, Some("x".into()), None)
            .unwrap();
        ledger.insert(PendingWithdrawal::new(request(2))).unwrap();
        ledger.insert(PendingWithdrawal::new(request(3))).unwrap();

        assert!(!ledger.contains("evm-1"));
        assert!(ledger.contains("evm-2"));
        assert!(ledger.contains("evm-3"));

        // Nothing terminal left to evict, so the ledger grows past capacity
        ledger.insert(PendingWithdrawal::new(request(4))).unwrap();
        assert_eq!(ledger.len(), 3);
    }
}
