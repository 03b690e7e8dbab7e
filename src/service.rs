//! Relay lifecycle
//!
//! [`BridgeService`] owns the monitors and the orchestrator until `start()`
//! spawns them. [`ServiceHandle`] is the cheap, cloneable view the API uses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::address_manager::AddressManager;
use crate::deposit_monitor::{DepositMonitor, DepositMonitorConfig, WatchList};
use crate::error::{BridgeError, BridgeResult};
use crate::orchestrator::{BridgeOrchestrator, SharedMintTable};
use crate::resilience::{CircuitState, ResilientCaller};
use crate::settlement::SettlementChain;
use crate::source::SourceChainRpc;
use crate::tx_builder::TransactionBuilder;
use crate::types::{PendingWithdrawal, RelayMessage, WithdrawalRequest};
use crate::withdrawal::{SharedLedger, WithdrawalMonitor, WithdrawalMonitorConfig, WithdrawalProcessor};

#[derive(Debug, Clone)]
pub struct BridgeServiceConfig {
    pub deposits: DepositMonitorConfig,
    pub withdrawals: WithdrawalMonitorConfig,
    pub queue_capacity: usize,
}

impl Default for BridgeServiceConfig {
    fn default() -> Self {
        Self {
            deposits: DepositMonitorConfig::default(),
            withdrawals: WithdrawalMonitorConfig::default(),
            queue_capacity: 1_024,
        }
    }
}

/// Tasks built by `new()` and moved onto the runtime by `start()`
struct Workers {
    deposit_monitor: DepositMonitor,
    withdrawal_monitor: WithdrawalMonitor,
    orchestrator: BridgeOrchestrator,
    receiver: mpsc::Receiver<RelayMessage>,
}

pub struct BridgeService {
    handle: ServiceHandle,
    workers: Option<Workers>,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl BridgeService {
    pub fn new(
        config: BridgeServiceConfig,
        source: Arc<dyn SourceChainRpc>,
        settlement: Arc<dyn SettlementChain>,
        addresses: Arc<AddressManager>,
        builder: TransactionBuilder,
        ledger: SharedLedger,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let watch_list = WatchList::new();

        let deposit_monitor = DepositMonitor::new(
            config.deposits,
            source.clone(),
            addresses.clone(),
            watch_list.clone(),
            sender.clone(),
        );
        let withdrawal_monitor =
            WithdrawalMonitor::new(config.withdrawals, settlement.clone(), sender.clone());
        let processor =
            WithdrawalProcessor::new(source.clone(), settlement.clone(), builder, ledger.clone());
        let orchestrator = BridgeOrchestrator::new(settlement, addresses.clone(), processor);

        let handle = ServiceHandle {
            addresses,
            watch_list,
            ledger,
            mints: orchestrator.mints(),
            source,
            sender,
            retry_queued: orchestrator.retry_flag(),
            callers: Vec::new(),
        };

        Self {
            handle,
            workers: Some(Workers {
                deposit_monitor,
                withdrawal_monitor,
                orchestrator,
                receiver,
            }),
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    /// Report these callers' breaker states on the status endpoint
    pub fn with_callers(mut self, callers: Vec<Arc<ResilientCaller>>) -> Self {
        self.handle.callers = callers;
        self
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Watch every known deposit address and spawn the loops
    pub async fn start(&mut self) -> BridgeResult<()> {
        let workers = self
            .workers
            .take()
            .ok_or_else(|| BridgeError::Configuration("bridge service already started".to_string()))?;

        for address in self.handle.addresses.all_addresses().await {
            self.handle.watch_list.watch(&address).await;
        }

        let Workers {
            deposit_monitor,
            withdrawal_monitor,
            orchestrator,
            receiver,
        } = workers;

        self.tasks
            .spawn(deposit_monitor.run(self.shutdown.subscribe()));
        self.tasks
            .spawn(withdrawal_monitor.run(self.shutdown.subscribe()));
        self.tasks
            .spawn(orchestrator.run(receiver, self.shutdown.subscribe()));

        info!(
            watched = self.handle.watch_list.len().await,
            "Bridge service started"
        );
        Ok(())
    }

    /// Signal shutdown, stop watching and wait for every loop to exit.
    /// The orchestrator finishes the message it is handling first.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        self.handle.watch_list.clear().await;

        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Relay task ended abnormally");
            }
        }
        info!("Bridge service stopped");
    }

    pub async fn in_flight_withdrawals(&self) -> Vec<PendingWithdrawal> {
        self.handle.in_flight_withdrawals().await
    }

    pub async fn retry_failed_mints(&self) -> BridgeResult<bool> {
        self.handle.retry_failed_mints().await
    }
}

/// Shared view of the running relay
#[derive(Clone)]
pub struct ServiceHandle {
    pub addresses: Arc<AddressManager>,
    pub watch_list: WatchList,
    pub ledger: SharedLedger,
    pub mints: SharedMintTable,
    source: Arc<dyn SourceChainRpc>,
    sender: mpsc::Sender<RelayMessage>,
    retry_queued: Arc<AtomicBool>,
    callers: Vec<Arc<ResilientCaller>>,
}

impl ServiceHandle {
    /// Issue a deposit address for `owner_id`, import it into the node's
    /// wallet and start watching it
    pub async fn create_deposit_address(&self, owner_id: &str) -> BridgeResult<String> {
        let address = self.addresses.generate_deposit_address(owner_id).await?;
        self.source.import_address(&address, owner_id).await?;
        self.watch_list.watch(&address).await;
        Ok(address)
    }

    /// Queue an API withdrawal. Returns its id; progress is visible in the ledger.
    pub async fn submit_withdrawal(&self, request: WithdrawalRequest) -> BridgeResult<String> {
        let withdrawal_id = request.withdrawal_id();
        if self.ledger.read().await.contains(&withdrawal_id) {
            return Err(BridgeError::AlreadyProcessed(withdrawal_id));
        }
        self.enqueue(RelayMessage::Withdrawal(request)).await?;
        Ok(withdrawal_id)
    }

    pub async fn get_withdrawal(&self, withdrawal_id: &str) -> Option<PendingWithdrawal> {
        self.ledger.read().await.get(withdrawal_id).cloned()
    }

    pub async fn in_flight_withdrawals(&self) -> Vec<PendingWithdrawal> {
        self.ledger.read().await.in_flight()
    }

    /// Queue a retry of failed mints. Returns false when one is already queued.
    pub async fn retry_failed_mints(&self) -> BridgeResult<bool> {
        if self
            .retry_queued
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Mint retry already queued");
            return Ok(false);
        }
        if let Err(e) = self.enqueue(RelayMessage::RetryFailedMints).await {
            self.retry_queued.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn circuit_states(&self) -> Vec<(String, CircuitState)> {
        let mut states = Vec::with_capacity(self.callers.len());
        for caller in &self.callers {
            states.push((caller.name().to_string(), caller.state().await));
        }
        states
    }

    async fn enqueue(&self, message: RelayMessage) -> BridgeResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| BridgeError::Rpc("relay queue closed".to_string()))
    }
}
