//! Confirmation-gated deposit detection
//!
//! Polls `listunspent` for every watched address, keeps the address book's
//! observed balances current and forwards each confirmed `(txid, address)`
//! deposit to the orchestrator exactly once.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::address_manager::AddressManager;
use crate::error::BridgeError;
use crate::metrics;
use crate::source::{Network, SourceChainRpc, MAX_CONFIRMATIONS};
use crate::types::{DepositEvent, DepositId, RelayMessage};

/// Addresses the monitor polls, shared with the service and API
#[derive(Clone, Default)]
pub struct WatchList {
    inner: Arc<RwLock<BTreeSet<String>>>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the address was already watched
    pub async fn watch(&self, address: &str) -> bool {
        self.inner.write().await.insert(address.to_string())
    }

    pub async fn unwatch(&self, address: &str) -> bool {
        self.inner.write().await.remove(address)
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.inner.read().await.contains(address)
    }

    /// Sorted copy of the watched addresses
    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[derive(Debug, Clone)]
pub struct DepositMonitorConfig {
    pub network: Network,
    pub required_confirmations: u32,
    pub poll_interval: Duration,
}

impl Default for DepositMonitorConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            required_confirmations: 6,
            poll_interval: Duration::from_secs(60),
        }
    }
}

pub struct DepositMonitor {
    config: DepositMonitorConfig,
    source: Arc<dyn SourceChainRpc>,
    addresses: Arc<AddressManager>,
    watch_list: WatchList,
    processed: HashSet<DepositId>,
    sender: mpsc::Sender<RelayMessage>,
}

impl DepositMonitor {
    pub fn new(
        config: DepositMonitorConfig,
        source: Arc<dyn SourceChainRpc>,
        addresses: Arc<AddressManager>,
        watch_list: WatchList,
        sender: mpsc::Sender<RelayMessage>,
    ) -> Self {
        Self {
            config,
            source,
            addresses,
            watch_list,
            processed: HashSet::new(),
            sender,
        }
    }

    pub fn watch_list(&self) -> &WatchList {
        &self.watch_list
    }

    /// Seed the processed set, e.g. from deposits already minted before a restart
    pub fn mark_processed<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = DepositId>,
    {
        let before = self.processed.len();
        self.processed.extend(ids);
        debug!(added = self.processed.len() - before, "Seeded processed deposits");
    }

    pub fn is_processed(&self, id: &DepositId) -> bool {
        self.processed.contains(id)
    }

    /// One pass over every watched address. Returns the number of deposits
    /// forwarded.
    pub async fn poll_once(&mut self) -> usize {
        let mut forwarded = 0;

        for address in self.watch_list.snapshot().await {
            let utxos = match self
                .source
                .list_unspent(1, MAX_CONFIRMATIONS, std::slice::from_ref(&address))
                .await
            {
                Ok(utxos) => utxos,
                Err(BridgeError::CircuitOpen { dependency }) => {
                    warn!(dependency = %dependency, "Source circuit open, ending deposit pass early");
                    return forwarded;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to list unspent outputs");
                    continue;
                }
            };

            let balance: u64 = utxos.iter().map(|u| u.value_units).sum();
            self.addresses.update_balance(&address, balance).await;

            // Outputs of one transaction to this address collapse into one deposit
            let mut confirmed: BTreeMap<String, (u64, u32)> = BTreeMap::new();
            for utxo in &utxos {
                if utxo.address.as_deref().is_some_and(|a| a != address) {
                    continue;
                }
                if utxo.confirmations < self.config.required_confirmations {
                    debug!(
                        txid = %utxo.txid,
                        address = %address,
                        confirmations = utxo.confirmations,
                        required = self.config.required_confirmations,
                        "Deposit awaiting confirmations"
                    );
                    continue;
                }
                let entry = confirmed.entry(utxo.txid.clone()).or_insert((0, u32::MAX));
                entry.0 = entry.0.saturating_add(utxo.value_units);
                entry.1 = entry.1.min(utxo.confirmations);
            }

            for (txid, (amount_units, confirmations)) in confirmed {
                let id = DepositId::new(&txid, &address);
                if self.processed.contains(&id) {
                    continue;
                }
                self.processed.insert(id.clone());

                let event = DepositEvent {
                    txid,
                    address: address.clone(),
                    amount_units,
                    confirmations,
                };
                info!(
                    deposit = %id,
                    amount = amount_units,
                    confirmations,
                    "Confirmed deposit detected"
                );

                if self.sender.send(RelayMessage::Deposit(event)).await.is_err() {
                    error!(deposit = %id, "Orchestrator queue closed, deposit not forwarded");
                    self.processed.remove(&id);
                    return forwarded;
                }
                metrics::DEPOSITS_DETECTED
                    .with_label_values(&[self.config.network.as_str()])
                    .inc();
                forwarded += 1;
            }
        }

        metrics::mark_poll("source");
        forwarded
    }

    /// Poll until shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            confirmations = self.config.required_confirmations,
            "Deposit monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let forwarded = self.poll_once().await;
            if forwarded > 0 {
                debug!(forwarded, "Deposit pass complete");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Deposit monitor stopped");
    }
}
