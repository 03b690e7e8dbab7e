//! Settlement-chain event watcher
//!
//! Scans token logs from a block cursor up to `latest - finality_blocks` and
//! forwards `WithdrawalRequested` and `Mint` events to the orchestrator. The
//! cursor only advances after every event of a range was queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::BridgeResult;
use crate::metrics;
use crate::settlement::SettlementChain;
use crate::types::{RelayMessage, SettlementEvent};

#[derive(Debug, Clone)]
pub struct WithdrawalMonitorConfig {
    pub finality_blocks: u64,
    pub poll_interval: Duration,
    /// First block to scan; 0 starts at the finalized head seen at start-up
    pub start_block: u64,
    /// Upper bound on blocks per `eth_getLogs` query
    pub max_block_range: u64,
}

impl Default for WithdrawalMonitorConfig {
    fn default() -> Self {
        Self {
            finality_blocks: 1,
            poll_interval: Duration::from_secs(5),
            start_block: 0,
            max_block_range: 1_000,
        }
    }
}

pub struct WithdrawalMonitor {
    config: WithdrawalMonitorConfig,
    settlement: Arc<dyn SettlementChain>,
    sender: mpsc::Sender<RelayMessage>,
    cursor: Option<u64>,
}

impl WithdrawalMonitor {
    pub fn new(
        config: WithdrawalMonitorConfig,
        settlement: Arc<dyn SettlementChain>,
        sender: mpsc::Sender<RelayMessage>,
    ) -> Self {
        let cursor = (config.start_block > 0).then_some(config.start_block);
        Self {
            config,
            settlement,
            sender,
            cursor,
        }
    }

    /// Next block to scan, once known
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Scan one block range. Returns the number of events forwarded.
    pub async fn poll_once(&mut self) -> BridgeResult<usize> {
        let latest = self.settlement.latest_block().await?;
        let safe = latest.saturating_sub(self.config.finality_blocks);
        let from = *self.cursor.get_or_insert(safe);

        if from > safe {
            return Ok(0);
        }
        let to = safe.min(from.saturating_add(self.config.max_block_range.max(1) - 1));

        let events = self.settlement.fetch_events(from, to).await?;
        debug!(from_block = from, to_block = to, events = events.len(), "Scanned settlement blocks");

        let mut forwarded = 0;
        for event in events {
            let message = match event {
                SettlementEvent::WithdrawalRequested(request) => {
                    info!(
                        withdrawal_id = %request.withdrawal_id(),
                        amount = request.amount_units,
                        destination = %request.recipient_address,
                        "Withdrawal requested on settlement chain"
                    );
                    RelayMessage::Withdrawal(request)
                }
                SettlementEvent::Mint {
                    deposit_id,
                    tx_hash,
                    ..
                } => RelayMessage::MintObserved { deposit_id, tx_hash },
            };

            if self.sender.send(message).await.is_err() {
                warn!(from_block = from, "Orchestrator queue closed, cursor not advanced");
                return Ok(forwarded);
            }
            forwarded += 1;
        }

        self.cursor = Some(to + 1);
        metrics::SETTLEMENT_CURSOR
            .with_label_values(&["settlement"])
            .set((to + 1) as i64);
        metrics::mark_poll("settlement");
        Ok(forwarded)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            finality_blocks = self.config.finality_blocks,
            start_block = ?self.cursor,
            "Settlement event monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // A range that fails is retried from the same cursor next tick
            if let Err(e) = self.poll_once().await {
                warn!(cursor = ?self.cursor, error = %e, "Settlement poll failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Settlement event monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::types::{WithdrawalRequest, WithdrawalSource};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FakeChain {
        latest: Mutex<u64>,
        events: Vec<(u64, SettlementEvent)>,
        queried: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl SettlementChain for FakeChain {
        async fn mint(&self, _: &str, _: u64, _: [u8; 32]) -> BridgeResult<String> {
            unreachable!()
        }
        async fn burn(&self, _: &str, _: u64) -> BridgeResult<String> {
            unreachable!()
        }
        async fn is_deposit_processed(&self, _: [u8; 32]) -> BridgeResult<bool> {
            unreachable!()
        }
        async fn confirm_withdrawal(&self, _: u64, _: &str) -> BridgeResult<String> {
            unreachable!()
        }
        async fn latest_block(&self) -> BridgeResult<u64> {
            Ok(*self.latest.lock().unwrap())
        }
        async fn fetch_events(&self, from: u64, to: u64) -> BridgeResult<Vec<SettlementEvent>> {
            self.queried.lock().unwrap().push((from, to));
            if from > to {
                return Err(BridgeError::Rpc("bad range".into()));
            }
            Ok(self
                .events
                .iter()
                .filter(|(block, _)| *block >= from && *block <= to)
                .map(|(_, e)| e.clone())
                .collect())
        }
    }

    fn withdrawal_at(block: u64, id: u64) -> (u64, SettlementEvent) {
        (
            block,
            SettlementEvent::WithdrawalRequested(WithdrawalRequest {
                source: WithdrawalSource::Event {
                    request_id: id,
                    block_number: block,
                },
                requester: "0x01".into(),
                recipient_address: "DLCDJhnh6aGotar6b182jpzbNEyXb3C361".into(),
                amount_units: 5_000,
                requested_at: Utc::now(),
            }),
        )
    }

    fn config(start_block: u64, max_block_range: u64) -> WithdrawalMonitorConfig {
        WithdrawalMonitorConfig {
            finality_blocks: 2,
            poll_interval: Duration::from_millis(10),
            start_block,
            max_block_range,
        }
    }

    #[tokio::test]
    async fn test_respects_finality() {
        let chain = Arc::new(FakeChain {
            latest: Mutex::new(11),
            events: vec![withdrawal_at(9, 1), withdrawal_at(10, 2)],
            queried: Mutex::new(vec![]),
        });
        let (tx, mut rx) = mpsc::channel(16);
        let mut monitor = WithdrawalMonitor::new(config(5, 100), chain.clone(), tx);

        assert_eq!(monitor.poll_once().await.unwrap(), 1);
        assert_eq!(chain.queried.lock().unwrap().as_slice(), &[(5, 9)]);
        assert_eq!(monitor.cursor(), Some(10));
        assert!(matches!(rx.try_recv().unwrap(), RelayMessage::Withdrawal(_)));

        // Nothing new is final yet
        assert_eq!(monitor.poll_once().await.unwrap(), 0);

        *chain.latest.lock().unwrap() = 12;
        assert_eq!(monitor.poll_once().await.unwrap(), 1);
        assert_eq!(monitor.cursor(), Some(11));
    }

    #[tokio::test]
    async fn test_caps_block_range() {
        let chain = Arc::new(FakeChain {
            latest: Mutex::new(102),
            events: vec![],
            queried: Mutex::new(vec![]),
        });
        let (tx, _rx) = mpsc::channel(16);
        let mut monitor = WithdrawalMonitor::new(config(1, 40), chain.clone(), tx);

        monitor.poll_once().await.unwrap();
        monitor.poll_once().await.unwrap();
        monitor.poll_once().await.unwrap();
        assert_eq!(
            chain.queried.lock().unwrap().as_slice(),
            &[(1, 40), (41, 80), (81, 100)]
        );
    }

    #[tokio::test]
    async fn test_zero_start_block_begins_at_head() {
        let chain = Arc::new(FakeChain {
            latest: Mutex::new(50),
            events: vec![withdrawal_at(3, 1)],
            queried: Mutex::new(vec![]),
        });
        let (tx, mut rx) = mpsc::channel(16);
        let mut monitor = WithdrawalMonitor::new(config(0, 100), chain.clone(), tx);

        assert_eq!(monitor.poll_once().await.unwrap(), 0);
        assert_eq!(chain.queried.lock().unwrap().as_slice(), &[(48, 48)]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mint_events_become_observations() {
        let chain = Arc::new(FakeChain {
            latest: Mutex::new(10),
            events: vec![(
                4,
                SettlementEvent::Mint {
                    recipient: "0x01".into(),
                    amount_units: 100,
                    deposit_id: [7u8; 32],
                    tx_hash: "0xbeef".into(),
                },
            )],
            queried: Mutex::new(vec![]),
        });
        let (tx, mut rx) = mpsc::channel(16);
        let mut monitor = WithdrawalMonitor::new(config(1, 100), chain, tx);

        assert_eq!(monitor.poll_once().await.unwrap(), 1);
        match rx.try_recv().unwrap() {
            RelayMessage::MintObserved { deposit_id, tx_hash } => {
                assert_eq!(deposit_id, [7u8; 32]);
                assert_eq!(tx_hash, "0xbeef");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
