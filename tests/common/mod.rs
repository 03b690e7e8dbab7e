//! In-memory chain doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::consensus::encode::deserialize;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{PublicKey, Transaction};

use doge_bridge_relay::error::{BridgeError, BridgeResult};
use doge_bridge_relay::settlement::SettlementChain;
use doge_bridge_relay::source::{Network, SourceAddress, SourceChainRpc};
use doge_bridge_relay::tx_builder::{FeePolicy, TransactionBuilder};
use doge_bridge_relay::types::{SettlementEvent, Utxo};

// ============================================================================
// Source chain
// ============================================================================

#[derive(Default)]
pub struct MockSourceChain {
    utxos: Mutex<HashMap<String, Vec<Utxo>>>,
    pub broadcasts: Mutex<Vec<Transaction>>,
    pub list_calls: AtomicU32,
    /// Every `listunspent` fails with a transient error while set
    pub fail_lists: Mutex<bool>,
    /// Error returned by the next `sendrawtransaction`
    pub broadcast_error: Mutex<Option<BridgeError>>,
    /// `(address, label)` pairs imported into the wallet
    pub imports: Mutex<Vec<(String, String)>>,
    pub fail_imports: Mutex<bool>,
}

impl MockSourceChain {
    pub fn set_utxos(&self, address: &str, utxos: Vec<Utxo>) {
        self.utxos.lock().unwrap().insert(address.to_string(), utxos);
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn list_count(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceChainRpc for MockSourceChain {
    async fn list_unspent(
        &self,
        min_conf: u32,
        _max_conf: u32,
        addresses: &[String],
    ) -> BridgeResult<Vec<Utxo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_lists.lock().unwrap() {
            return Err(BridgeError::Rpc("connection refused".into()));
        }
        let utxos = self.utxos.lock().unwrap();
        Ok(addresses
            .iter()
            .flat_map(|a| utxos.get(a).cloned().unwrap_or_default())
            .filter(|u| u.confirmations >= min_conf)
            .collect())
    }

    async fn send_raw_transaction(&self, raw_hex: &str) -> BridgeResult<String> {
        let bytes = hex::decode(raw_hex).map_err(|e| BridgeError::Rejected {
            code: -22,
            message: format!("TX decode failed: {}", e),
        })?;
        let tx: Transaction = deserialize(&bytes).map_err(|e| BridgeError::Rejected {
            code: -22,
            message: format!("TX decode failed: {}", e),
        })?;
        let txid = tx.compute_txid().to_string();
        self.broadcasts.lock().unwrap().push(tx);

        if let Some(err) = self.broadcast_error.lock().unwrap().take() {
            return Err(err);
        }
        Ok(txid)
    }

    async fn import_address(&self, address: &str, label: &str) -> BridgeResult<()> {
        if *self.fail_imports.lock().unwrap() {
            return Err(BridgeError::Rejected {
                code: -4,
                message: "Wallet is disabled".into(),
            });
        }
        self.imports
            .lock()
            .unwrap()
            .push((address.to_string(), label.to_string()));
        Ok(())
    }
}

// ============================================================================
// Settlement chain
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintCall {
    pub recipient: String,
    pub amount_units: u64,
    pub deposit_id: [u8; 32],
}

#[derive(Default)]
pub struct MockSettlementChain {
    pub mints: Mutex<Vec<MintCall>>,
    pub burns: Mutex<Vec<(String, u64)>>,
    pub confirmations: Mutex<Vec<(u64, String)>>,
    pub processed: Mutex<HashSet<[u8; 32]>>,
    pub fail_mints: Mutex<bool>,
    pub fail_burns: Mutex<bool>,
    /// Error returned by the next `burn`
    pub burn_error: Mutex<Option<BridgeError>>,
    pub latest: Mutex<u64>,
    pub events: Mutex<Vec<(u64, SettlementEvent)>>,
}

impl MockSettlementChain {
    pub fn mint_count(&self) -> usize {
        self.mints.lock().unwrap().len()
    }

    pub fn burn_count(&self) -> usize {
        self.burns.lock().unwrap().len()
    }
}

#[async_trait]
impl SettlementChain for MockSettlementChain {
    async fn mint(&self, recipient: &str, amount_units: u64, deposit_id: [u8; 32]) -> BridgeResult<String> {
        if *self.fail_mints.lock().unwrap() {
            return Err(BridgeError::Rpc("503 Service Unavailable".into()));
        }
        if !self.processed.lock().unwrap().insert(deposit_id) {
            return Err(BridgeError::AlreadyProcessed("deposit already processed".into()));
        }
        let mut mints = self.mints.lock().unwrap();
        mints.push(MintCall {
            recipient: recipient.to_string(),
            amount_units,
            deposit_id,
        });
        Ok(format!("0x{:064x}", mints.len()))
    }

    async fn burn(&self, holder: &str, amount_units: u64) -> BridgeResult<String> {
        if let Some(err) = self.burn_error.lock().unwrap().take() {
            return Err(err);
        }
        if *self.fail_burns.lock().unwrap() {
            return Err(BridgeError::Rejected {
                code: 3,
                message: "execution reverted: burn amount exceeds balance".into(),
            });
        }
        self.burns
            .lock()
            .unwrap()
            .push((holder.to_string(), amount_units));
        Ok("0xburn".to_string())
    }

    async fn is_deposit_processed(&self, deposit_id: [u8; 32]) -> BridgeResult<bool> {
        Ok(self.processed.lock().unwrap().contains(&deposit_id))
    }

    async fn confirm_withdrawal(&self, request_id: u64, source_txid: &str) -> BridgeResult<String> {
        self.confirmations
            .lock()
            .unwrap()
            .push((request_id, source_txid.to_string()));
        Ok("0xconfirm".to_string())
    }

    async fn latest_block(&self) -> BridgeResult<u64> {
        Ok(*self.latest.lock().unwrap())
    }

    async fn fetch_events(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<SettlementEvent>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(block, _)| *block >= from_block && *block <= to_block)
            .map(|(_, e)| e.clone())
            .collect())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub const OWNER: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

pub fn operator_key() -> SecretKey {
    SecretKey::from_slice(&[0x11; 32]).unwrap()
}

/// Size model giving a 50-unit fee for two inputs and two outputs
pub fn small_fee_policy() -> FeePolicy {
    FeePolicy {
        fee_rate: 1,
        base_bytes: 0,
        bytes_per_input: 20,
        bytes_per_output: 5,
    }
}

pub fn builder(dust_threshold: u64) -> TransactionBuilder {
    TransactionBuilder::new(Network::Mainnet, operator_key(), dust_threshold, small_fee_policy())
}

/// A mainnet address nobody in the tests controls
pub fn recipient_address() -> String {
    let key = SecretKey::from_slice(&[0x22; 32]).unwrap();
    let pk = PublicKey::new(key.public_key(&Secp256k1::new()));
    SourceAddress::from_public_key(&pk, Network::Mainnet).encode()
}

pub fn utxo(seed: u8, value_units: u64, confirmations: u32) -> Utxo {
    Utxo {
        txid: format!("{:064x}", seed),
        vout: 0,
        value_units,
        confirmations,
        script_pubkey: String::new(),
        address: None,
    }
}
