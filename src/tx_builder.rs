//! Source-chain payout transactions
//!
//! [`CoinSelector`] picks operator outputs largest-first; [`TransactionBuilder`]
//! lays out the payout (recipient first, optional change back to the operator)
//! and signs every input with legacy SIGHASH_ALL. Nothing here touches the
//! network.

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tracing::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::source::{Network, SourceAddress};
use crate::types::Utxo;

/// Linear size model used for fee estimation, in base units per byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub fee_rate: u64,
    pub base_bytes: u64,
    pub bytes_per_input: u64,
    pub bytes_per_output: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            fee_rate: 1000,
            base_bytes: 10,
            bytes_per_input: 148,
            bytes_per_output: 34,
        }
    }
}

impl FeePolicy {
    pub fn estimated_size(&self, inputs: usize, outputs: usize) -> u64 {
        self.base_bytes
            .saturating_add((inputs as u64).saturating_mul(self.bytes_per_input))
            .saturating_add((outputs as u64).saturating_mul(self.bytes_per_output))
    }

    pub fn fee(&self, inputs: usize, outputs: usize) -> u64 {
        self.estimated_size(inputs, outputs).saturating_mul(self.fee_rate)
    }
}

/// Result of coin selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub total: u64,
    /// Fee for the selected inputs and two outputs
    pub fee: u64,
}

pub struct CoinSelector;

impl CoinSelector {
    /// Greedy largest-first selection covering `amount` plus the fee of a
    /// two-output transaction.
    pub fn select(pool: &[Utxo], amount: u64, policy: &FeePolicy) -> BridgeResult<Selection> {
        let mut candidates: Vec<&Utxo> = pool.iter().collect();
        candidates.sort_by(|a, b| {
            b.value_units
                .cmp(&a.value_units)
                .then_with(|| a.txid.cmp(&b.txid))
                .then_with(|| a.vout.cmp(&b.vout))
        });

        let mut inputs = Vec::new();
        let mut total = 0u64;
        for utxo in candidates {
            inputs.push(utxo.clone());
            total = total.saturating_add(utxo.value_units);
            let fee = policy.fee(inputs.len(), 2);
            if total >= amount.saturating_add(fee) {
                return Ok(Selection { inputs, total, fee });
            }
        }

        Err(BridgeError::InsufficientFunds {
            needed: amount.saturating_add(policy.fee(inputs.len().max(1), 2)),
            available: total,
        })
    }
}

/// Signed payout ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltTransaction {
    pub txid: String,
    pub raw_hex: String,
    pub fee: u64,
    /// Value returned to the operator, 0 when absorbed into the fee
    pub change: u64,
    pub inputs: Vec<Utxo>,
}

pub struct TransactionBuilder {
    network: Network,
    secp: Secp256k1<All>,
    operator_key: SecretKey,
    operator_public_key: PublicKey,
    operator_address: SourceAddress,
    dust_threshold: u64,
    fee_policy: FeePolicy,
}

impl TransactionBuilder {
    pub fn new(
        network: Network,
        operator_key: SecretKey,
        dust_threshold: u64,
        fee_policy: FeePolicy,
    ) -> Self {
        let secp = Secp256k1::new();
        let operator_public_key = PublicKey::new(operator_key.public_key(&secp));
        let operator_address = SourceAddress::from_public_key(&operator_public_key, network);
        Self {
            network,
            secp,
            operator_key,
            operator_public_key,
            operator_address,
            dust_threshold,
            fee_policy,
        }
    }

    pub fn operator_address(&self) -> String {
        self.operator_address.encode()
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn dust_threshold(&self) -> u64 {
        self.dust_threshold
    }

    /// Checks that need no network access, in the order they are reported
    pub fn validate_payout(&self, recipient: &str, amount: u64) -> BridgeResult<SourceAddress> {
        if amount == 0 {
            return Err(BridgeError::InvalidAmount("payout amount must be positive".to_string()));
        }
        if self.fee_policy.fee_rate == 0 {
            return Err(BridgeError::InvalidAmount("fee rate must be positive".to_string()));
        }
        if amount < self.dust_threshold {
            return Err(BridgeError::DustThreshold {
                amount,
                threshold: self.dust_threshold,
            });
        }
        SourceAddress::parse(recipient, self.network)
    }

    /// Select coins from `pool`, lay out outputs and sign
    pub fn build(&self, recipient: &str, amount: u64, pool: &[Utxo]) -> BridgeResult<BuiltTransaction> {
        let recipient = self.validate_payout(recipient, amount)?;
        let selection = CoinSelector::select(pool, amount, &self.fee_policy)?;

        let mut fee = selection.fee;
        let mut change = selection.total - amount - fee;
        if change <= self.dust_threshold {
            fee += change;
            change = 0;
        }

        let input = selection
            .inputs
            .iter()
            .map(|utxo| {
                let txid = Txid::from_str(&utxo.txid).map_err(|e| {
                    BridgeError::InvalidTransaction(format!("bad input txid {}: {}", utxo.txid, e))
                })?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, utxo.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
            })
            .collect::<BridgeResult<Vec<_>>>()?;

        let mut output = vec![TxOut {
            value: Amount::from_sat(amount),
            script_pubkey: recipient.script_pubkey(),
        }];
        if change > 0 {
            output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: self.operator_address.script_pubkey(),
            });
        }

        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input,
            output,
        };
        self.sign_inputs(&mut tx)?;

        let txid = tx.compute_txid().to_string();
        debug!(
            txid = %txid,
            inputs = tx.input.len(),
            outputs = tx.output.len(),
            amount,
            fee,
            change,
            "Built payout transaction"
        );

        Ok(BuiltTransaction {
            txid,
            raw_hex: serialize_hex(&tx),
            fee,
            change,
            inputs: selection.inputs,
        })
    }

    fn sign_inputs(&self, tx: &mut Transaction) -> BridgeResult<()> {
        let prevout_script = self.operator_address.script_pubkey();
        let sighash_type = EcdsaSighashType::All;

        let script_sigs = {
            let cache = SighashCache::new(&*tx);
            (0..tx.input.len())
                .map(|index| {
                    let sighash = cache
                        .legacy_signature_hash(index, &prevout_script, sighash_type.to_u32())
                        .map_err(|e| BridgeError::Signing(format!("input {}: {}", index, e)))?;
                    let message = Message::from_digest(sighash.to_byte_array());
                    let signature = ecdsa::Signature {
                        signature: self.secp.sign_ecdsa(&message, &self.operator_key),
                        sighash_type,
                    };
                    let push = PushBytesBuf::try_from(signature.to_vec())
                        .map_err(|e| BridgeError::Signing(format!("input {}: {}", index, e)))?;
                    Ok(ScriptBuf::builder()
                        .push_slice(push)
                        .push_key(&self.operator_public_key)
                        .into_script())
                })
                .collect::<BridgeResult<Vec<_>>>()?
        };

        for (input, script_sig) in tx.input.iter_mut().zip(script_sigs) {
            input.script_sig = script_sig;
        }
        Ok(())
    }
}

/// Parse a 32-byte hex secret key (with or without `0x`)
pub fn parse_secret_key(raw: &str) -> BridgeResult<SecretKey> {
    let bytes = hex::decode(raw.trim().trim_start_matches("0x"))
        .map_err(|e| BridgeError::Configuration(format!("source private key is not hex: {}", e)))?;
    SecretKey::from_slice(&bytes)
        .map_err(|e| BridgeError::Configuration(format!("invalid source private key: {}", e)))
}
