//! EVM settlement client
//!
//! Reads go through the configured RPC endpoints in order (primary, then
//! fallbacks). Writes are signed by the operator key and sent through the
//! primary endpoint with `with_recommended_fillers()` so nonce, gas and fees
//! are populated.

use std::fmt;
use std::str::FromStr;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use super::contract::BridgedToken;
use super::SettlementChain;
use crate::error::{classify_node_error, BridgeError, BridgeResult};
use crate::rpc_fallback::create_providers;
use crate::types::{SettlementEvent, WithdrawalRequest, WithdrawalSource};

/// Settlement client configuration
#[derive(Clone)]
pub struct SettlementClientConfig {
    /// Primary URL followed by fallbacks
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub token_address: String,
    pub private_key: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for SettlementClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementClientConfig")
            .field("rpc_urls", &self.rpc_urls)
            .field("chain_id", &self.chain_id)
            .field("token_address", &self.token_address)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Alloy-backed implementation of [`SettlementChain`]
pub struct EvmSettlementClient {
    rpc_urls: Vec<String>,
    providers: Vec<RootProvider<Http<Client>>>,
    token_address: Address,
    chain_id: u64,
    signer: PrivateKeySigner,
}

impl EvmSettlementClient {
    pub fn new(config: &SettlementClientConfig) -> BridgeResult<Self> {
        let providers = create_providers(&config.rpc_urls)?;
        let token_address = Address::from_str(&config.token_address).map_err(|e| {
            BridgeError::Configuration(format!("Invalid token address {}: {}", config.token_address, e))
        })?;
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .map_err(|e| BridgeError::Configuration(format!("Invalid settlement private key: {}", e)))?;

        info!(
            operator_address = %signer.address(),
            chain_id = config.chain_id,
            token = %token_address,
            endpoints = providers.len(),
            "Settlement client initialized"
        );

        Ok(Self {
            rpc_urls: config.rpc_urls.clone(),
            providers,
            token_address,
            chain_id: config.chain_id,
            signer,
        })
    }

    pub fn operator_address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn primary_url(&self) -> BridgeResult<reqwest::Url> {
        let url = self
            .rpc_urls
            .first()
            .ok_or_else(|| BridgeError::Configuration("no settlement RPC URL".to_string()))?;
        url.parse()
            .map_err(|e| BridgeError::Configuration(format!("Invalid RPC URL {}: {}", url, e)))
    }

    fn parse_account(address: &str) -> BridgeResult<Address> {
        Address::from_str(address.trim())
            .map_err(|_| BridgeError::InvalidAddress(format!("not an EVM address: {}", address)))
    }

    fn decode_log(&self, log: &Log) -> BridgeResult<Option<SettlementEvent>> {
        let Some(topic0) = log.topics().first().copied() else {
            return Ok(None);
        };

        let tx_hash = log
            .transaction_hash
            .map(|h| format!("0x{:x}", h))
            .unwrap_or_default();

        if topic0 == BridgedToken::WithdrawalRequested::SIGNATURE_HASH {
            let decoded = log
                .log_decode::<BridgedToken::WithdrawalRequested>()
                .map_err(|e| BridgeError::Rpc(format!("Failed to decode WithdrawalRequested: {}", e)))?;
            let event = decoded.inner.data;

            let request_id: u64 = event
                .requestId
                .try_into()
                .map_err(|_| BridgeError::InvalidAmount(format!("request id {} overflows u64", event.requestId)))?;
            let amount_units: u64 = event
                .amount
                .try_into()
                .map_err(|_| BridgeError::InvalidAmount(format!("amount {} overflows u64", event.amount)))?;
            let requested_at = log
                .block_timestamp
                .and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single())
                .unwrap_or_else(Utc::now);

            return Ok(Some(SettlementEvent::WithdrawalRequested(WithdrawalRequest {
                source: WithdrawalSource::Event {
                    request_id,
                    block_number: log.block_number.unwrap_or_default(),
                },
                requester: format!("{}", event.requester),
                recipient_address: event.destination,
                amount_units,
                requested_at,
            })));
        }

        if topic0 == BridgedToken::Mint::SIGNATURE_HASH {
            let decoded = log
                .log_decode::<BridgedToken::Mint>()
                .map_err(|e| BridgeError::Rpc(format!("Failed to decode Mint: {}", e)))?;
            let event = decoded.inner.data;
            let amount_units: u64 = event
                .amount
                .try_into()
                .map_err(|_| BridgeError::InvalidAmount(format!("amount {} overflows u64", event.amount)))?;

            return Ok(Some(SettlementEvent::Mint {
                recipient: format!("{}", event.recipient),
                amount_units,
                deposit_id: event.depositId.0,
                tx_hash,
            }));
        }

        Ok(None)
    }
}

#[async_trait]
impl SettlementChain for EvmSettlementClient {
    async fn mint(
        &self,
        recipient: &str,
        amount_units: u64,
        deposit_id: [u8; 32],
    ) -> BridgeResult<String> {
        let recipient = Self::parse_account(recipient)?;
        if amount_units == 0 {
            return Err(BridgeError::InvalidAmount("mint amount must be positive".to_string()));
        }

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.primary_url()?);
        let contract = BridgedToken::new(self.token_address, &provider);

        debug!(
            recipient = %recipient,
            amount = amount_units,
            deposit_id = %hex::encode(deposit_id),
            "Submitting mint"
        );

        let pending_tx = contract
            .mint(recipient, U256::from(amount_units), FixedBytes::from(deposit_id))
            .send()
            .await
            .map_err(|e| classify_node_error(0, &format!("Failed to send mint: {}", e)))?;

        let tx_hash = *pending_tx.tx_hash();
        info!(tx_hash = %tx_hash, "Mint transaction sent, waiting for receipt");

        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| BridgeError::Rpc(format!("Failed to get mint receipt: {}", e)))?;

        if !receipt.status() {
            return Err(BridgeError::Rejected {
                code: 0,
                message: format!("mint transaction 0x{:x} reverted", tx_hash),
            });
        }

        Ok(format!("0x{:x}", tx_hash))
    }

    async fn burn(&self, holder: &str, amount_units: u64) -> BridgeResult<String> {
        let holder = Self::parse_account(holder)?;

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.primary_url()?);
        let contract = BridgedToken::new(self.token_address, &provider);

        let pending_tx = contract
            .burn(holder, U256::from(amount_units))
            .send()
            .await
            .map_err(|e| classify_node_error(0, &format!("Failed to send burn: {}", e)))?;

        let tx_hash = *pending_tx.tx_hash();
        info!(tx_hash = %tx_hash, holder = %holder, amount = amount_units, "Burn transaction sent");

        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| BridgeError::Rpc(format!("Failed to get burn receipt: {}", e)))?;

        if !receipt.status() {
            return Err(BridgeError::Rejected {
                code: 0,
                message: format!("burn transaction 0x{:x} reverted", tx_hash),
            });
        }

        Ok(format!("0x{:x}", tx_hash))
    }

    async fn is_deposit_processed(&self, deposit_id: [u8; 32]) -> BridgeResult<bool> {
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            let contract = BridgedToken::new(self.token_address, provider);
            match contract.processedDeposits(FixedBytes::from(deposit_id)).call().await {
                Ok(result) => return Ok(result._0),
                Err(e) => {
                    warn!(endpoint = index, error = %e, "processedDeposits query failed, trying next endpoint");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(BridgeError::Rpc(format!(
            "processedDeposits failed on all endpoints: {}",
            last_error.unwrap_or_default()
        )))
    }

    async fn confirm_withdrawal(&self, request_id: u64, source_txid: &str) -> BridgeResult<String> {
        let txid_bytes: [u8; 32] = hex::decode(source_txid.trim_start_matches("0x"))
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| BridgeError::InvalidTransaction(format!("bad source txid: {}", source_txid)))?;

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.primary_url()?);
        let contract = BridgedToken::new(self.token_address, &provider);

        let pending_tx = contract
            .confirmWithdrawal(U256::from(request_id), FixedBytes::from(txid_bytes))
            .send()
            .await
            .map_err(|e| classify_node_error(0, &format!("Failed to send confirmWithdrawal: {}", e)))?;

        let tx_hash = *pending_tx.tx_hash();
        let receipt = pending_tx
            .get_receipt()
            .await
            .map_err(|e| BridgeError::Rpc(format!("Failed to get confirmWithdrawal receipt: {}", e)))?;

        if !receipt.status() {
            return Err(BridgeError::Rejected {
                code: 0,
                message: format!("confirmWithdrawal 0x{:x} reverted", tx_hash),
            });
        }

        Ok(format!("0x{:x}", tx_hash))
    }

    async fn latest_block(&self) -> BridgeResult<u64> {
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match provider.get_block_number().await {
                Ok(block) => return Ok(block),
                Err(e) => {
                    warn!(endpoint = index, error = %e, "Block number query failed, trying next endpoint");
                    last_error = Some(e.to_string());
                }
            }
        }
        Err(BridgeError::Rpc(format!(
            "get_block_number failed on all endpoints: {}",
            last_error.unwrap_or_default()
        )))
    }

    async fn fetch_events(&self, from_block: u64, to_block: u64) -> BridgeResult<Vec<SettlementEvent>> {
        let filter = Filter::new()
            .address(self.token_address)
            .from_block(from_block)
            .to_block(to_block);

        let mut logs = None;
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match provider.get_logs(&filter).await {
                Ok(found) => {
                    logs = Some(found);
                    break;
                }
                Err(e) => {
                    warn!(endpoint = index, error = %e, "get_logs failed, trying next endpoint");
                    last_error = Some(e.to_string());
                }
            }
        }
        let logs = logs.ok_or_else(|| {
            BridgeError::Rpc(format!(
                "get_logs failed on all endpoints: {}",
                last_error.unwrap_or_default()
            ))
        })?;

        let mut events = Vec::new();
        for log in &logs {
            match self.decode_log(log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Skipping undecodable token log"
                    );
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SettlementClientConfig {
        SettlementClientConfig {
            rpc_urls: vec!["http://localhost:8545".to_string()],
            chain_id: 31337,
            token_address: "0x0000000000000000000000000000000000000001".to_string(),
            private_key: "0x0000000000000000000000000000000000000000000000000000000000000001"
                .to_string(),
        }
    }

    #[test]
    fn test_new_client() {
        let client = EvmSettlementClient::new(&config()).unwrap();
        assert_eq!(client.chain_id(), 31337);
    }

    #[test]
    fn test_rejects_bad_token_address() {
        let mut cfg = config();
        cfg.token_address = "invalid".to_string();
        assert!(matches!(
            EvmSettlementClient::new(&cfg),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let printed = format!("{:?}", config());
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains("0000000000000000000000000000000000000000000000000000000000000001"));
    }

    #[test]
    fn test_parse_account() {
        assert!(EvmSettlementClient::parse_account("0x0000000000000000000000000000000000000002").is_ok());
        assert!(matches!(
            EvmSettlementClient::parse_account("DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L"),
            Err(BridgeError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires Anvil running on localhost:8545"]
    async fn test_latest_block_against_anvil() {
        let client = EvmSettlementClient::new(&config()).unwrap();
        let block = client.latest_block().await.unwrap();
        println!("anvil block: {}", block);
    }
}
