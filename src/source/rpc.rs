//! Source-chain JSON-RPC client
//!
//! Talks to a Dogecoin Core compatible node over HTTP with basic auth. Node
//! error replies (`{"error": {"code", "message"}}`) are mapped to typed
//! [`BridgeError`]s through [`classify_node_error`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Amount;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::SourceChainRpc;
use crate::error::{classify_node_error, BridgeError, BridgeResult};
use crate::types::Utxo;

/// Connection settings for the source-chain node
#[derive(Clone)]
pub struct SourceRpcConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

/// Custom Debug that redacts the RPC password
impl fmt::Debug for SourceRpcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRpcConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Entry returned by `listunspent`
#[derive(Debug, Deserialize)]
struct ListUnspentEntry {
    txid: String,
    vout: u32,
    #[serde(default)]
    address: Option<String>,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: String,
    /// Whole coins as a JSON number
    amount: f64,
    confirmations: u32,
}

impl ListUnspentEntry {
    fn into_utxo(self) -> BridgeResult<Utxo> {
        let value = Amount::from_btc(self.amount).map_err(|e| {
            BridgeError::InvalidAmount(format!("{}:{} amount {}: {}", self.txid, self.vout, self.amount, e))
        })?;
        Ok(Utxo {
            txid: self.txid,
            vout: self.vout,
            value_units: value.to_sat(),
            confirmations: self.confirmations,
            script_pubkey: self.script_pub_key,
            address: self.address,
        })
    }
}

/// HTTP JSON-RPC client for the source-chain node
pub struct SourceRpcClient {
    url: String,
    user: String,
    password: String,
    timeout: Duration,
    client: Client,
    next_id: AtomicU64,
}

impl SourceRpcClient {
    pub fn new(config: &SourceRpcConfig) -> BridgeResult<Self> {
        if config.url.is_empty() {
            return Err(BridgeError::Configuration(
                "source RPC URL cannot be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BridgeError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: config.url.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            timeout: config.timeout,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> BridgeResult<T> {
        self.request(method, params)
            .await?
            .ok_or_else(|| BridgeError::Rpc(format!("{} returned no result", method)))
    }

    /// Like `call`, for methods whose success result is `null`
    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> BridgeResult<Option<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "1.0",
            id,
            method,
            params,
        };

        debug!(method, id, "Source RPC request");

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BridgeError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    BridgeError::Rpc(format!("{} request failed: {}", method, e))
                }
            })?;

        let status = response.status();
        // The node answers errors with HTTP 500 and a JSON body, so read the body first
        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::Rpc(format!("{} body read failed: {}", method, e)))?;

        let parsed: RpcResponse<T> = serde_json::from_str(&body).map_err(|e| {
            BridgeError::Rpc(format!(
                "{} returned HTTP {} with unparseable body: {}",
                method, status, e
            ))
        })?;

        if let Some(err) = parsed.error {
            return Err(classify_node_error(err.code, &err.message));
        }

        Ok(parsed.result)
    }
}

#[async_trait]
impl SourceChainRpc for SourceRpcClient {
    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> BridgeResult<Vec<Utxo>> {
        let entries: Vec<ListUnspentEntry> = self
            .call("listunspent", json!([min_conf, max_conf, addresses]))
            .await?;

        entries.into_iter().map(ListUnspentEntry::into_utxo).collect()
    }

    async fn send_raw_transaction(&self, raw_hex: &str) -> BridgeResult<String> {
        self.call("sendrawtransaction", json!([raw_hex])).await
    }

    async fn import_address(&self, address: &str, label: &str) -> BridgeResult<()> {
        // No rescan: the address was generated locally and cannot hold older outputs
        self.request::<Value>("importaddress", json!([address, label, false]))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_unspent_entry() {
        let body = r#"{
            "result": [{
                "txid": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                "vout": 1,
                "address": "DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L",
                "scriptPubKey": "76a91485b0f5e4f2b5d3cfa1b4b0c1d2e3f4a5b6c7d8e988ac",
                "amount": 100.5,
                "confirmations": 6,
                "spendable": false
            }],
            "error": null,
            "id": 1
        }"#;

        let parsed: RpcResponse<Vec<ListUnspentEntry>> = serde_json::from_str(body).unwrap();
        let utxo = parsed.result.unwrap().pop().unwrap().into_utxo().unwrap();
        assert_eq!(utxo.vout, 1);
        assert_eq!(utxo.value_units, 10_050_000_000);
        assert_eq!(utxo.confirmations, 6);
        assert_eq!(
            utxo.address.as_deref(),
            Some("DH5yaieqoZN36fDVciNyRueRGvGLR3mr7L")
        );
    }

    #[test]
    fn test_parse_error_body() {
        let body = r#"{"result":null,"error":{"code":-26,"message":"66: min relay fee not met"},"id":3}"#;
        let parsed: RpcResponse<String> = serde_json::from_str(body).unwrap();
        let err = parsed.error.unwrap();
        assert!(matches!(
            classify_node_error(err.code, &err.message),
            BridgeError::Rejected { code: -26, .. }
        ));
    }

    #[test]
    fn test_null_result_parses_as_none() {
        let body = r#"{"result":null,"error":null,"id":4}"#;
        let parsed: RpcResponse<Value> = serde_json::from_str(body).unwrap();
        assert!(parsed.result.is_none());
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SourceRpcConfig {
            url: "http://localhost:22555".to_string(),
            user: "relay".to_string(),
            password: "hunter2".to_string(),
            timeout: Duration::from_secs(5),
        };
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_empty_url_rejected() {
        let config = SourceRpcConfig {
            url: String::new(),
            user: "relay".to_string(),
            password: "pw".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(
            SourceRpcClient::new(&config),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires a regtest node on localhost:18332"]
    async fn test_list_unspent_against_node() {
        let config = SourceRpcConfig {
            url: std::env::var("SOURCE_RPC_URL")
                .unwrap_or_else(|_| "http://localhost:18332".to_string()),
            user: std::env::var("SOURCE_RPC_USER").unwrap_or_default(),
            password: std::env::var("SOURCE_RPC_PASSWORD").unwrap_or_default(),
            timeout: Duration::from_secs(5),
        };
        let client = SourceRpcClient::new(&config).unwrap();
        let utxos = client.list_unspent(0, 9_999_999, &[]).await.unwrap();
        println!("node reports {} unspent outputs", utxos.len());
    }
}
