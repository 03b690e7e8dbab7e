//! Source (UTXO) chain access
//!
//! - `address`: network parameters and P2PKH address encoding
//! - `rpc`: JSON-RPC client for the source-chain node

use async_trait::async_trait;

use crate::error::BridgeResult;
use crate::types::Utxo;

pub mod address;
pub mod rpc;

pub use address::{Network, SourceAddress};
pub use rpc::{SourceRpcClient, SourceRpcConfig};

/// Upper bound passed as `maxconf` to `listunspent`
pub const MAX_CONFIRMATIONS: u32 = 9_999_999;

/// Remote operations the relay needs from the source-chain node
#[async_trait]
pub trait SourceChainRpc: Send + Sync {
    /// `listunspent(minconf, maxconf, [addresses])`
    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> BridgeResult<Vec<Utxo>>;

    /// `sendrawtransaction(hex)`, returns the txid accepted by the node
    async fn send_raw_transaction(&self, raw_hex: &str) -> BridgeResult<String>;

    /// `importaddress(address, label, false)`. The node only reports
    /// `listunspent` outputs for addresses in its wallet.
    async fn import_address(&self, address: &str, label: &str) -> BridgeResult<()>;
}
