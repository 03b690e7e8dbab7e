//! Deposit address issuance and ownership
//!
//! Each generated address has its own secp256k1 key drawn from the OS entropy
//! source. Keys stay in memory; `Debug` output never includes them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::PublicKey;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};
use crate::source::{Network, SourceAddress};

/// A generated deposit address and the settlement account that owns it
#[derive(Clone)]
pub struct DepositAddress {
    pub address: String,
    /// Settlement-chain account credited for deposits to this address
    pub owner_id: String,
    pub signing_key: SecretKey,
    /// Sum of unspent outputs at the last poll, in base units
    pub observed_balance: u64,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for DepositAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepositAddress")
            .field("address", &self.address)
            .field("owner_id", &self.owner_id)
            .field("signing_key", &"<redacted>")
            .field("observed_balance", &self.observed_balance)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[derive(Default)]
struct AddressBook {
    by_address: HashMap<String, DepositAddress>,
    by_owner: HashMap<String, BTreeSet<String>>,
}

pub struct AddressManager {
    network: Network,
    book: RwLock<AddressBook>,
}

impl AddressManager {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            book: RwLock::new(AddressBook::default()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Create a fresh key and P2PKH address for `owner_id`
    pub async fn generate_deposit_address(&self, owner_id: &str) -> BridgeResult<String> {
        let signing_key = fresh_secret_key()?;
        let secp = Secp256k1::signing_only();
        let public_key = PublicKey::new(signing_key.public_key(&secp));
        let address = SourceAddress::from_public_key(&public_key, self.network).encode();

        let entry = DepositAddress {
            address: address.clone(),
            owner_id: owner_id.to_string(),
            signing_key,
            observed_balance: 0,
            created_at: Utc::now(),
        };

        let mut book = self.book.write().await;
        book.by_address.insert(address.clone(), entry);
        book.by_owner
            .entry(owner_id.to_string())
            .or_default()
            .insert(address.clone());

        info!(owner = owner_id, address = %address, network = %self.network, "Generated deposit address");
        Ok(address)
    }

    pub async fn get_address_details(&self, address: &str) -> Option<DepositAddress> {
        self.book.read().await.by_address.get(address).cloned()
    }

    pub async fn get_user_addresses(&self, owner_id: &str) -> BTreeSet<String> {
        self.book
            .read()
            .await
            .by_owner
            .get(owner_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Overwrite the observed balance. Unknown addresses are ignored.
    pub async fn update_balance(&self, address: &str, new_balance: u64) {
        let mut book = self.book.write().await;
        if let Some(entry) = book.by_address.get_mut(address) {
            if entry.observed_balance != new_balance {
                debug!(
                    address,
                    old = entry.observed_balance,
                    new = new_balance,
                    "Deposit address balance changed"
                );
            }
            entry.observed_balance = new_balance;
        }
    }

    pub async fn all_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.book.read().await.by_address.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn owner_of(&self, address: &str) -> Option<String> {
        self.book
            .read()
            .await
            .by_address
            .get(address)
            .map(|entry| entry.owner_id.clone())
    }

    pub async fn len(&self) -> usize {
        self.book.read().await.by_address.len()
    }
}

fn fresh_secret_key() -> BridgeResult<SecretKey> {
    let mut bytes = [0u8; 32];
    // Out-of-range scalars are astronomically rare; draw again if one shows up
    for _ in 0..4 {
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| BridgeError::KeyGeneration(format!("entropy source failed: {}", e)))?;
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            return Ok(key);
        }
    }
    Err(BridgeError::KeyGeneration(
        "could not draw a valid secp256k1 scalar".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_mainnet_address() {
        let manager = AddressManager::new(Network::Mainnet);
        let address = manager.generate_deposit_address("0xowner").await.unwrap();

        assert!(address.starts_with('D'));
        assert_eq!(address.len(), 34);
        assert!(SourceAddress::parse(&address, Network::Mainnet).is_ok());

        let details = manager.get_address_details(&address).await.unwrap();
        assert_eq!(details.owner_id, "0xowner");
        assert_eq!(details.observed_balance, 0);
    }

    #[tokio::test]
    async fn test_addresses_are_unique_per_call() {
        let manager = AddressManager::new(Network::Testnet);
        let a = manager.generate_deposit_address("alice").await.unwrap();
        let b = manager.generate_deposit_address("alice").await.unwrap();
        assert_ne!(a, b);

        let owned = manager.get_user_addresses("alice").await;
        assert_eq!(owned.len(), 2);
        assert!(owned.contains(&a) && owned.contains(&b));
        assert!(manager.get_user_addresses("bob").await.is_empty());
    }

    #[tokio::test]
    async fn test_update_balance_overwrites() {
        let manager = AddressManager::new(Network::Regtest);
        let address = manager.generate_deposit_address("carol").await.unwrap();

        manager.update_balance(&address, 500).await;
        manager.update_balance(&address, 500).await;
        assert_eq!(manager.get_address_details(&address).await.unwrap().observed_balance, 500);

        manager.update_balance(&address, 120).await;
        assert_eq!(manager.get_address_details(&address).await.unwrap().observed_balance, 120);

        // Unknown address is a no-op
        manager.update_balance("nobody", 1).await;
        assert!(manager.get_address_details("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_debug_redacts_key() {
        let manager = AddressManager::new(Network::Mainnet);
        let address = manager.generate_deposit_address("dave").await.unwrap();
        let details = manager.get_address_details(&address).await.unwrap();
        let printed = format!("{:?}", details);
        assert!(printed.contains("<redacted>"));
        assert!(!printed.contains(&hex::encode(details.signing_key.secret_bytes())));
    }
}
