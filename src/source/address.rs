//! Source-chain P2PKH address encoding
//!
//! Addresses are base58check of `version || hash160(pubkey)`. Only the legacy
//! pay-to-public-key-hash scheme is supported.

use bitcoin::hashes::Hash;
use bitcoin::{base58, PubkeyHash, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

/// Source-chain network, selects the address version byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Version byte for P2PKH addresses
    pub fn p2pkh_version(&self) -> u8 {
        match self {
            Network::Mainnet => 0x1e,
            Network::Testnet => 0x71,
            Network::Regtest => 0x6f,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

impl FromStr for Network {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(BridgeError::Configuration(format!(
                "unknown source network: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded P2PKH address on a specific network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceAddress {
    pub network: Network,
    pub pubkey_hash: PubkeyHash,
}

impl SourceAddress {
    pub fn from_public_key(public_key: &PublicKey, network: Network) -> Self {
        Self {
            network,
            pubkey_hash: public_key.pubkey_hash(),
        }
    }

    /// Decode and check the version byte against `network`
    pub fn parse(address: &str, network: Network) -> Result<Self, BridgeError> {
        let payload = base58::decode_check(address.trim())
            .map_err(|e| BridgeError::InvalidAddress(format!("{}: {}", address, e)))?;

        if payload.len() != 21 {
            return Err(BridgeError::InvalidAddress(format!(
                "{}: expected 21-byte payload, got {}",
                address,
                payload.len()
            )));
        }
        if payload[0] != network.p2pkh_version() {
            return Err(BridgeError::InvalidAddress(format!(
                "{}: version byte 0x{:02x} is not a {} P2PKH address",
                address, payload[0], network
            )));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Self {
            network,
            pubkey_hash: PubkeyHash::from_byte_array(hash),
        })
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&self.pubkey_hash)
    }

    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.network.p2pkh_version());
        payload.extend_from_slice(self.pubkey_hash.as_byte_array());
        base58::encode_check(&payload)
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Validate an address string for `network` without keeping the result
pub fn validate_address(address: &str, network: Network) -> Result<(), BridgeError> {
    SourceAddress::parse(address, network).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(network: Network) -> SourceAddress {
        SourceAddress {
            network,
            pubkey_hash: PubkeyHash::from_byte_array([7u8; 20]),
        }
    }

    #[test]
    fn test_mainnet_prefix() {
        let encoded = sample(Network::Mainnet).encode();
        assert!(encoded.starts_with('D'), "got {}", encoded);
        assert_eq!(encoded.len(), 34);
    }

    #[test]
    fn test_testnet_prefix() {
        let encoded = sample(Network::Testnet).encode();
        assert!(encoded.starts_with('n'), "got {}", encoded);
    }

    #[test]
    fn test_parse_encoded() {
        let addr = sample(Network::Mainnet);
        let parsed = SourceAddress::parse(&addr.encode(), Network::Mainnet).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.script_pubkey().len(), 25);
        assert!(parsed.script_pubkey().is_p2pkh());
    }

    #[test]
    fn test_same_hash_on_different_networks_stays_distinct() {
        let mut seen = std::collections::HashSet::new();
        assert!(seen.insert(sample(Network::Mainnet)));
        assert!(seen.insert(sample(Network::Testnet)));
        assert!(!seen.insert(sample(Network::Mainnet)));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_rejects_wrong_network() {
        let encoded = sample(Network::Testnet).encode();
        let err = SourceAddress::parse(&encoded, Network::Mainnet).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAddress(_)));
    }

    #[test]
    fn test_rejects_bad_checksum() {
        let mut encoded = sample(Network::Mainnet).encode();
        let last = encoded.pop().unwrap();
        encoded.push(if last == 'z' { 'y' } else { 'z' });
        assert!(validate_address(&encoded, Network::Mainnet).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(validate_address("", Network::Mainnet).is_err());
        assert!(validate_address("0xdeadbeef", Network::Mainnet).is_err());
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("TESTNET".parse::<Network>().unwrap(), Network::Testnet);
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert!("signet".parse::<Network>().is_err());
    }
}
