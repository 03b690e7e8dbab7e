use alloy::providers::{ProviderBuilder, RootProvider};
use alloy::transports::http::{Client, Http};

use crate::error::{BridgeError, BridgeResult};

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Create alloy HTTP providers for each RPC URL, primary first.
pub fn create_providers(urls: &[String]) -> BridgeResult<Vec<RootProvider<Http<Client>>>> {
    if urls.is_empty() {
        return Err(BridgeError::Configuration(
            "At least one settlement RPC URL is required".to_string(),
        ));
    }
    urls.iter()
        .map(|url| {
            let parsed = url
                .parse()
                .map_err(|e| BridgeError::Configuration(format!("Invalid RPC URL {}: {}", url, e)))?;
            Ok(ProviderBuilder::new().on_http(parsed))
        })
        .collect()
}
