use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::deposit_monitor::DepositMonitorConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::rate_limit::RateLimitConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::rpc_fallback::parse_rpc_urls;
use crate::service::BridgeServiceConfig;
use crate::settlement::SettlementClientConfig;
use crate::source::{Network, SourceRpcConfig};
use crate::tx_builder::FeePolicy;
use crate::withdrawal::WithdrawalMonitorConfig;

/// Main configuration for the relay
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub deposits: DepositConfig,
    pub fees: FeeConfig,
    pub settlement: SettlementConfig,
    pub resilience: ResilienceConfig,
    pub rate_limit: RateLimitSettings,
    pub withdrawals: WithdrawalRetentionConfig,
    pub api: ApiConfig,
}

/// Source-chain node and operator key
#[derive(Clone)]
pub struct SourceConfig {
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub network: Network,
    /// 64 hex chars, pays out withdrawals
    pub private_key: String,
}

/// Custom Debug that redacts the RPC password and operator key.
impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_password", &"<redacted>")
            .field("network", &self.network)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DepositConfig {
    pub required_confirmations: u32,
    pub poll_interval_ms: u64,
    pub dust_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// Base units per estimated byte
    pub fee_rate: u64,
    pub base_bytes: u64,
    pub bytes_per_input: u64,
    pub bytes_per_output: u64,
}

/// Settlement (EVM) chain configuration
#[derive(Clone)]
pub struct SettlementConfig {
    pub rpc_url: String,
    /// Additional RPC URLs for fallback (tried in order when primary fails)
    pub rpc_fallback_urls: Vec<String>,
    pub chain_id: u64,
    pub token_address: String,
    pub private_key: String,
    pub finality_blocks: u64,
    pub poll_interval_ms: u64,
    pub start_block: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for SettlementConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementConfig")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_fallback_urls", &self.rpc_fallback_urls)
            .field("chain_id", &self.chain_id)
            .field("token_address", &self.token_address)
            .field("private_key", &"<redacted>")
            .field("finality_blocks", &self.finality_blocks)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("start_block", &self.start_block)
            .finish()
    }
}

impl SettlementConfig {
    /// All RPC URLs: primary followed by fallbacks.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = vec![self.rpc_url.clone()];
        urls.extend(self.rpc_fallback_urls.iter().cloned());
        urls
    }
}

#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub breaker_threshold: u32,
    pub breaker_reset_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub rpc_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub window_ms: u64,
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct WithdrawalRetentionConfig {
    pub retention_secs: u64,
    pub max_records: usize,
}

#[derive(Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    /// Bearer token for operator endpoints; unset disables them
    pub admin_token: Option<String>,
    /// How old a signed withdrawal request may be
    pub signature_max_age_secs: u64,
}

/// Custom Debug that redacts the admin token.
impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("signature_max_age_secs", &self.signature_max_age_secs)
            .finish()
    }
}

/// Default functions
fn default_network() -> Network {
    Network::Mainnet
}

fn default_confirmations() -> u32 {
    6
}

fn default_deposit_poll_interval() -> u64 {
    60_000 // one Dogecoin block
}

fn default_dust_threshold() -> u64 {
    546
}

fn default_fee_rate() -> u64 {
    1000
}

fn default_finality_blocks() -> u64 {
    1
}

fn default_settlement_poll_interval() -> u64 {
    5000
}

fn default_api_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> BridgeResult<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> BridgeResult<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path).map_err(|e| {
                BridgeError::Configuration(format!("Failed to load .env file from {}: {}", path, e))
            })?;
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup, then validate
    pub fn from_lookup<F>(lookup: F) -> BridgeResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let source = SourceConfig {
            rpc_url: vars.required("SOURCE_RPC_URL")?,
            rpc_user: vars.required("SOURCE_RPC_USER")?,
            rpc_password: vars.required("SOURCE_RPC_PASSWORD")?,
            network: vars.parsed("SOURCE_NETWORK", default_network())?,
            private_key: vars.required("SOURCE_PRIVATE_KEY")?,
        };

        let deposits = DepositConfig {
            required_confirmations: vars.parsed("REQUIRED_CONFIRMATIONS", default_confirmations())?,
            poll_interval_ms: vars.parsed("DEPOSIT_POLL_INTERVAL_MS", default_deposit_poll_interval())?,
            dust_threshold: vars.parsed("DUST_THRESHOLD", default_dust_threshold())?,
        };

        let fees = FeeConfig {
            fee_rate: vars.parsed("FEE_RATE", default_fee_rate())?,
            base_bytes: vars.parsed("TX_BASE_BYTES", 10)?,
            bytes_per_input: vars.parsed("TX_BYTES_PER_INPUT", 148)?,
            bytes_per_output: vars.parsed("TX_BYTES_PER_OUTPUT", 34)?,
        };

        let settlement_urls = parse_rpc_urls(&vars.required("SETTLEMENT_RPC_URL")?);
        let Some((primary, fallbacks)) = settlement_urls.split_first() else {
            return Err(BridgeError::Configuration(
                "SETTLEMENT_RPC_URL cannot be empty".to_string(),
            ));
        };

        let settlement = SettlementConfig {
            rpc_url: primary.clone(),
            rpc_fallback_urls: fallbacks.to_vec(),
            chain_id: vars.required_parsed("SETTLEMENT_CHAIN_ID")?,
            token_address: vars.required("SETTLEMENT_TOKEN_ADDRESS")?,
            private_key: vars.required("SETTLEMENT_PRIVATE_KEY")?,
            finality_blocks: vars.parsed("SETTLEMENT_FINALITY_BLOCKS", default_finality_blocks())?,
            poll_interval_ms: vars.parsed("SETTLEMENT_POLL_INTERVAL_MS", default_settlement_poll_interval())?,
            start_block: vars.parsed("SETTLEMENT_START_BLOCK", 0)?,
        };

        let resilience = ResilienceConfig {
            breaker_threshold: vars.parsed("CIRCUIT_BREAKER_THRESHOLD", 5)?,
            breaker_reset_ms: vars.parsed("CIRCUIT_BREAKER_RESET_MS", 60_000)?,
            retry_max_attempts: vars.parsed("RETRY_MAX_ATTEMPTS", 3)?,
            retry_initial_delay_ms: vars.parsed("RETRY_INITIAL_DELAY_MS", 1_000)?,
            retry_max_delay_ms: vars.parsed("RETRY_MAX_DELAY_MS", 30_000)?,
            retry_jitter_ms: vars.parsed("RETRY_JITTER_MS", 1_000)?,
            rpc_timeout_ms: vars.parsed("RPC_TIMEOUT_MS", 30_000)?,
        };

        let rate_limit = RateLimitSettings {
            max_requests: vars.parsed("RATE_LIMIT_MAX_REQUESTS", 10)?,
            window_ms: vars.parsed("RATE_LIMIT_WINDOW_MS", 60_000)?,
            burst: vars.parsed("RATE_LIMIT_BURST", 15)?,
        };

        let withdrawals = WithdrawalRetentionConfig {
            retention_secs: vars.parsed("WITHDRAWAL_RETENTION_SECS", 86_400)?,
            max_records: vars.parsed("WITHDRAWAL_MAX_RECORDS", 10_000)?,
        };

        let api = ApiConfig {
            bind_addr: vars.parsed("API_BIND_ADDR", default_api_bind_addr())?,
            admin_token: vars.optional("API_ADMIN_TOKEN"),
            signature_max_age_secs: vars.parsed("API_SIGNATURE_MAX_AGE_SECS", 300)?,
        };

        let config = Config {
            source,
            deposits,
            fees,
            settlement,
            resilience,
            rate_limit,
            withdrawals,
            api,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> BridgeResult<()> {
        let invalid = |msg: &str| Err(BridgeError::Configuration(msg.to_string()));

        if self.source.rpc_url.is_empty() {
            return invalid("source.rpc_url cannot be empty");
        }

        let key = self.source.private_key.trim_start_matches("0x");
        if key.len() != 64 || hex::decode(key).is_err() {
            return invalid("source.private_key must be 64 hex chars");
        }

        if self.deposits.required_confirmations == 0 {
            return invalid("REQUIRED_CONFIRMATIONS must be at least 1");
        }
        if self.deposits.poll_interval_ms == 0 {
            return invalid("DEPOSIT_POLL_INTERVAL_MS must be positive");
        }

        if self.fees.fee_rate == 0 {
            return invalid("FEE_RATE must be positive");
        }

        if self.settlement.token_address.len() != 42 || !self.settlement.token_address.starts_with("0x") {
            return invalid("settlement.token_address must be a valid hex address (42 chars with 0x prefix)");
        }

        if self.settlement.private_key.len() != 66 || !self.settlement.private_key.starts_with("0x") {
            return invalid("settlement.private_key must be 66 chars (0x + 64 hex chars)");
        }

        if self.resilience.breaker_threshold == 0 {
            return invalid("CIRCUIT_BREAKER_THRESHOLD must be at least 1");
        }
        if self.resilience.retry_max_attempts == 0 {
            return invalid("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.resilience.retry_initial_delay_ms > self.resilience.retry_max_delay_ms {
            return invalid("RETRY_INITIAL_DELAY_MS cannot exceed RETRY_MAX_DELAY_MS");
        }
        if self.resilience.rpc_timeout_ms == 0 {
            return invalid("RPC_TIMEOUT_MS must be positive");
        }

        if self.rate_limit.max_requests == 0 || self.rate_limit.burst == 0 {
            return invalid("rate limit counts must be positive");
        }

        if self.withdrawals.max_records == 0 {
            return invalid("WITHDRAWAL_MAX_RECORDS must be positive");
        }

        if self.api.admin_token.as_ref().is_some_and(|t| t.len() < 16) {
            return invalid("API_ADMIN_TOKEN must be at least 16 characters");
        }
        if self.api.signature_max_age_secs == 0 {
            return invalid("API_SIGNATURE_MAX_AGE_SECS must be positive");
        }

        Ok(())
    }

    pub fn source_rpc_config(&self) -> SourceRpcConfig {
        SourceRpcConfig {
            url: self.source.rpc_url.clone(),
            user: self.source.rpc_user.clone(),
            password: self.source.rpc_password.clone(),
            timeout: self.rpc_timeout(),
        }
    }

    pub fn settlement_client_config(&self) -> SettlementClientConfig {
        SettlementClientConfig {
            rpc_urls: self.settlement.all_rpc_urls(),
            chain_id: self.settlement.chain_id,
            token_address: self.settlement.token_address.clone(),
            private_key: self.settlement.private_key.clone(),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.resilience.rpc_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.resilience.retry_max_attempts,
            initial_delay: Duration::from_millis(self.resilience.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.resilience.retry_max_delay_ms),
            jitter_max: Duration::from_millis(self.resilience.retry_jitter_ms),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.resilience.breaker_threshold,
            reset_timeout: Duration::from_millis(self.resilience.breaker_reset_ms),
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.rate_limit.max_requests,
            window: Duration::from_millis(self.rate_limit.window_ms),
            burst: self.rate_limit.burst,
        }
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            fee_rate: self.fees.fee_rate,
            base_bytes: self.fees.base_bytes,
            bytes_per_input: self.fees.bytes_per_input,
            bytes_per_output: self.fees.bytes_per_output,
        }
    }

    pub fn service_config(&self) -> BridgeServiceConfig {
        BridgeServiceConfig {
            deposits: DepositMonitorConfig {
                network: self.source.network,
                required_confirmations: self.deposits.required_confirmations,
                poll_interval: Duration::from_millis(self.deposits.poll_interval_ms),
            },
            withdrawals: WithdrawalMonitorConfig {
                finality_blocks: self.settlement.finality_blocks,
                poll_interval: Duration::from_millis(self.settlement.poll_interval_ms),
                start_block: self.settlement.start_block,
                ..WithdrawalMonitorConfig::default()
            },
            ..BridgeServiceConfig::default()
        }
    }

    pub fn withdrawal_retention(&self) -> Duration {
        Duration::from_secs(self.withdrawals.retention_secs)
    }
}

/// Variable lookup with typed parsing
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, name: &str) -> BridgeResult<String> {
        (self.0)(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BridgeError::Configuration(format!("{} environment variable is required", name)))
    }

    fn required_parsed<T>(&self, name: &str) -> BridgeResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.required(name)?;
        raw.trim()
            .parse()
            .map_err(|e| BridgeError::Configuration(format!("{} is invalid: {}", name, e)))
    }

    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Missing means default; present but malformed is an error
    fn parsed<T>(&self, name: &str, default: T) -> BridgeResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match (self.0)(name) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map_err(|e| BridgeError::Configuration(format!("{} is invalid: {}", name, e))),
            _ => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("SOURCE_RPC_URL", "http://localhost:22555".to_string()),
            ("SOURCE_RPC_USER", "relay".to_string()),
            ("SOURCE_RPC_PASSWORD", "hunter2".to_string()),
            ("SOURCE_PRIVATE_KEY", "11".repeat(32)),
            (
                "SETTLEMENT_RPC_URL",
                "http://localhost:8545, http://localhost:8546".to_string(),
            ),
            ("SETTLEMENT_CHAIN_ID", "31337".to_string()),
            (
                "SETTLEMENT_TOKEN_ADDRESS",
                "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
            ),
            (
                "SETTLEMENT_PRIVATE_KEY",
                "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80".to_string(),
            ),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> BridgeResult<Config> {
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_vars()).unwrap();

        assert_eq!(config.source.network, Network::Mainnet);
        assert_eq!(config.deposits.required_confirmations, 6);
        assert_eq!(config.deposits.poll_interval_ms, 60_000);
        assert_eq!(config.deposits.dust_threshold, 546);
        assert_eq!(config.fee_policy(), FeePolicy::default());
        assert_eq!(config.settlement.finality_blocks, 1);
        assert_eq!(config.resilience.breaker_threshold, 5);
        assert_eq!(config.retry_config().max_retries, 3);
        assert_eq!(config.rate_limit.burst, 15);
        assert_eq!(config.withdrawals.max_records, 10_000);
        assert_eq!(config.api.bind_addr.port(), 9090);
        assert_eq!(config.api.admin_token, None);
        assert_eq!(config.api.signature_max_age_secs, 300);
    }

    #[test]
    fn test_admin_token() {
        let mut vars = base_vars();
        vars.insert("API_ADMIN_TOKEN", "short".to_string());
        assert!(matches!(load(&vars), Err(BridgeError::Configuration(_))));

        vars.insert("API_ADMIN_TOKEN", "operator-secret-0123".to_string());
        let config = load(&vars).unwrap();
        assert_eq!(config.api.admin_token.as_deref(), Some("operator-secret-0123"));
        assert!(!format!("{:?}", config).contains("operator-secret-0123"));
    }

    #[test]
    fn test_settlement_fallback_urls() {
        let config = load(&base_vars()).unwrap();
        assert_eq!(config.settlement.rpc_url, "http://localhost:8545");
        assert_eq!(
            config.settlement.all_rpc_urls(),
            vec!["http://localhost:8545", "http://localhost:8546"]
        );
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = base_vars();
        vars.remove("SETTLEMENT_TOKEN_ADDRESS");
        match load(&vars) {
            Err(BridgeError::Configuration(msg)) => assert!(msg.contains("SETTLEMENT_TOKEN_ADDRESS")),
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let mut vars = base_vars();
        vars.insert("REQUIRED_CONFIRMATIONS", "six".to_string());
        assert!(matches!(load(&vars), Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_keys() {
        let mut vars = base_vars();
        vars.insert("SOURCE_PRIVATE_KEY", "abcd".to_string());
        assert!(load(&vars).is_err());

        let mut vars = base_vars();
        vars.insert("SETTLEMENT_PRIVATE_KEY", "ac09".to_string());
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_network_override() {
        let mut vars = base_vars();
        vars.insert("SOURCE_NETWORK", "testnet".to_string());
        assert_eq!(load(&vars).unwrap().source.network, Network::Testnet);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = load(&base_vars()).unwrap();
        let printed = format!("{:?}", config);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains(&"11".repeat(32)));
        assert!(!printed.contains("ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"));
    }
}
