//! Environment-based configuration.
//!
//! All sensitive values (RPC credentials, the rollup signing key, the custody
//! API key) must come from environment variables; nothing is hardcoded.
//!
//! # Variables
//!
//! ## Network
//! - `BRIDGE_NETWORK` - "mainnet", "testnet" or "regtest" (default: "testnet")
//! - `BRIDGE_DB_PATH` - SQLite database path (default: "data/bridge.db")
//! - `BRIDGE_HTTP_PORT` - notification gateway port (default: 8080)
//!
//! ## L1
//! - `BRIDGE_LISTEN_ADDRESS` - deposit sink address (required)
//! - `BRIDGE_BTC_RPC_URL` / `BRIDGE_BTC_RPC_USER` / `BRIDGE_BTC_RPC_PASS`
//! - `BRIDGE_BTC_CONFIRMATIONS` - deposit confirmation depth (default: 6)
//!
//! ## L2
//! - `BRIDGE_ROLLUP_RPC_URL` - rollup JSON-RPC endpoint
//! - `BRIDGE_CONTRACT_ADDRESS` - bridge contract (required)
//! - `BRIDGE_PRIV_KEY` - hex-encoded rollup signing key (required)
//! - `BRIDGE_GAS_PRICE_MULTIPLE` - replacement gas-price factor (default: 0 = off)
//! - `BRIDGE_ENABLE_EOA_TRANSFER` - "1" enables the EOA fallback path
//!
//! ## External services
//! - `BRIDGE_AA_PUBKEY_API` - address-translation service base URL
//! - `BRIDGE_AA_ACCOUNT_API` - smart-account derivation service base URL
//! - `BRIDGE_CUSTODY_API` / `BRIDGE_CUSTODY_API_KEY` - UTXO lookup endpoint
//! - `BRIDGE_COORDINATOR_API` - signing coordinator base URL
//!
//! ## Withdraw construction
//! - `BRIDGE_WITHDRAW_FEE` - flat L1 fee in satoshis (default: 3000)
//! - `BRIDGE_MULTISIG_PUBKEYS` - comma-separated compressed pubkeys (hex)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(ConfigError::InvalidValue(
                "BRIDGE_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub db_path: String,
    pub http_port: u16,
    pub log_level: String,
    pub log_json: bool,

    /// L1 deposit sink and withdraw change address.
    pub listen_address: String,
    pub btc_rpc_url: String,
    pub btc_rpc_user: String,
    pub btc_rpc_pass: String,
    /// Confirmation depth required before a deposit is dispatched.
    pub btc_confirmations: u64,

    pub rollup_rpc_url: String,
    pub contract_address: String,
    pub bridge_priv_key: String,
    /// Gas price factor applied when replacing a stuck transaction. Zero
    /// disables bumping.
    pub gas_price_multiple: u128,
    pub enable_eoa_transfer: bool,

    pub aa_pubkey_api: String,
    pub aa_account_api: String,
    pub custody_api: String,
    pub custody_api_key: String,
    pub coordinator_api: String,

    /// Flat L1 fee reserved when constructing a withdraw batch.
    pub withdraw_fee: i64,
    /// Compressed public keys backing the 2-of-N multisig witness script.
    pub multisig_pubkeys: Vec<String>,

    pub batch_limit: u32,
    pub deposit_tick_secs: u64,
    pub deposit_pause_secs: u64,
    pub deposit_backoff_secs: u64,
    pub wait_mined_timeout_secs: u64,
    pub indexer_tick_secs: u64,
    pub withdraw_tick_secs: u64,
    pub confirm_tick_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("BRIDGE_NETWORK")
            .unwrap_or_else(|_| "testnet".to_string())
            .parse()?;

        let listen_address = required("BRIDGE_LISTEN_ADDRESS")?;
        let contract_address = required("BRIDGE_CONTRACT_ADDRESS")?;
        let bridge_priv_key = required("BRIDGE_PRIV_KEY")?;

        let multisig_pubkeys: Vec<String> = env::var("BRIDGE_MULTISIG_PUBKEYS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            network,
            db_path: env::var("BRIDGE_DB_PATH").unwrap_or_else(|_| "data/bridge.db".to_string()),
            http_port: parsed("BRIDGE_HTTP_PORT", 8080)?,
            log_level: env::var("BRIDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("BRIDGE_LOG_JSON").map(|v| v == "1").unwrap_or(false),
            listen_address,
            btc_rpc_url: env::var("BRIDGE_BTC_RPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:18332".to_string()),
            btc_rpc_user: env::var("BRIDGE_BTC_RPC_USER").unwrap_or_default(),
            btc_rpc_pass: env::var("BRIDGE_BTC_RPC_PASS").unwrap_or_default(),
            btc_confirmations: parsed("BRIDGE_BTC_CONFIRMATIONS", 6)?,
            rollup_rpc_url: env::var("BRIDGE_ROLLUP_RPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8545".to_string()),
            contract_address,
            bridge_priv_key,
            gas_price_multiple: parsed("BRIDGE_GAS_PRICE_MULTIPLE", 0)?,
            enable_eoa_transfer: env::var("BRIDGE_ENABLE_EOA_TRANSFER")
                .map(|v| v == "1")
                .unwrap_or(false),
            aa_pubkey_api: env::var("BRIDGE_AA_PUBKEY_API").unwrap_or_default(),
            aa_account_api: env::var("BRIDGE_AA_ACCOUNT_API").unwrap_or_default(),
            custody_api: env::var("BRIDGE_CUSTODY_API").unwrap_or_default(),
            custody_api_key: env::var("BRIDGE_CUSTODY_API_KEY").unwrap_or_default(),
            coordinator_api: env::var("BRIDGE_COORDINATOR_API").unwrap_or_default(),
            withdraw_fee: parsed("BRIDGE_WITHDRAW_FEE", 3000)?,
            multisig_pubkeys,
            batch_limit: parsed("BRIDGE_BATCH_LIMIT", 100)?,
            deposit_tick_secs: parsed("BRIDGE_DEPOSIT_TICK_SECS", 10)?,
            deposit_pause_secs: parsed("BRIDGE_DEPOSIT_PAUSE_SECS", 1)?,
            deposit_backoff_secs: parsed("BRIDGE_DEPOSIT_BACKOFF_SECS", 600)?,
            wait_mined_timeout_secs: parsed("BRIDGE_WAIT_MINED_TIMEOUT_SECS", 7200)?,
            indexer_tick_secs: parsed("BRIDGE_INDEXER_TICK_SECS", 60)?,
            withdraw_tick_secs: parsed("BRIDGE_WITHDRAW_TICK_SECS", 10)?,
            confirm_tick_secs: parsed("BRIDGE_CONFIRM_TICK_SECS", 300)?,
        })
    }

    pub fn deposit_tick(&self) -> Duration {
        Duration::from_secs(self.deposit_tick_secs)
    }

    pub fn deposit_pause(&self) -> Duration {
        Duration::from_secs(self.deposit_pause_secs)
    }

    pub fn deposit_backoff(&self) -> Duration {
        Duration::from_secs(self.deposit_backoff_secs)
    }

    pub fn wait_mined_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_mined_timeout_secs)
    }

    pub fn indexer_tick(&self) -> Duration {
        Duration::from_secs(self.indexer_tick_secs)
    }

    pub fn withdraw_tick(&self) -> Duration {
        Duration::from_secs(self.withdraw_tick_secs)
    }

    pub fn confirm_tick(&self) -> Duration {
        Duration::from_secs(self.confirm_tick_secs)
    }

    /// Validate settings the workers cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multisig_pubkeys.len() < 2 {
            return Err(ConfigError::InvalidValue(
                "BRIDGE_MULTISIG_PUBKEYS".to_string(),
                "at least two co-signer public keys required".to_string(),
            ));
        }
        if self.withdraw_fee < 0 {
            return Err(ConfigError::InvalidValue(
                "BRIDGE_WITHDRAW_FEE".to_string(),
                "fee must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

fn required(var: &str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
}

fn parsed<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(var.to_string(), v)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("testnet".parse::<Network>(), Ok(Network::Testnet)));
        assert!(matches!("regtest".parse::<Network>(), Ok(Network::Regtest)));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn test_validate_requires_cosigners() {
        let mut config = crate::testutil::test_config();
        config.multisig_pubkeys = vec!["02aa".to_string()];
        assert!(config.validate().is_err());

        config.multisig_pubkeys = vec!["02aa".to_string(), "03bb".to_string()];
        assert!(config.validate().is_ok());
    }
}
