//! Configuration for the bridge
//!
//! Two JSON files: a credential vault and the bridge configuration.
//! File paths come from environment variables (dotenv-compatible) with
//! defaults under `config/`.

use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

use crate::error::{BridgeError, Result};
use crate::types::TickerId;

pub const DEFAULT_VAULT_PATH: &str = "config/vault.json";
pub const DEFAULT_CONFIG_PATH: &str = "config/bridge.json";

/// API credentials loaded from the vault file.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    #[serde(default = "default_true")]
    pub use_testnet: bool,
}

#[derive(Debug, Deserialize)]
struct VaultFile {
    binance_testnet: Credentials,
}

impl Credentials {
    /// Load credentials from the protected vault file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            BridgeError::CredentialsMissing(format!("cannot read {}: {e}", path.display()))
        })?;
        let vault: VaultFile = serde_json::from_str(&raw).map_err(|e| {
            BridgeError::CredentialsMissing(format!("malformed vault {}: {e}", path.display()))
        })?;
        let creds = vault.binance_testnet;
        if creds.api_key.is_empty() || creds.secret_key.is_empty() {
            return Err(BridgeError::CredentialsMissing(
                "api_key or secret_key empty".to_string(),
            ));
        }
        Ok(creds)
    }
}

/// Per-symbol configuration: the ticker mapping plus conservative local
/// bounds used before `exchangeInfo` has been fetched, and the safe
/// testnet order sizes.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerConfig {
    pub ticker_id: TickerId,
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub price_precision: u32,
    pub qty_precision: u32,
    pub test_price: f64,
    pub test_qty: f64,
}

/// Order-gateway settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    pub client_id: u32,
    #[serde(default)]
    pub recv_window_ms: u64,
}

/// Cache lifetimes, in minutes.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_symbol_info_minutes")]
    pub symbol_info_minutes: u64,
    #[serde(default = "default_account_info_minutes")]
    pub account_info_minutes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            symbol_info_minutes: default_symbol_info_minutes(),
            account_info_minutes: default_account_info_minutes(),
        }
    }
}

/// Bridge configuration, `binance` key of the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_true")]
    pub use_testnet: bool,
    pub tickers: Vec<TickerConfig>,
    pub order_gateway: GatewaySettings,
    #[serde(default)]
    pub cache_settings: CacheSettings,
    #[serde(default = "default_depth_limit")]
    pub depth_limit: u32,
    /// 0 means reconnect forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    binance: BridgeConfig,
}

impl BridgeConfig {
    /// Load the bridge configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            BridgeError::Protocol(format!("cannot read config {}: {e}", path.display()))
        })?;
        let file: ConfigFile = serde_json::from_str(&raw)?;
        if file.binance.tickers.is_empty() {
            return Err(BridgeError::Protocol("no tickers configured".to_string()));
        }
        Ok(file.binance)
    }

    /// Resolve config paths from the environment and load both files.
    pub fn from_env() -> Result<(Self, Credentials)> {
        dotenvy::dotenv().ok();
        let config_path =
            env::var("BRIDGE_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let vault_path =
            env::var("BRIDGE_VAULT_PATH").unwrap_or_else(|_| DEFAULT_VAULT_PATH.to_string());
        let config = Self::load(config_path)?;
        let creds = Credentials::load(vault_path)?;
        Ok((config, creds))
    }

    /// REST base URL for the configured environment.
    pub fn rest_base(&self) -> &'static str {
        if self.use_testnet {
            "https://testnet.binance.vision"
        } else {
            "https://api.binance.com"
        }
    }

    /// WebSocket base URL for the configured environment.
    pub fn ws_base(&self) -> &'static str {
        if self.use_testnet {
            "wss://stream.testnet.binance.vision"
        } else {
            "wss://stream.binance.com:9443"
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        self.tickers.iter().map(|t| t.symbol.clone()).collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_symbol_info_minutes() -> u64 {
    60
}

fn default_account_info_minutes() -> u64 {
    5
}

fn default_depth_limit() -> u32 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_snapshot_interval_secs() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_CONFIG: &str = r#"{
        "binance": {
            "use_testnet": true,
            "tickers": [
                {
                    "ticker_id": 1,
                    "symbol": "BTCUSDT",
                    "base_asset": "BTC",
                    "quote_asset": "USDT",
                    "min_qty": 0.00001,
                    "max_qty": 9000.0,
                    "step_size": 0.00001,
                    "min_notional": 5.0,
                    "price_precision": 2,
                    "qty_precision": 5,
                    "test_price": 100000.0,
                    "test_qty": 0.001
                }
            ],
            "order_gateway": { "client_id": 1 },
            "cache_settings": { "symbol_info_minutes": 60, "account_info_minutes": 5 }
        }
    }"#;

    #[test]
    fn test_load_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_CONFIG.as_bytes()).unwrap();
        let config = BridgeConfig::load(file.path()).unwrap();
        assert!(config.use_testnet);
        assert_eq!(config.tickers.len(), 1);
        assert_eq!(config.tickers[0].symbol, "BTCUSDT");
        assert_eq!(config.order_gateway.client_id, 1);
        // Defaults kick in for omitted keys.
        assert_eq!(config.depth_limit, 1000);
        assert_eq!(config.snapshot_interval_secs, 30);
        assert_eq!(config.rest_base(), "https://testnet.binance.vision");
        assert_eq!(config.ws_base(), "wss://stream.testnet.binance.vision");
    }

    #[test]
    fn test_load_credentials() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"{"binance_testnet": {"api_key": "k", "secret_key": "s", "use_testnet": true}}"#,
        )
        .unwrap();
        let creds = Credentials::load(file.path()).unwrap();
        assert_eq!(creds.api_key, "k");
        assert!(creds.use_testnet);
    }

    #[test]
    fn test_missing_credentials() {
        let err = Credentials::load("/nonexistent/vault.json").unwrap_err();
        assert!(matches!(err, BridgeError::CredentialsMissing(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"binance_testnet": {"api_key": "", "secret_key": ""}}"#)
            .unwrap();
        let err = Credentials::load(file.path()).unwrap_err();
        assert!(matches!(err, BridgeError::CredentialsMissing(_)));
    }
}
