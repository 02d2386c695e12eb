//! CLI configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional `commitlock.toml`, then
//! `COMMITLOCK__*` environment variables (`COMMITLOCK__SYNC__CONTRACT_ADDRESS`,
//! `COMMITLOCK__WALLET__RPC_URL`, ...).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use commitlock_core::SyncConfig;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "commitlock.toml";

/// Signing wallet for headless use.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WalletSettings {
    /// JSON-RPC endpoint of the required network.
    pub rpc_url: String,
    /// Hex-encoded secp256k1 key. Without it the CLI is read-only.
    pub private_key: Option<String>,
    /// How often `watch` polls the endpoint for a network change.
    pub poll_interval_secs: u64,
}

impl Default for WalletSettings {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            private_key: None,
            poll_interval_secs: 4,
        }
    }
}

impl WalletSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub sync: SyncConfig,
    pub wallet: WalletSettings,
}

impl CliConfig {
    /// Load from `path` (or [`DEFAULT_CONFIG_FILE`] if present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("COMMITLOCK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: CliConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config
            .sync
            .validate()
            .context("Invalid synchronization settings")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> CliConfig {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn empty_file_yields_sepolia_defaults() {
        let config = from_toml("");
        assert_eq!(config.sync.chain.chain_id, 11_155_111);
        assert_eq!(config.sync.stake_ether, "0.01");
        assert_eq!(config.sync.default_duration_hours, 24);
        assert_eq!(config.wallet.rpc_url, "http://127.0.0.1:8545");
        assert!(config.wallet.private_key.is_none());
        assert!(config.sync.validate().is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let config = from_toml(
            r#"
            [sync]
            contract_address = "0x5fbdb2315678afecb367f032d93f642f64180aa3"
            confirmations = 3

            [wallet]
            rpc_url = "https://rpc.sepolia.org"
            poll_interval_secs = 0
            "#,
        );
        assert!(config.sync.validate().is_ok());
        assert_eq!(config.sync.confirmations, 3);
        assert_eq!(config.wallet.rpc_url, "https://rpc.sepolia.org");
        assert_eq!(config.wallet.poll_interval(), Duration::from_secs(1));
    }
}
