//! Synchronization layer configuration.

use std::time::Duration;

use ethers_core::types::{Address, U256};
use ethers_core::utils::parse_ether;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sepolia chain id.
pub const SEPOLIA_CHAIN_ID: u64 = 11_155_111;

/// Configuration errors, reported before anything connects.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("contract address is not configured")]
    MissingContract,

    #[error("chain id must be non-zero")]
    ZeroChainId,

    #[error("invalid stake amount `{0}`")]
    InvalidStake(String),
}

/// Native currency descriptor passed to `wallet_addEthereumChain`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// The one network this client is allowed to operate on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSpec {
    pub chain_id: u64,
    pub chain_name: String,
    pub rpc_urls: Vec<String>,
    pub native_currency: NativeCurrency,
    pub block_explorer_urls: Vec<String>,
}

impl ChainSpec {
    pub fn sepolia() -> Self {
        Self {
            chain_id: SEPOLIA_CHAIN_ID,
            chain_name: "Sepolia Testnet".to_string(),
            rpc_urls: vec!["https://sepolia.infura.io/v3/".to_string()],
            native_currency: NativeCurrency {
                name: "ETH".to_string(),
                symbol: "ETH".to_string(),
                decimals: 18,
            },
            block_explorer_urls: vec!["https://sepolia.etherscan.io".to_string()],
        }
    }

    /// Chain id as the `0x`-prefixed hex quantity used by the wallet RPCs.
    pub fn hex_chain_id(&self) -> String {
        format!("{:#x}", self.chain_id)
    }

    /// Parameters object for `wallet_addEthereumChain`.
    pub fn add_chain_params(&self) -> serde_json::Value {
        serde_json::json!({
            "chainId": self.hex_chain_id(),
            "chainName": self.chain_name,
            "rpcUrls": self.rpc_urls,
            "nativeCurrency": {
                "name": self.native_currency.name,
                "symbol": self.native_currency.symbol,
                "decimals": self.native_currency.decimals,
            },
            "blockExplorerUrls": self.block_explorer_urls,
        })
    }
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self::sepolia()
    }
}

/// Everything the session, gateway and store need to know up front.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Required network.
    pub chain: ChainSpec,
    /// Deployed StudyCommitment contract.
    pub contract_address: Address,
    /// Value attached to `createCommitment`, in ether.
    pub stake_ether: String,
    /// Confirmations to wait for before a mutation counts as complete.
    pub confirmations: usize,
    /// Upper bound on waiting for a receipt.
    pub confirm_timeout_secs: u64,
    /// How long the gate waits for a silent session resolution at startup.
    pub init_grace_ms: u64,
    /// Default commitment duration offered to the student.
    pub default_duration_hours: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chain: ChainSpec::sepolia(),
            contract_address: Address::zero(),
            stake_ether: "0.01".to_string(),
            confirmations: 1,
            confirm_timeout_secs: 180,
            init_grace_ms: 1_800,
            default_duration_hours: 24,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chain.chain_id == 0 {
            return Err(ConfigError::ZeroChainId);
        }
        if self.contract_address.is_zero() {
            return Err(ConfigError::MissingContract);
        }
        self.stake_wei()?;
        Ok(())
    }

    /// Stake in wei. Zero and unparseable amounts are rejected.
    pub fn stake_wei(&self) -> Result<U256, ConfigError> {
        let wei = parse_ether(self.stake_ether.trim())
            .map_err(|_| ConfigError::InvalidStake(self.stake_ether.clone()))?;
        if wei.is_zero() {
            return Err(ConfigError::InvalidStake(self.stake_ether.clone()));
        }
        Ok(wei)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn init_grace(&self) -> Duration {
        Duration::from_millis(self.init_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sepolia_hex_chain_id() {
        assert_eq!(ChainSpec::sepolia().hex_chain_id(), "0xaa36a7");
    }

    #[test]
    fn add_chain_params_shape() {
        let params = ChainSpec::sepolia().add_chain_params();
        assert_eq!(params["chainId"], "0xaa36a7");
        assert_eq!(params["chainName"], "Sepolia Testnet");
        assert_eq!(params["nativeCurrency"]["decimals"], 18);
    }

    #[test]
    fn default_stake_is_a_hundredth_of_an_ether() {
        let config = SyncConfig::default();
        assert_eq!(config.stake_wei().unwrap(), U256::exp10(16));
    }

    #[test]
    fn validate_rejects_missing_contract_and_bad_stake() {
        let config = SyncConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingContract)));

        let config = SyncConfig {
            contract_address: Address::from_low_u64_be(0xc0de),
            stake_ether: "0".into(),
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidStake(_))));

        let config = SyncConfig {
            contract_address: Address::from_low_u64_be(0xc0de),
            stake_ether: "lots".into(),
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidStake(_))));

        let config = SyncConfig {
            contract_address: Address::from_low_u64_be(0xc0de),
            ..SyncConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserializes_partial_config_over_defaults() {
        let config: SyncConfig = serde_json::from_value(serde_json::json!({
            "contract_address": "0x000000000000000000000000000000000000c0de",
            "confirmations": 2
        }))
        .unwrap();
        assert_eq!(config.confirmations, 2);
        assert_eq!(config.chain.chain_id, SEPOLIA_CHAIN_ID);
        assert_eq!(config.init_grace().as_millis(), 1_800);
    }
}
