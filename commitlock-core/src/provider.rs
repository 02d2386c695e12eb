//! The injected wallet provider capability.

use async_trait::async_trait;
use ethers_core::types::{Address, U256};
use tokio::sync::broadcast;

use crate::config::ChainSpec;
use crate::error::CallError;

/// Notifications a wallet may push at any time, outside of any user action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The set of exposed accounts changed. Empty means the wallet was locked or disconnected.
    AccountsChanged(Vec<Address>),
    /// The wallet moved to another network.
    ChainChanged(u64),
}

/// EIP-1193 style wallet: account access, network management and balances.
///
/// A browser extension, a hardware bridge and a JSON-RPC node with a local key all fit
/// behind this trait; [`crate::wallet::WalletSession`] is its only consumer.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// `eth_requestAccounts`: may prompt the user.
    async fn request_accounts(&self) -> Result<Vec<Address>, CallError>;

    /// `eth_accounts`: never prompts; empty until access was granted.
    async fn accounts(&self) -> Result<Vec<Address>, CallError>;

    /// `eth_chainId`.
    async fn chain_id(&self) -> Result<u64, CallError>;

    /// `wallet_switchEthereumChain`.
    async fn switch_chain(&self, chain_id: u64) -> Result<(), CallError>;

    /// `wallet_addEthereumChain`.
    async fn add_chain(&self, chain: &ChainSpec) -> Result<(), CallError>;

    /// `eth_getBalance` at the latest block.
    async fn balance(&self, address: Address) -> Result<U256, CallError>;

    /// Subscribe to account/chain notifications.
    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;
}
