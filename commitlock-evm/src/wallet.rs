//! Wallet provider for headless hosts: a JSON-RPC node plus an optional local key.
//!
//! A node endpoint serves exactly one network, so switching answers `4902` whenever the
//! endpoint is on another chain and adding networks is unsupported. Chain changes are detected
//! by polling `eth_chainId`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use commitlock_core::{rpc_codes, CallError, ChainSpec, ProviderEvent, WalletProvider};
use ethers::prelude::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{middleware_error, EvmError};

pub struct RpcWalletProvider {
    provider: Provider<Http>,
    wallet: Option<LocalWallet>,
    events: broadcast::Sender<ProviderEvent>,
}

impl RpcWalletProvider {
    pub fn new(rpc_url: &str, private_key: Option<&str>) -> Result<Self, EvmError> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| EvmError::InvalidRpcUrl {
            url: rpc_url.to_string(),
            reason: e.to_string(),
        })?;
        let wallet = private_key
            .map(|key| key.trim().parse::<LocalWallet>())
            .transpose()
            .map_err(|_| EvmError::InvalidKey)?;
        let (events, _) = broadcast::channel(16);

        Ok(Self {
            provider,
            wallet,
            events,
        })
    }

    /// Account transactions are signed with, if a key was configured.
    pub fn address(&self) -> Option<Address> {
        self.wallet.as_ref().map(Signer::address)
    }

    /// Poll `eth_chainId` and publish [`ProviderEvent::ChainChanged`] when it moves.
    pub fn watch_chain(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let provider: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            let mut last: Option<u64> = None;
            loop {
                ticker.tick().await;
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                match provider.chain_id().await {
                    Ok(chain_id) => {
                        if last.is_some_and(|prev| prev != chain_id) {
                            info!(chain_id, "endpoint switched networks");
                            let _ = provider.events.send(ProviderEvent::ChainChanged(chain_id));
                        }
                        last = Some(chain_id);
                    }
                    Err(err) => warn!(error = %err, "chain id poll failed"),
                }
            }
        })
    }
}

#[async_trait]
impl WalletProvider for RpcWalletProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, CallError> {
        match self.address() {
            Some(address) => Ok(vec![address]),
            None => Err(CallError::rpc(
                rpc_codes::UNAUTHORIZED,
                "no private key configured for this endpoint",
            )),
        }
    }

    async fn accounts(&self) -> Result<Vec<Address>, CallError> {
        Ok(self.address().into_iter().collect())
    }

    async fn chain_id(&self) -> Result<u64, CallError> {
        let chain_id = self
            .provider
            .get_chainid()
            .await
            .map_err(middleware_error)?;
        Ok(chain_id.low_u64())
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<(), CallError> {
        let actual = self.chain_id().await?;
        if actual == chain_id {
            return Ok(());
        }
        Err(CallError::rpc(
            rpc_codes::UNRECOGNIZED_CHAIN,
            format!("endpoint serves chain {actual}, not {chain_id}"),
        ))
    }

    async fn add_chain(&self, chain: &ChainSpec) -> Result<(), CallError> {
        Err(CallError::rpc(
            rpc_codes::UNSUPPORTED_METHOD,
            format!(
                "cannot add {} to a node endpoint; point the wallet RPC url at it instead",
                chain.chain_name
            ),
        ))
    }

    async fn balance(&self, address: Address) -> Result<U256, CallError> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(middleware_error)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }
}
