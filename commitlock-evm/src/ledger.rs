//! Commitment contract backend over a JSON-RPC node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commitlock_core::{CallError, LedgerBackend, LedgerCall, RawCommitment, TxReceipt};
use ethers::abi::{Abi, Detokenize, Tokenize};
use ethers::contract::{Contract, ContractCall};
use ethers::prelude::*;
use tracing::debug;

use crate::error::{abi_error, contract_error, middleware_error, EvmError};

/// Signing client used for every contract interaction.
pub type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Subset of the StudyCommitment ABI this client uses.
pub const COMMITMENT_ABI: &str = r#"[
  {"type":"function","name":"createCommitment","stateMutability":"payable",
   "inputs":[{"name":"_goal","type":"string"},{"name":"_verifier","type":"address"},{"name":"_durationSeconds","type":"uint256"}],
   "outputs":[]},
  {"type":"function","name":"submitProof","stateMutability":"nonpayable",
   "inputs":[{"name":"_id","type":"uint256"},{"name":"_proof","type":"string"}],
   "outputs":[]},
  {"type":"function","name":"verifyCommitment","stateMutability":"nonpayable",
   "inputs":[{"name":"_id","type":"uint256"},{"name":"_approved","type":"bool"}],
   "outputs":[]},
  {"type":"function","name":"withdrawPending","stateMutability":"nonpayable",
   "inputs":[],"outputs":[]},
  {"type":"function","name":"commitmentCount","stateMutability":"view",
   "inputs":[],"outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"getCommitment","stateMutability":"view",
   "inputs":[{"name":"_id","type":"uint256"}],
   "outputs":[{"name":"","type":"tuple","components":[
     {"name":"student","type":"address"},{"name":"verifier","type":"address"},
     {"name":"goal","type":"string"},{"name":"proof","type":"string"},
     {"name":"stake","type":"uint256"},{"name":"deadline","type":"uint256"},
     {"name":"status","type":"uint8"}]}]},
  {"type":"function","name":"pendingWithdrawals","stateMutability":"view",
   "inputs":[{"name":"","type":"address"}],"outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"owner","stateMutability":"view",
   "inputs":[],"outputs":[{"name":"","type":"address"}]},
  {"type":"function","name":"MIN_DURATION","stateMutability":"view",
   "inputs":[],"outputs":[{"name":"","type":"uint256"}]},
  {"type":"function","name":"MAX_DURATION","stateMutability":"view",
   "inputs":[],"outputs":[{"name":"","type":"uint256"}]}
]"#;

type CommitmentTuple = (Address, Address, String, String, U256, U256, u8);

/// [`LedgerBackend`] for one deployed StudyCommitment contract.
pub struct EthersLedger {
    client: Arc<Client>,
    contract: Contract<Client>,
    address: Address,
    /// `false` when no key was configured; the client then signs with a throwaway key and
    /// reports no signer.
    can_sign: bool,
    poll_interval: Duration,
}

impl EthersLedger {
    pub fn new(
        rpc_url: &str,
        private_key: Option<&str>,
        chain_id: u64,
        address: Address,
    ) -> Result<Self, EvmError> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| EvmError::InvalidRpcUrl {
            url: rpc_url.to_string(),
            reason: e.to_string(),
        })?;

        let (wallet, can_sign) = match private_key {
            Some(key) => (
                key.trim()
                    .parse::<LocalWallet>()
                    .map_err(|_| EvmError::InvalidKey)?,
                true,
            ),
            None => (LocalWallet::new(&mut rand::thread_rng()), false),
        };
        let wallet = wallet.with_chain_id(chain_id);

        let client = Arc::new(SignerMiddleware::new(provider, wallet));
        let abi: Abi = serde_json::from_str(COMMITMENT_ABI)?;
        let contract = Contract::new(address, abi, Arc::clone(&client));

        Ok(Self {
            client,
            contract,
            address,
            can_sign,
            poll_interval: Duration::from_secs(4),
        })
    }

    /// Receipt polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn call<T, D>(&self, name: &str, args: T) -> Result<ContractCall<Client, D>, CallError>
    where
        T: Tokenize,
        D: Detokenize,
    {
        self.contract.method::<T, D>(name, args).map_err(abi_error)
    }

    async fn view<T, D>(&self, name: &str, args: T) -> Result<D, CallError>
    where
        T: Tokenize + Send,
        D: Detokenize + Send,
    {
        self.call::<T, D>(name, args)?
            .call()
            .await
            .map_err(contract_error)
    }
}

#[async_trait]
impl LedgerBackend for EthersLedger {
    fn contract_address(&self) -> Address {
        self.address
    }

    async fn chain_id(&self) -> Result<u64, CallError> {
        let chain_id = self.client.get_chainid().await.map_err(middleware_error)?;
        Ok(chain_id.low_u64())
    }

    async fn contract_code(&self) -> Result<Vec<u8>, CallError> {
        let code = self
            .client
            .get_code(self.address, None)
            .await
            .map_err(middleware_error)?;
        Ok(code.to_vec())
    }

    async fn signer(&self) -> Result<Option<Address>, CallError> {
        Ok(self.can_sign.then(|| self.client.address()))
    }

    async fn send(&self, call: &LedgerCall) -> Result<H256, CallError> {
        let tx: ContractCall<Client, ()> = match call {
            LedgerCall::CreateCommitment {
                goal,
                verifier,
                duration_secs,
                value,
            } => self
                .call(
                    call.method(),
                    (goal.clone(), *verifier, U256::from(*duration_secs)),
                )?
                .value(*value),
            LedgerCall::SubmitProof { id, proof } => {
                self.call(call.method(), (U256::from(*id), proof.clone()))?
            }
            LedgerCall::VerifyCommitment { id, approved } => {
                self.call(call.method(), (U256::from(*id), *approved))?
            }
            LedgerCall::WithdrawPending => self.call(call.method(), ())?,
        };

        debug!(method = call.method(), contract = ?self.address, "sending transaction");
        let pending = tx.send().await.map_err(contract_error)?;
        Ok(pending.tx_hash())
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: usize,
    ) -> Result<Option<TxReceipt>, CallError> {
        let receipt = PendingTransaction::new(tx_hash, self.client.provider())
            .interval(self.poll_interval)
            .confirmations(confirmations)
            .await
            .map_err(middleware_error)?;

        Ok(receipt.map(|r| TxReceipt {
            tx_hash: r.transaction_hash,
            block_number: r.block_number.map(|b| b.as_u64()),
            success: r.status == Some(U64::from(1u64)),
        }))
    }

    async fn commitment_count(&self) -> Result<U256, CallError> {
        self.view::<_, U256>("commitmentCount", ()).await
    }

    async fn get_commitment(&self, id: u64) -> Result<RawCommitment, CallError> {
        let (student, verifier, goal, proof, stake, deadline, status) = self
            .view::<_, CommitmentTuple>("getCommitment", U256::from(id))
            .await?;
        Ok(RawCommitment {
            student,
            verifier,
            goal,
            proof,
            stake,
            deadline,
            status,
        })
    }

    async fn pending_withdrawals(&self, owner: Address) -> Result<U256, CallError> {
        self.view::<_, U256>("pendingWithdrawals", owner).await
    }

    async fn owner(&self) -> Result<Address, CallError> {
        self.view::<_, Address>("owner", ()).await
    }

    async fn duration_bounds(&self) -> Result<(U256, U256), CallError> {
        let min = self.view::<_, U256>("MIN_DURATION", ()).await?;
        let max = self.view::<_, U256>("MAX_DURATION", ()).await?;
        Ok((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn contract() -> Address {
        "0x5fbdb2315678afecb367f032d93f642f64180aa3".parse().unwrap()
    }

    #[test]
    fn embedded_abi_exposes_every_used_method() {
        let abi: Abi = serde_json::from_str(COMMITMENT_ABI).unwrap();
        for name in [
            "createCommitment",
            "submitProof",
            "verifyCommitment",
            "withdrawPending",
            "commitmentCount",
            "getCommitment",
            "pendingWithdrawals",
            "owner",
            "MIN_DURATION",
            "MAX_DURATION",
        ] {
            assert!(abi.function(name).is_ok(), "missing {name}");
        }
        assert_eq!(
            abi.function("createCommitment").unwrap().state_mutability,
            ethers::abi::StateMutability::Payable
        );
    }

    #[tokio::test]
    async fn keyless_backend_reports_no_signer() {
        let ledger = EthersLedger::new("http://127.0.0.1:8545", None, 11_155_111, contract()).unwrap();
        assert_eq!(ledger.signer().await.unwrap(), None);
        assert_eq!(ledger.contract_address(), contract());
    }

    #[tokio::test]
    async fn keyed_backend_signs_as_the_key_owner() {
        let ledger =
            EthersLedger::new("http://127.0.0.1:8545", Some(KEY), 11_155_111, contract()).unwrap();
        let expected: Address = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".parse().unwrap();
        assert_eq!(ledger.signer().await.unwrap(), Some(expected));
    }

    #[test]
    fn bad_inputs_are_rejected() {
        assert!(matches!(
            EthersLedger::new("not a url", None, 1, contract()),
            Err(EvmError::InvalidRpcUrl { .. })
        ));
        assert!(matches!(
            EthersLedger::new("http://127.0.0.1:8545", Some("0xnope"), 1, contract()),
            Err(EvmError::InvalidKey)
        ));
    }
}
