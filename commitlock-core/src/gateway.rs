//! Ledger gateway: the only component that talks to the commitment contract.
//!
//! [`LedgerGateway::handle`] performs the preflight (network, deployed code, signer) and hands
//! out a [`ContractHandle`]. Mutations on the handle are two-phase: submit, then wait for the
//! receipt. Nothing here retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::{Address, H256, U256};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{ConfigError, SyncConfig};
use crate::error::CallError;
use crate::types::{Commitment, DurationBounds, PendingWithdrawal, RawCommitment};

/// State-changing contract calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerCall {
    /// `createCommitment(goal, verifier, durationSeconds)`, payable.
    CreateCommitment {
        goal: String,
        verifier: Address,
        duration_secs: u64,
        value: U256,
    },
    /// `submitProof(id, proof)`.
    SubmitProof { id: u64, proof: String },
    /// `verifyCommitment(id, approved)`.
    VerifyCommitment { id: u64, approved: bool },
    /// `withdrawPending()`.
    WithdrawPending,
}

impl LedgerCall {
    pub fn method(&self) -> &'static str {
        match self {
            LedgerCall::CreateCommitment { .. } => "createCommitment",
            LedgerCall::SubmitProof { .. } => "submitProof",
            LedgerCall::VerifyCommitment { .. } => "verifyCommitment",
            LedgerCall::WithdrawPending => "withdrawPending",
        }
    }
}

/// Receipt of an included transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    /// `status == 1`.
    pub success: bool,
}

/// Raw RPC surface of one deployed commitment contract.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Address the backend is bound to.
    fn contract_address(&self) -> Address;

    async fn chain_id(&self) -> Result<u64, CallError>;

    /// Deployed bytecode at [`Self::contract_address`].
    async fn contract_code(&self) -> Result<Vec<u8>, CallError>;

    /// Account transactions will be signed with, if any.
    async fn signer(&self) -> Result<Option<Address>, CallError>;

    /// Broadcast a transaction; returns once the node accepted it.
    async fn send(&self, call: &LedgerCall) -> Result<H256, CallError>;

    /// Wait for inclusion. `Ok(None)` means the transaction was dropped.
    async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        confirmations: usize,
    ) -> Result<Option<TxReceipt>, CallError>;

    async fn commitment_count(&self) -> Result<U256, CallError>;

    async fn get_commitment(&self, id: u64) -> Result<RawCommitment, CallError>;

    async fn pending_withdrawals(&self, owner: Address) -> Result<U256, CallError>;

    async fn owner(&self) -> Result<Address, CallError>;

    /// `(MIN_DURATION, MAX_DURATION)` in seconds.
    async fn duration_bounds(&self) -> Result<(U256, U256), CallError>;
}

/// Typed, preflighted access to the commitment contract.
pub struct LedgerGateway {
    backend: Arc<dyn LedgerBackend>,
    required_chain: u64,
    stake: U256,
    confirmations: usize,
    confirm_timeout: Duration,
}

impl LedgerGateway {
    pub fn new(backend: Arc<dyn LedgerBackend>, config: &SyncConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            backend,
            required_chain: config.chain.chain_id,
            stake: config.stake_wei()?,
            confirmations: config.confirmations,
            confirm_timeout: config.confirm_timeout(),
        })
    }

    /// Fixed value attached to `createCommitment`.
    pub fn stake(&self) -> U256 {
        self.stake
    }

    pub fn contract_address(&self) -> Address {
        self.backend.contract_address()
    }

    /// Confirm network and deployed code, then bind the current signer.
    pub async fn handle(&self) -> Result<ContractHandle<'_>, CallError> {
        let actual = self.backend.chain_id().await?;
        if actual != self.required_chain {
            return Err(CallError::WrongChain {
                expected: self.required_chain,
                actual,
            });
        }

        let code = self.backend.contract_code().await?;
        if code.is_empty() {
            return Err(CallError::EmptyCode {
                address: self.backend.contract_address(),
            });
        }

        let signer = self.backend.signer().await?.ok_or(CallError::NoSigner)?;
        Ok(ContractHandle {
            gateway: self,
            signer,
        })
    }
}

/// Signer-bound contract handle.
pub struct ContractHandle<'g> {
    gateway: &'g LedgerGateway,
    signer: Address,
}

impl ContractHandle<'_> {
    pub fn signer(&self) -> Address {
        self.signer
    }

    pub async fn create_commitment(
        &self,
        goal: &str,
        verifier: Address,
        duration_secs: u64,
    ) -> Result<TxReceipt, CallError> {
        self.transact(LedgerCall::CreateCommitment {
            goal: goal.to_string(),
            verifier,
            duration_secs,
            value: self.gateway.stake,
        })
        .await
    }

    pub async fn submit_proof(&self, id: u64, proof: &str) -> Result<TxReceipt, CallError> {
        self.transact(LedgerCall::SubmitProof {
            id,
            proof: proof.to_string(),
        })
        .await
    }

    pub async fn verify_commitment(&self, id: u64, approved: bool) -> Result<TxReceipt, CallError> {
        self.transact(LedgerCall::VerifyCommitment { id, approved })
            .await
    }

    pub async fn withdraw_pending(&self) -> Result<TxReceipt, CallError> {
        self.transact(LedgerCall::WithdrawPending).await
    }

    pub async fn commitment_count(&self) -> Result<u64, CallError> {
        let count = self.gateway.backend.commitment_count().await?;
        u256_to_u64(count, "commitmentCount")
    }

    pub async fn get_commitment(&self, id: u64) -> Result<Commitment, CallError> {
        let raw = self.gateway.backend.get_commitment(id).await?;
        Ok(Commitment::decode(id, raw)?)
    }

    pub async fn pending_withdrawals(&self, owner: Address) -> Result<PendingWithdrawal, CallError> {
        let amount = self.gateway.backend.pending_withdrawals(owner).await?;
        Ok(PendingWithdrawal { owner, amount })
    }

    pub async fn owner(&self) -> Result<Address, CallError> {
        self.gateway.backend.owner().await
    }

    pub async fn duration_bounds(&self) -> Result<DurationBounds, CallError> {
        let (min, max) = self.gateway.backend.duration_bounds().await?;
        Ok(DurationBounds {
            min_secs: u256_to_u64(min, "MIN_DURATION")?,
            max_secs: u256_to_u64(max, "MAX_DURATION")?,
        })
    }

    async fn transact(&self, call: LedgerCall) -> Result<TxReceipt, CallError> {
        let gateway = self.gateway;
        let method = call.method();

        let tx_hash = gateway.backend.send(&call).await?;
        debug!(method, ?tx_hash, signer = ?self.signer, "transaction submitted");

        let receipt = tokio::time::timeout(
            gateway.confirm_timeout,
            gateway.backend.wait_for_receipt(tx_hash, gateway.confirmations),
        )
        .await
        .map_err(|_| CallError::Timeout)??
        .ok_or(CallError::Dropped { tx_hash })?;

        if !receipt.success {
            return Err(CallError::Reverted { reason: None });
        }

        info!(method, ?tx_hash, block = ?receipt.block_number, "transaction confirmed");
        Ok(receipt)
    }
}

fn u256_to_u64(value: U256, field: &str) -> Result<u64, CallError> {
    if value > U256::from(u64::MAX) {
        return Err(CallError::Decode(format!("{field} overflows u64")));
    }
    Ok(value.as_u64())
}
