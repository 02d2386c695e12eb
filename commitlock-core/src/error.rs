//! Error types.
//!
//! [`CallError`] is the normalized shape every wallet/ledger call fails with.
//! [`SyncError`] is the closed taxonomy handed to the UI layer; see
//! [`crate::translate::ErrorTranslator`] for the mapping between the two.

use ethers_core::types::{Address, H256};
use thiserror::Error;

/// EIP-1193 / JSON-RPC error codes the session cares about.
pub mod rpc_codes {
    /// The user rejected the request.
    pub const USER_REJECTED: i64 = 4001;
    /// The requested account or method has not been authorized (wallet locked).
    pub const UNAUTHORIZED: i64 = 4100;
    /// The provider does not support the method.
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    /// The provider is disconnected from all chains.
    pub const DISCONNECTED: i64 = 4900;
    /// The chain has not been added to the wallet.
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    /// Generic server error, used by nodes for reverted calls.
    pub const SERVER_ERROR: i64 = -32000;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Raw failure of a provider or contract call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// No wallet provider was injected.
    #[error("no wallet provider available")]
    ProviderMissing,

    /// The provider is connected to the wrong network.
    #[error("connected to chain {actual}, expected {expected}")]
    WrongChain { expected: u64, actual: u64 },

    /// Nothing is deployed at the configured contract address.
    #[error("no contract code at {address:?}")]
    EmptyCode { address: Address },

    /// The provider has no account to sign with.
    #[error("no signer account available")]
    NoSigner,

    /// JSON-RPC level error.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The contract reverted.
    #[error("execution reverted{}", .reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Reverted { reason: Option<String> },

    /// The transaction left the mempool without being included.
    #[error("transaction {tx_hash:?} dropped before inclusion")]
    Dropped { tx_hash: H256 },

    /// The provider did not answer in time.
    #[error("timed out waiting for the ledger")]
    Timeout,

    /// The response could not be decoded into the expected shape.
    #[error("failed to decode ledger response: {0}")]
    Decode(String),
}

impl CallError {
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        CallError::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn revert(reason: impl Into<String>) -> Self {
        CallError::Reverted {
            reason: Some(reason.into()),
        }
    }

    pub fn user_rejected() -> Self {
        CallError::rpc(rpc_codes::USER_REJECTED, "User rejected the request.")
    }

    /// True for the wallet's "unrecognized chain" answer to a switch request.
    pub fn is_unrecognized_chain(&self) -> bool {
        matches!(self, CallError::Rpc { code, .. } if *code == rpc_codes::UNRECOGNIZED_CHAIN)
    }
}

impl From<crate::types::DecodeError> for CallError {
    fn from(err: crate::types::DecodeError) -> Self {
        CallError::Decode(err.to_string())
    }
}

/// Failure categories surfaced to the UI. Closed: every failure lands in exactly one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("no wallet provider found; install a browser wallet")]
    WalletUnavailable,

    #[error("wrong network: switch to chain {expected}")]
    NetworkMismatch { expected: u64, actual: Option<u64> },

    #[error("request rejected in the wallet")]
    UserRejected,

    #[error("contract rejected the call: {0}")]
    ContractRejected(String),

    #[error("transient ledger failure: {0}")]
    TransientFailure(String),

    #[error("contract misconfigured: {0}")]
    MisconfiguredContract(String),

    #[error("{0}")]
    ValidationError(String),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::ValidationError(message.into())
    }

    /// Short heading for a toast or CLI error line.
    pub fn title(&self) -> &'static str {
        match self {
            SyncError::WalletUnavailable => "WALLET ERROR",
            SyncError::NetworkMismatch { .. } => "NETWORK ERROR",
            SyncError::UserRejected => "REJECTED",
            SyncError::ContractRejected(_) => "CONTRACT ERROR",
            SyncError::TransientFailure(_) => "NETWORK HICCUP",
            SyncError::MisconfiguredContract(_) => "CONFIGURATION ERROR",
            SyncError::ValidationError(_) => "VALIDATION",
        }
    }
}
