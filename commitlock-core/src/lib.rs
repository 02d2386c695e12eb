//! commitlock-core
//!
//! Client-side synchronization layer for staked study commitments: a student locks ETH behind
//! a goal, a named verifier approves or rejects the submitted proof, and payouts accumulate on
//! the contract until withdrawn.
//!
//! # Architecture
//!
//! - [`wallet::WalletSession`] owns the wallet connection and the required-network invariant.
//! - [`gateway::LedgerGateway`] is the only component that talks to the contract. It preflights
//!   network, deployed code and signer before handing out a [`gateway::ContractHandle`].
//! - [`store::CommitmentStore`] keeps a read-only projection of the ledger and replaces it
//!   wholesale after every confirmed mutation.
//! - [`translate::ErrorTranslator`] classifies raw failures into [`error::SyncError`].
//! - [`gate::SessionGate`] wires everything together and only releases the store once the
//!   session is resolved.
//!
//! The ledger is authoritative. Nothing here predicts a state transition; every status change
//! the UI sees came from a scan.

pub mod config;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod provider;
pub mod store;
pub mod translate;
pub mod types;
pub mod wallet;

use std::sync::atomic::{AtomicBool, Ordering};

pub use config::{ChainSpec, ConfigError, NativeCurrency, SyncConfig, SEPOLIA_CHAIN_ID};
pub use error::{rpc_codes, CallError, SyncError};
pub use gate::{GatePhase, GateSubscription, SessionGate};
pub use gateway::{ContractHandle, LedgerBackend, LedgerCall, LedgerGateway, TxReceipt};
pub use provider::{ProviderEvent, WalletProvider};
pub use store::{CommitmentStore, ScanOutcome, StoreNotice, WithdrawOutcome};
pub use translate::{revert_reason, ErrorTranslator};
pub use types::{
    format_amount, status_label, verifier_fee, Commitment, CommitmentStatus, DecodeError,
    DurationBounds, PendingWithdrawal, RawCommitment, VerifierTask, VERIFIER_FEE_BPS,
};
pub use wallet::{EventSubscription, SessionEvent, SessionSnapshot, WalletSession};

/// Clears an in-flight flag when dropped. The caller sets the flag.
pub(crate) struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    pub(crate) fn new(flag: &'a AtomicBool) -> Self {
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
