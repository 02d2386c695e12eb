//! ethers-backed implementations of the commitlock provider and ledger seams.
//!
//! - [`EthersLedger`] talks to a deployed StudyCommitment contract through a
//!   `SignerMiddleware<Provider<Http>, LocalWallet>`.
//! - [`RpcWalletProvider`] stands in for a browser wallet on headless hosts.

pub mod error;
pub mod ledger;
pub mod wallet;

pub use error::{contract_error, middleware_error, revert_string, EvmError};
pub use ledger::{Client, EthersLedger, COMMITMENT_ABI};
pub use wallet::RpcWalletProvider;
