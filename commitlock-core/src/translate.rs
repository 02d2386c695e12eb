//! Classification of raw call failures into the UI error taxonomy.

use tracing::debug;

use crate::error::{rpc_codes, CallError, SyncError};

/// Prefixes nodes and wallets put in front of a revert reason.
const REVERT_PREFIXES: &[&str] = &[
    "execution reverted: ",
    "reverted with reason string ",
    "VM Exception while processing transaction: revert ",
];

/// Maps [`CallError`] onto [`SyncError`].
pub struct ErrorTranslator;

impl ErrorTranslator {
    pub fn classify(err: &CallError) -> SyncError {
        let classified = match err {
            CallError::ProviderMissing => SyncError::WalletUnavailable,
            CallError::WrongChain { expected, actual } => SyncError::NetworkMismatch {
                expected: *expected,
                actual: Some(*actual),
            },
            CallError::NoSigner => SyncError::UserRejected,
            CallError::Rpc { code, .. }
                if *code == rpc_codes::USER_REJECTED || *code == rpc_codes::UNAUTHORIZED =>
            {
                SyncError::UserRejected
            }
            CallError::Rpc { message, .. } => match revert_reason(message) {
                Some(reason) => SyncError::ContractRejected(reason),
                None => SyncError::TransientFailure(err.to_string()),
            },
            CallError::Reverted { reason: Some(reason) } if !reason.is_empty() => {
                SyncError::ContractRejected(reason.clone())
            }
            CallError::Reverted { .. } => {
                SyncError::TransientFailure("transaction reverted without a reason".to_string())
            }
            CallError::Dropped { .. } | CallError::Timeout => {
                SyncError::TransientFailure(err.to_string())
            }
            CallError::EmptyCode { .. } | CallError::Decode(_) => {
                SyncError::MisconfiguredContract(err.to_string())
            }
        };
        debug!(raw = %err, classified = ?classified, "classified call failure");
        classified
    }
}

impl From<CallError> for SyncError {
    fn from(err: CallError) -> Self {
        ErrorTranslator::classify(&err)
    }
}

/// Pull a revert reason out of a free-form RPC error message.
pub fn revert_reason(message: &str) -> Option<String> {
    REVERT_PREFIXES.iter().find_map(|prefix| {
        message.find(prefix).map(|at| {
            message[at + prefix.len()..]
                .trim()
                .trim_matches('\'')
                .trim_matches('"')
                .to_string()
        })
    })
    .filter(|reason| !reason.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers_core::types::{Address, H256};

    #[test]
    fn provider_absent_is_wallet_unavailable() {
        assert_eq!(
            ErrorTranslator::classify(&CallError::ProviderMissing),
            SyncError::WalletUnavailable
        );
    }

    #[test]
    fn wrong_chain_is_network_mismatch() {
        assert_eq!(
            ErrorTranslator::classify(&CallError::WrongChain {
                expected: 11_155_111,
                actual: 1
            }),
            SyncError::NetworkMismatch {
                expected: 11_155_111,
                actual: Some(1)
            }
        );
    }

    #[test]
    fn rejected_and_locked_are_user_rejected() {
        assert_eq!(
            ErrorTranslator::classify(&CallError::user_rejected()),
            SyncError::UserRejected
        );
        assert_eq!(
            ErrorTranslator::classify(&CallError::rpc(rpc_codes::UNAUTHORIZED, "locked")),
            SyncError::UserRejected
        );
        assert_eq!(
            ErrorTranslator::classify(&CallError::NoSigner),
            SyncError::UserRejected
        );
    }

    #[test]
    fn revert_with_reason_is_contract_rejected() {
        assert_eq!(
            ErrorTranslator::classify(&CallError::revert("deadline passed")),
            SyncError::ContractRejected("deadline passed".into())
        );
        assert_eq!(
            ErrorTranslator::classify(&CallError::rpc(
                rpc_codes::SERVER_ERROR,
                "execution reverted: Not verifier"
            )),
            SyncError::ContractRejected("Not verifier".into())
        );
        assert_eq!(
            ErrorTranslator::classify(&CallError::rpc(
                rpc_codes::INTERNAL_ERROR,
                "Error: reverted with reason string 'Nothing to withdraw'"
            )),
            SyncError::ContractRejected("Nothing to withdraw".into())
        );
    }

    #[test]
    fn reasonless_revert_and_timeouts_are_transient() {
        for err in [
            CallError::Reverted { reason: None },
            CallError::Reverted {
                reason: Some(String::new()),
            },
            CallError::Timeout,
            CallError::Dropped {
                tx_hash: H256::zero(),
            },
            CallError::rpc(rpc_codes::INTERNAL_ERROR, "header not found"),
        ] {
            assert!(
                matches!(ErrorTranslator::classify(&err), SyncError::TransientFailure(_)),
                "{err} should be transient"
            );
        }
    }

    #[test]
    fn empty_code_and_decode_are_misconfiguration() {
        assert!(matches!(
            ErrorTranslator::classify(&CallError::EmptyCode {
                address: Address::zero()
            }),
            SyncError::MisconfiguredContract(_)
        ));
        assert!(matches!(
            SyncError::from(CallError::from(crate::types::DecodeError::UnknownStatus(9))),
            SyncError::MisconfiguredContract(_)
        ));
    }

    #[test]
    fn revert_reason_parsing() {
        assert_eq!(revert_reason("execution reverted: "), None);
        assert_eq!(revert_reason("nonce too low"), None);
        assert_eq!(
            revert_reason("execution reverted: deadline passed").as_deref(),
            Some("deadline passed")
        );
    }
}
