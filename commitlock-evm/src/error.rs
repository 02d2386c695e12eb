//! Construction errors and the mapping from ethers failures onto [`CallError`].

use commitlock_core::{rpc_codes, CallError};
use ethers::abi::{AbiError, ParamType, Token};
use ethers::contract::ContractError;
use ethers::providers::{Middleware, MiddlewareError};
use thiserror::Error;

/// Errors raised while wiring a backend or provider.
#[derive(Debug, Error)]
pub enum EvmError {
    /// The RPC endpoint URL could not be parsed.
    #[error("invalid RPC url `{url}`: {reason}")]
    InvalidRpcUrl { url: String, reason: String },

    /// The configured private key is not a valid secp256k1 key.
    #[error("invalid private key")]
    InvalidKey,

    /// The embedded contract ABI does not parse.
    #[error("invalid contract ABI: {0}")]
    Abi(#[from] serde_json::Error),
}

/// Any middleware or provider failure. JSON-RPC error responses keep their code and message.
pub fn middleware_error<E: MiddlewareError>(err: E) -> CallError {
    match err.as_error_response() {
        Some(response) => CallError::rpc(response.code, response.message.clone()),
        None => CallError::rpc(rpc_codes::INTERNAL_ERROR, err.to_string()),
    }
}

/// `keccak256("Error(string)")[..4]`.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Contract call failure. Standard `Error(string)` reverts are decoded into their reason.
pub fn contract_error<M: Middleware>(err: ContractError<M>) -> CallError {
    match err {
        ContractError::Revert(data) => match revert_string(&data) {
            Some(reason) => CallError::revert(reason),
            None => CallError::Reverted { reason: None },
        },
        ContractError::MiddlewareError { e } => middleware_error(e),
        ContractError::ProviderError { e } => middleware_error(e),
        ContractError::DecodingError(e) => CallError::Decode(e.to_string()),
        ContractError::DetokenizationError(e) => CallError::Decode(e.to_string()),
        other => CallError::rpc(rpc_codes::INTERNAL_ERROR, other.to_string()),
    }
}

/// Reason carried by `Error(string)` revert data, if that is what `data` is.
pub fn revert_string(data: &[u8]) -> Option<String> {
    let payload = data.strip_prefix(&ERROR_STRING_SELECTOR[..])?;
    match ethers::abi::decode(&[ParamType::String], payload).ok()?.pop()? {
        Token::String(reason) => Some(reason),
        _ => None,
    }
}

/// Encoding a call against the embedded ABI failed; the ABI and the call site disagree.
pub fn abi_error(err: AbiError) -> CallError {
    CallError::Decode(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::abi::encode;

    fn error_string(reason: &str) -> Vec<u8> {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(encode(&[Token::String(reason.to_string())]));
        data
    }

    #[test]
    fn decodes_standard_revert_reason() {
        assert_eq!(
            revert_string(&error_string("deadline passed")).as_deref(),
            Some("deadline passed")
        );
    }

    #[test]
    fn ignores_custom_errors_and_empty_data() {
        assert_eq!(revert_string(&[]), None);
        assert_eq!(revert_string(&[0xde, 0xad, 0xbe, 0xef]), None);
        assert_eq!(revert_string(&ERROR_STRING_SELECTOR), None);
    }

    #[test]
    fn selector_matches_error_string_signature() {
        let hash = ethers::utils::keccak256("Error(string)");
        assert_eq!(&hash[..4], &ERROR_STRING_SELECTOR);
    }
}
