//! Commitment records as projected from the ledger, plus the values derived from them.
//!
//! Nothing in here is ever mutated to "guess" a next state: a [`Commitment`] is decoded
//! from a [`RawCommitment`] read off the contract and replaced wholesale on the next scan.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use ethers_core::types::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verifier fee, in basis points of the stake.
pub const VERIFIER_FEE_BPS: u64 = 100;

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Wei per ether.
const WEI_DECIMALS: usize = 18;

// ═══════════════════════════════════════════════════════════════════════════════
// STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Commitment status as stored by the contract (`enum Status` in Solidity).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitmentStatus {
    Active,
    Submitted,
    Verified,
    Failed,
}

/// Errors raised while decoding ledger records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The contract returned a status ordinal this client does not know.
    #[error("unknown commitment status ordinal {0} (contract ABI version mismatch)")]
    UnknownStatus(u8),

    /// A numeric field does not fit the client-side representation.
    #[error("field `{0}` overflows u64")]
    Overflow(&'static str),
}

impl CommitmentStatus {
    /// All statuses in ordinal order.
    pub const ALL: [CommitmentStatus; 4] = [
        CommitmentStatus::Active,
        CommitmentStatus::Submitted,
        CommitmentStatus::Verified,
        CommitmentStatus::Failed,
    ];

    /// Decode the contract ordinal. Anything outside `0..=3` is rejected.
    pub fn from_ordinal(ordinal: u8) -> Result<Self, DecodeError> {
        match ordinal {
            0 => Ok(CommitmentStatus::Active),
            1 => Ok(CommitmentStatus::Submitted),
            2 => Ok(CommitmentStatus::Verified),
            3 => Ok(CommitmentStatus::Failed),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }

    pub fn ordinal(self) -> u8 {
        match self {
            CommitmentStatus::Active => 0,
            CommitmentStatus::Submitted => 1,
            CommitmentStatus::Verified => 2,
            CommitmentStatus::Failed => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CommitmentStatus::Active => "Active",
            CommitmentStatus::Submitted => "Submitted",
            CommitmentStatus::Verified => "Verified",
            CommitmentStatus::Failed => "Failed",
        }
    }

    /// Verified and Failed are final; the ledger never moves a commitment out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, CommitmentStatus::Verified | CommitmentStatus::Failed)
    }
}

impl fmt::Display for CommitmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Label for a raw status ordinal.
pub fn status_label(ordinal: u8) -> Result<&'static str, DecodeError> {
    CommitmentStatus::from_ordinal(ordinal).map(CommitmentStatus::label)
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Tuple returned by `getCommitment(id)`, field for field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCommitment {
    pub student: Address,
    pub verifier: Address,
    pub goal: String,
    pub proof: String,
    pub stake: U256,
    /// Unix seconds.
    pub deadline: U256,
    pub status: u8,
}

/// A commitment as seen by this client after a successful scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    /// Ledger index. Assigned by the contract, never by the client.
    pub id: u64,
    pub student: Address,
    pub verifier: Address,
    pub goal: String,
    /// Wei.
    pub stake: U256,
    /// Unix seconds.
    pub deadline: u64,
    pub status: CommitmentStatus,
    pub proof: Option<String>,
}

impl Commitment {
    /// Decode the record stored at ledger index `id`.
    pub fn decode(id: u64, raw: RawCommitment) -> Result<Self, DecodeError> {
        let status = CommitmentStatus::from_ordinal(raw.status)?;
        if raw.deadline > U256::from(u64::MAX) {
            return Err(DecodeError::Overflow("deadline"));
        }
        let proof = if raw.proof.is_empty() { None } else { Some(raw.proof) };

        Ok(Self {
            id,
            student: raw.student,
            verifier: raw.verifier,
            goal: raw.goal,
            stake: raw.stake,
            deadline: raw.deadline.as_u64(),
            status,
            proof,
        })
    }

    /// Fee owed to the verifier, recomputed from the canonical stake on every call.
    pub fn verifier_fee(&self) -> U256 {
        verifier_fee(self.stake)
    }

    pub fn deadline_utc(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.deadline)
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    pub fn is_student(&self, who: Address) -> bool {
        self.student == who
    }

    /// True when `who` is the verifier and the proof is waiting for a decision.
    pub fn awaits_verification_by(&self, who: Address) -> bool {
        self.verifier == who && self.status == CommitmentStatus::Submitted
    }
}

/// A submitted commitment seen through the verifier's eyes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierTask {
    pub id: u64,
    pub student: Address,
    pub goal: String,
    pub proof: String,
    pub stake: U256,
}

impl VerifierTask {
    pub fn verifier_fee(&self) -> U256 {
        verifier_fee(self.stake)
    }
}

impl From<&Commitment> for VerifierTask {
    fn from(c: &Commitment) -> Self {
        Self {
            id: c.id,
            student: c.student,
            goal: c.goal.clone(),
            proof: c.proof.clone().unwrap_or_default(),
            stake: c.stake,
        }
    }
}

/// Ledger-held balance owed to `owner`, released by `withdrawPending()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub owner: Address,
    pub amount: U256,
}

impl PendingWithdrawal {
    pub fn is_empty(&self) -> bool {
        self.amount.is_zero()
    }
}

/// `MIN_DURATION` / `MAX_DURATION` as exposed by the contract, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBounds {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl DurationBounds {
    pub fn contains(&self, secs: u64) -> bool {
        (self.min_secs..=self.max_secs).contains(&secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AMOUNTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Verifier fee for a given stake.
pub fn verifier_fee(stake: U256) -> U256 {
    stake * U256::from(VERIFIER_FEE_BPS) / U256::from(BPS_DENOMINATOR)
}

/// Render a wei amount in ether with trailing zeros trimmed, keeping at least one decimal
/// (`1 ether -> "1.0"`, `0.01 ether -> "0.01"`).
pub fn format_amount(wei: U256) -> String {
    let (whole, frac) = wei.div_mod(U256::exp10(WEI_DECIMALS));
    let frac = format!("{:0width$}", frac.as_u64(), width = WEI_DECIMALS);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        format!("{whole}.0")
    } else {
        format!("{whole}.{frac}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers_core::utils::parse_ether;

    fn raw(status: u8) -> RawCommitment {
        RawCommitment {
            student: Address::from_low_u64_be(1),
            verifier: Address::from_low_u64_be(2),
            goal: "read chapter 4".into(),
            proof: String::new(),
            stake: parse_ether("0.01").unwrap(),
            deadline: U256::from(1_700_000_000u64),
            status,
        }
    }

    #[test]
    fn status_ordinals_decode_to_exactly_one_label() {
        for status in CommitmentStatus::ALL {
            let decoded = CommitmentStatus::from_ordinal(status.ordinal()).unwrap();
            assert_eq!(decoded, status);
            assert_eq!(status_label(status.ordinal()).unwrap(), status.label());
        }
        assert_eq!(status_label(0).unwrap(), "Active");
        assert_eq!(status_label(1).unwrap(), "Submitted");
        assert_eq!(status_label(2).unwrap(), "Verified");
        assert_eq!(status_label(3).unwrap(), "Failed");
    }

    #[test]
    fn unknown_ordinal_is_a_decode_error() {
        assert_eq!(status_label(4), Err(DecodeError::UnknownStatus(4)));
        assert_eq!(
            CommitmentStatus::from_ordinal(255),
            Err(DecodeError::UnknownStatus(255))
        );
        assert!(Commitment::decode(0, raw(7)).is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!CommitmentStatus::Active.is_terminal());
        assert!(!CommitmentStatus::Submitted.is_terminal());
        assert!(CommitmentStatus::Verified.is_terminal());
        assert!(CommitmentStatus::Failed.is_terminal());
    }

    #[test]
    fn decode_maps_empty_proof_to_none() {
        let c = Commitment::decode(3, raw(0)).unwrap();
        assert_eq!(c.id, 3);
        assert_eq!(c.proof, None);
        assert_eq!(c.deadline, 1_700_000_000);
        assert_eq!(
            c.deadline_utc().unwrap().to_rfc3339(),
            "2023-11-14T22:13:20+00:00"
        );

        let mut with_proof = raw(1);
        with_proof.proof = "https://example.org/notes".into();
        let c = Commitment::decode(0, with_proof).unwrap();
        assert_eq!(c.proof.as_deref(), Some("https://example.org/notes"));
        assert_eq!(VerifierTask::from(&c).proof, "https://example.org/notes");
    }

    #[test]
    fn deadline_overflow_is_rejected() {
        let mut r = raw(0);
        r.deadline = U256::from(u64::MAX) + 1;
        assert_eq!(Commitment::decode(0, r), Err(DecodeError::Overflow("deadline")));
    }

    #[test]
    fn verifier_fee_is_one_percent_of_stake() {
        let stake = parse_ether("1.0").unwrap();
        let first = format_amount(verifier_fee(stake));
        let second = format_amount(verifier_fee(stake));
        assert_eq!(first, "0.01");
        assert_eq!(first, second);
    }

    #[test]
    fn format_amount_trims_trailing_zeros() {
        assert_eq!(format_amount(U256::zero()), "0.0");
        assert_eq!(format_amount(parse_ether("1").unwrap()), "1.0");
        assert_eq!(format_amount(parse_ether("0.01").unwrap()), "0.01");
        assert_eq!(format_amount(parse_ether("12.5").unwrap()), "12.5");
        assert_eq!(format_amount(U256::from(1u64)), "0.000000000000000001");
    }

    #[test]
    fn awaits_verification_only_when_submitted() {
        let verifier = Address::from_low_u64_be(2);
        assert!(!Commitment::decode(0, raw(0)).unwrap().awaits_verification_by(verifier));
        assert!(Commitment::decode(0, raw(1)).unwrap().awaits_verification_by(verifier));
        assert!(!Commitment::decode(0, raw(1))
            .unwrap()
            .awaits_verification_by(Address::from_low_u64_be(9)));
    }
}
