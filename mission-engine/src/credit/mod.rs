//! Reward issuance boundary.
//!
//! Every issuance is keyed by `(mission, phase, day)` so the issuing side can
//! recognise a repeat, and an adapter reports a repeat differently from both
//! a fresh issuance and a failure.
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::DayKey;
use crate::storage::StorageError;

pub mod live;
pub mod safe;
pub use live::{CreditBackend, InMemoryCreditBackend, LiveCreditAdapter, SignedReceipt};
pub use safe::{LedgerEntry, SafeModeLedger};

/// Which issuing side an adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditMode {
    /// Record intent in a local ledger; no balance moves.
    #[default]
    Safe,
    /// Mutate an authoritative balance through a backend.
    Live,
}

/// One reward to issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub user_id: String,
    pub mission_id: String,
    pub phase: u8,
    pub day_key: DayKey,
    pub amount: u32,
    pub reason: String,
    pub requested_at: NaiveDateTime,
}

impl CreditRequest {
    /// Stable key for this issuance; identical on every retry.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.mission_id, self.phase, self.day_key)
    }
}

/// Proof that a reward was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub idempotency_key: String,
    pub amount: u32,
    pub issued_at: NaiveDateTime,
    /// Authoritative balance after issuance, when the issuing side keeps one.
    pub balance: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    Issued(CreditReceipt),
    /// The key was already issued; nothing moved this time.
    AlreadyIssued(CreditReceipt),
}

impl CreditOutcome {
    #[must_use]
    pub const fn receipt(&self) -> &CreditReceipt {
        match self {
            Self::Issued(receipt) | Self::AlreadyIssued(receipt) => receipt,
        }
    }

    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Issued(_))
    }
}

#[derive(Debug, Error)]
pub enum CreditError {
    #[error("credit ledger unavailable: {0}")]
    Storage(#[from] StorageError),
    #[error("credit backend failed: {0}")]
    Backend(String),
    #[error("credit {key} rejected: {reason}")]
    Rejected { key: String, reason: String },
    #[error("credit receipt for {key} failed signature verification")]
    SignatureMismatch { key: String },
}

/// Issues rewards. Implementations must be idempotent on
/// [`CreditRequest::idempotency_key`].
pub trait CreditAdapter {
    fn mode(&self) -> CreditMode;

    /// Issue `request.amount`, or acknowledge an earlier issuance of the same key.
    ///
    /// # Errors
    ///
    /// Returns an error when the reward could not be confirmed as issued.
    fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, CreditError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn idempotency_key_combines_mission_phase_and_day() {
        let day = NaiveDate::from_ymd_opt(2026, 6, 9).unwrap();
        let request = CreditRequest {
            user_id: "u".to_string(),
            mission_id: "bridge-count".to_string(),
            phase: 2,
            day_key: DayKey::from_date(day),
            amount: 18,
            reason: "daily mission".to_string(),
            requested_at: day.and_hms_opt(8, 0, 0).unwrap(),
        };
        assert_eq!(request.idempotency_key(), "bridge-count:2:2026-06-09");
    }
}
