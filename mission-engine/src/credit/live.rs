use chrono::NaiveDateTime;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{CreditAdapter, CreditError, CreditMode, CreditOutcome, CreditReceipt, CreditRequest};

type HmacSha256 = Hmac<Sha256>;

/// Response from the authoritative issuing side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedReceipt {
    pub idempotency_key: String,
    pub user_id: String,
    pub amount: u32,
    pub balance: u64,
    pub issued_at: NaiveDateTime,
    /// True when the backend had already issued this key.
    #[serde(default)]
    pub duplicate: bool,
    /// HMAC-SHA256 over [`SignedReceipt::signing_payload`].
    pub signature: Vec<u8>,
}

impl SignedReceipt {
    #[must_use]
    pub fn signing_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.idempotency_key, self.user_id, self.amount, self.balance, self.issued_at
        )
    }

    fn mac(secret: &[u8]) -> Result<HmacSha256, CreditError> {
        HmacSha256::new_from_slice(secret)
            .map_err(|err| CreditError::Backend(format!("signing key rejected: {err}")))
    }

    /// Fill in `signature` using the shared secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret cannot be used as an HMAC key.
    pub fn sign(mut self, secret: &[u8]) -> Result<Self, CreditError> {
        let mut mac = Self::mac(secret)?;
        mac.update(self.signing_payload().as_bytes());
        self.signature = mac.finalize().into_bytes().to_vec();
        Ok(self)
    }

    #[must_use]
    pub fn verify(&self, secret: &[u8]) -> bool {
        let Ok(mut mac) = Self::mac(secret) else {
            return false;
        };
        mac.update(self.signing_payload().as_bytes());
        mac.verify_slice(&self.signature).is_ok()
    }
}

/// Authoritative reward issuer. Must treat a repeated idempotency key as a
/// no-op that returns the original receipt with `duplicate` set.
pub trait CreditBackend {
    /// # Errors
    ///
    /// Returns an error if the backend did not issue the reward.
    fn issue(&self, request: &CreditRequest) -> Result<SignedReceipt, CreditError>;
}

/// Live-mode adapter: forwards to a backend and trusts only verified receipts.
#[derive(Debug, Clone)]
pub struct LiveCreditAdapter<B> {
    backend: B,
    secret: Vec<u8>,
}

impl<B: CreditBackend> LiveCreditAdapter<B> {
    #[must_use]
    pub fn new(backend: B, secret: &[u8]) -> Self {
        Self {
            backend,
            secret: secret.to_vec(),
        }
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: CreditBackend> CreditAdapter for LiveCreditAdapter<B> {
    fn mode(&self) -> CreditMode {
        CreditMode::Live
    }

    fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, CreditError> {
        let key = request.idempotency_key();
        let signed = self.backend.issue(request)?;
        if !signed.verify(&self.secret) {
            log::warn!("credit receipt for {key} failed verification");
            return Err(CreditError::SignatureMismatch { key });
        }
        if signed.idempotency_key != key
            || signed.user_id != request.user_id
            || signed.amount != request.amount
        {
            return Err(CreditError::Rejected {
                key,
                reason: format!(
                    "receipt is for {} / {} / {}",
                    signed.idempotency_key, signed.user_id, signed.amount
                ),
            });
        }
        let receipt = CreditReceipt {
            idempotency_key: signed.idempotency_key,
            amount: signed.amount,
            issued_at: signed.issued_at,
            balance: Some(signed.balance),
        };
        if signed.duplicate {
            log::debug!("backend already issued {key}");
            Ok(CreditOutcome::AlreadyIssued(receipt))
        } else {
            log::info!(
                "backend issued {} for {key}; balance now {}",
                receipt.amount,
                signed.balance
            );
            Ok(CreditOutcome::Issued(receipt))
        }
    }
}

#[derive(Debug, Default)]
struct BackendBook {
    balances: HashMap<String, u64>,
    issued: HashMap<String, SignedReceipt>,
}

/// Reference authoritative backend holding real balances in memory.
///
/// Issuance and the idempotency check happen under one borrow.
#[derive(Debug, Clone)]
pub struct InMemoryCreditBackend {
    secret: Rc<Vec<u8>>,
    book: Rc<RefCell<BackendBook>>,
}

impl InMemoryCreditBackend {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: Rc::new(secret.to_vec()),
            book: Rc::new(RefCell::new(BackendBook::default())),
        }
    }

    #[must_use]
    pub fn balance(&self, user_id: &str) -> u64 {
        self.book
            .borrow()
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn issued_count(&self) -> usize {
        self.book.borrow().issued.len()
    }
}

impl CreditBackend for InMemoryCreditBackend {
    fn issue(&self, request: &CreditRequest) -> Result<SignedReceipt, CreditError> {
        let key = request.idempotency_key();
        let scoped = format!("{}/{key}", request.user_id);
        let mut book = self.book.borrow_mut();
        if let Some(existing) = book.issued.get(&scoped) {
            let mut repeat = existing.clone();
            repeat.duplicate = true;
            return Ok(repeat);
        }
        let balance = book.balances.entry(request.user_id.clone()).or_insert(0);
        *balance = balance.saturating_add(u64::from(request.amount));
        let receipt = SignedReceipt {
            idempotency_key: key,
            user_id: request.user_id.clone(),
            amount: request.amount,
            balance: *balance,
            issued_at: request.requested_at,
            duplicate: false,
            signature: Vec::new(),
        }
        .sign(&self.secret)?;
        book.issued.insert(scoped, receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::DayKey;
    use chrono::NaiveDate;

    const SECRET: &[u8] = b"shared-secret";

    fn request(user: &str, phase: u8, amount: u32) -> CreditRequest {
        let date = NaiveDate::from_ymd_opt(2026, 8, 14).unwrap();
        CreditRequest {
            user_id: user.to_string(),
            mission_id: "grand-tour".to_string(),
            phase,
            day_key: DayKey::from_date(date),
            amount,
            reason: "daily mission".to_string(),
            requested_at: date.and_hms_opt(10, 0, 0).unwrap(),
        }
    }

    struct TamperingBackend(InMemoryCreditBackend);

    impl CreditBackend for TamperingBackend {
        fn issue(&self, request: &CreditRequest) -> Result<SignedReceipt, CreditError> {
            let mut receipt = self.0.issue(request)?;
            receipt.amount += 1;
            Ok(receipt)
        }
    }

    struct DownBackend;

    impl CreditBackend for DownBackend {
        fn issue(&self, _request: &CreditRequest) -> Result<SignedReceipt, CreditError> {
            Err(CreditError::Backend("connection refused".to_string()))
        }
    }

    #[test]
    fn live_credit_moves_balance_once_per_key() {
        let backend = InMemoryCreditBackend::new(SECRET);
        let adapter = LiveCreditAdapter::new(backend.clone(), SECRET);
        let first = adapter.credit(&request("alice", 1, 30)).unwrap();
        assert!(first.is_new());
        assert_eq!(first.receipt().balance, Some(30));

        let retry = adapter.credit(&request("alice", 1, 30)).unwrap();
        assert!(!retry.is_new());
        assert_eq!(backend.balance("alice"), 30);
        assert_eq!(backend.issued_count(), 1);

        adapter.credit(&request("alice", 2, 30)).unwrap();
        adapter.credit(&request("bob", 1, 30)).unwrap();
        assert_eq!(backend.balance("alice"), 60);
        assert_eq!(backend.balance("bob"), 30);
        assert_eq!(adapter.mode(), CreditMode::Live);
    }

    #[test]
    fn tampered_receipt_is_rejected() {
        let adapter = LiveCreditAdapter::new(
            TamperingBackend(InMemoryCreditBackend::new(SECRET)),
            SECRET,
        );
        assert!(matches!(
            adapter.credit(&request("alice", 1, 30)),
            Err(CreditError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let adapter = LiveCreditAdapter::new(InMemoryCreditBackend::new(SECRET), b"other");
        assert!(matches!(
            adapter.credit(&request("alice", 1, 30)),
            Err(CreditError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn backend_failure_surfaces_as_error() {
        let adapter = LiveCreditAdapter::new(DownBackend, SECRET);
        assert!(matches!(
            adapter.credit(&request("alice", 1, 30)),
            Err(CreditError::Backend(_))
        ));
    }

    #[test]
    fn signature_covers_payload() {
        let receipt = InMemoryCreditBackend::new(SECRET)
            .issue(&request("alice", 1, 5))
            .unwrap();
        assert!(receipt.verify(SECRET));
        let mut forged = receipt;
        forged.balance = 1_000;
        assert!(!forged.verify(SECRET));
    }
}
