use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::{CreditAdapter, CreditError, CreditMode, CreditOutcome, CreditReceipt, CreditRequest};
use crate::storage::{KeyValueStore, Keyspace, StorageError, read_json};

/// Audit entry in the pending-credit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub amount: u32,
    pub reason: String,
    pub timestamp: NaiveDateTime,
    #[serde(default)]
    pub idempotency_key: String,
}

impl LedgerEntry {
    fn receipt(&self) -> CreditReceipt {
        CreditReceipt {
            idempotency_key: self.idempotency_key.clone(),
            amount: self.amount,
            issued_at: self.timestamp,
            balance: None,
        }
    }
}

/// Safe-mode adapter: appends to a local ledger and never touches a balance.
#[derive(Debug, Clone)]
pub struct SafeModeLedger<S> {
    store: S,
    key: String,
}

impl<S: KeyValueStore> SafeModeLedger<S> {
    #[must_use]
    pub fn new(store: S, keys: &Keyspace) -> Self {
        Self {
            store,
            key: keys.key("ledger"),
        }
    }

    /// Entries in issuance order.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or decoded.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, StorageError> {
        Ok(read_json(&self.store, &self.key)?.unwrap_or_default())
    }

    /// Sum of every recorded amount.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read or decoded.
    pub fn total(&self) -> Result<u64, StorageError> {
        Ok(self
            .entries()?
            .iter()
            .map(|entry| u64::from(entry.amount))
            .sum())
    }
}

impl<S: KeyValueStore> CreditAdapter for SafeModeLedger<S> {
    fn mode(&self) -> CreditMode {
        CreditMode::Safe
    }

    fn credit(&self, request: &CreditRequest) -> Result<CreditOutcome, CreditError> {
        let idempotency_key = request.idempotency_key();
        let mut earlier: Option<LedgerEntry> = None;
        let entry = LedgerEntry {
            amount: request.amount,
            reason: request.reason.clone(),
            timestamp: request.requested_at,
            idempotency_key: idempotency_key.clone(),
        };
        self.store.update(&self.key, |current| {
            // A corrupt ledger is an error, never silently replaced.
            let mut entries: Vec<LedgerEntry> = match current {
                Some(raw) => serde_json::from_str(raw)?,
                None => Vec::new(),
            };
            if let Some(found) = entries
                .iter()
                .find(|existing| existing.idempotency_key == idempotency_key)
            {
                earlier = Some(found.clone());
            } else {
                entries.push(entry.clone());
            }
            Ok(serde_json::to_string(&entries)?)
        })?;

        if let Some(found) = earlier {
            log::debug!("ledger already holds {idempotency_key}; not appending");
            return Ok(CreditOutcome::AlreadyIssued(found.receipt()));
        }
        log::info!(
            "ledger recorded {} for {idempotency_key} ({})",
            entry.amount,
            entry.reason
        );
        Ok(CreditOutcome::Issued(entry.receipt()))
    }
}
