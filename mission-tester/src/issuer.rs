use mission_engine::storage::read_json;
use mission_engine::{
    CreditBackend, CreditError, CreditRequest, KeyValueStore, SignedReceipt, StorageError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IssuerBook {
    balance: u64,
    receipts: BTreeMap<String, SignedReceipt>,
}

/// Stand-in authoritative issuer persisted beside the mission state, so live
/// mode keeps its balances between CLI invocations.
#[derive(Debug, Clone)]
pub struct LocalIssuer<S> {
    store: S,
    secret: Vec<u8>,
}

impl<S: KeyValueStore> LocalIssuer<S> {
    pub fn new(store: S, secret: &[u8]) -> Self {
        Self {
            store,
            secret: secret.to_vec(),
        }
    }

    fn book_key(user_id: &str) -> String {
        format!("issuer.{user_id}")
    }

    fn book(&self, user_id: &str) -> Result<IssuerBook, StorageError> {
        Ok(read_json(&self.store, &Self::book_key(user_id))?.unwrap_or_default())
    }

    pub fn balance(&self, user_id: &str) -> Result<u64, StorageError> {
        Ok(self.book(user_id)?.balance)
    }

    pub fn receipts(&self, user_id: &str) -> Result<Vec<SignedReceipt>, StorageError> {
        Ok(self.book(user_id)?.receipts.into_values().collect())
    }
}

impl<S: KeyValueStore> CreditBackend for LocalIssuer<S> {
    fn issue(&self, request: &CreditRequest) -> Result<SignedReceipt, CreditError> {
        let key = request.idempotency_key();
        let mut issued: Option<SignedReceipt> = None;
        self.store
            .update(&Self::book_key(&request.user_id), |current| {
                let mut book: IssuerBook = match current {
                    Some(raw) => serde_json::from_str(raw)?,
                    None => IssuerBook::default(),
                };
                if let Some(existing) = book.receipts.get(&key) {
                    let mut repeat = existing.clone();
                    repeat.duplicate = true;
                    issued = Some(repeat);
                } else {
                    book.balance = book.balance.saturating_add(u64::from(request.amount));
                    let receipt = SignedReceipt {
                        idempotency_key: key.clone(),
                        user_id: request.user_id.clone(),
                        amount: request.amount,
                        balance: book.balance,
                        issued_at: request.requested_at,
                        duplicate: false,
                        signature: Vec::new(),
                    }
                    .sign(&self.secret)
                    .map_err(|err| StorageError::Backend(err.to_string()))?;
                    book.receipts.insert(key.clone(), receipt.clone());
                    issued = Some(receipt);
                }
                Ok(serde_json::to_string(&book)?)
            })?;
        issued.ok_or_else(|| CreditError::Backend(format!("issuer returned nothing for {key}")))
    }
}
