//! Monotonic gameplay counters, kept apart from mission state.
use crate::storage::{KeyValueStore, Keyspace, StorageError};

/// Persisted per-user tallies keyed by mission-supplied strings.
///
/// Counters are never reset by phase transitions; mission targets are
/// cumulative totals.
#[derive(Debug, Clone)]
pub struct CounterStore<S> {
    store: S,
    keys: Keyspace,
}

impl<S: KeyValueStore> CounterStore<S> {
    #[must_use]
    pub fn new(store: S, keys: &Keyspace) -> Self {
        Self {
            store,
            keys: keys.child("counter"),
        }
    }

    /// Current value, or 0 when unset or unreadable.
    #[must_use]
    pub fn get(&self, counter: &str) -> i64 {
        let key = self.keys.key(counter);
        match self.store.get(&key) {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or_else(|_| {
                log::warn!("counter {key} holds non-integer {raw:?}; treating as 0");
                0
            }),
            Ok(None) => 0,
            Err(err) => {
                log::warn!("counter {key} unreadable, treating as 0: {err}");
                0
            }
        }
    }

    /// Add `by` to the counter in one storage step and return the new total.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the update.
    pub fn increment(&self, counter: &str, by: u32) -> Result<i64, StorageError> {
        let key = self.keys.key(counter);
        let written = self.store.update(&key, |current| {
            let base = current
                .and_then(|raw| raw.trim().parse::<i64>().ok())
                .unwrap_or(0);
            Ok(base.saturating_add(i64::from(by)).to_string())
        })?;
        let total = written.parse().unwrap_or(i64::MAX);
        log::debug!("counter {key} advanced by {by} to {total}");
        Ok(total)
    }

    /// Every counter for this user, by counter name.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot list keys.
    pub fn all(&self) -> Result<Vec<(String, i64)>, StorageError> {
        let prefix = format!("{}.", self.keys.prefix());
        let names: Vec<String> = self
            .store
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        Ok(names
            .into_iter()
            .map(|name| {
                let value = self.get(&name);
                (name, value)
            })
            .collect())
    }
}
