//! Namespaced key/value persistence.
//!
//! Every persisted mission field lives under its own key holding a JSON-encoded
//! value. Backends are cheap handles: cloning one shares the underlying data,
//! so the state store, counter store and ledger can each hold a copy.
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

/// Failures raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Raw string key/value storage.
///
/// Implementations must make [`KeyValueStore::update`] a single critical
/// section; counters and the ledger rely on it instead of read-then-write.
pub trait KeyValueStore: Clone {
    /// Fetch the raw value stored at `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` at `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the write.
    fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Remove `key` if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the removal.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List every key starting with `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Atomically replace the value at `key` with `apply(current)`.
    ///
    /// Returns the value that was written.
    ///
    /// # Errors
    ///
    /// Returns an error if `apply` fails or the backend rejects the write;
    /// in both cases the stored value is left untouched.
    fn update<F>(&self, key: &str, apply: F) -> Result<String, StorageError>
    where
        F: FnOnce(Option<&str>) -> Result<String, StorageError>;
}

/// Decode the JSON value stored at `key`.
///
/// # Errors
///
/// Returns an error if the backend fails or the stored value does not decode.
pub fn read_json<S, T>(store: &S, key: &str) -> Result<Option<T>, StorageError>
where
    S: KeyValueStore,
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encode `value` as JSON and store it at `key`.
///
/// # Errors
///
/// Returns an error if encoding or the backend write fails.
pub fn write_json<S, T>(store: &S, key: &str, value: &T) -> Result<(), StorageError>
where
    S: KeyValueStore,
    T: Serialize + ?Sized,
{
    store.set(key, serde_json::to_string(value)?)
}

/// Key builder scoping fields to one user inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    /// Keys of the form `{namespace}.{user_id}.{field}`.
    #[must_use]
    pub fn for_user(namespace: &str, user_id: &str) -> Self {
        Self {
            prefix: format!("{namespace}.{user_id}"),
        }
    }

    #[must_use]
    pub fn key(&self, field: &str) -> String {
        format!("{}.{field}", self.prefix)
    }

    /// Nested keyspace, e.g. `{namespace}.{user_id}.counter`.
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        Self {
            prefix: self.key(segment),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// In-process store, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Rc<RefCell<BTreeMap<String, String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .borrow()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn update<F>(&self, key: &str, apply: F) -> Result<String, StorageError>
    where
        F: FnOnce(Option<&str>) -> Result<String, StorageError>,
    {
        let mut entries = self.entries.borrow_mut();
        let next = apply(entries.get(key).map(String::as_str))?;
        entries.insert(key.to_string(), next.clone());
        Ok(next)
    }
}

/// Store persisted as a single pretty-printed JSON object on disk.
///
/// The whole map is rewritten through a temporary file on every mutation.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: Rc<PathBuf>,
    entries: Rc<RefCell<BTreeMap<String, String>>>,
}

impl FileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: Rc::new(path),
            entries: Rc::new(RefCell::new(entries)),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, self.path.as_path())?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        let mut entries = self.entries.borrow_mut();
        let previous = entries.insert(key.to_string(), value);
        if let Err(err) = self.flush(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.borrow_mut();
        if let Some(previous) = entries.remove(key)
            && let Err(err) = self.flush(&entries)
        {
            entries.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .borrow()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn update<F>(&self, key: &str, apply: F) -> Result<String, StorageError>
    where
        F: FnOnce(Option<&str>) -> Result<String, StorageError>,
    {
        let mut entries = self.entries.borrow_mut();
        let next = apply(entries.get(key).map(String::as_str))?;
        let previous = entries.insert(key.to_string(), next.clone());
        if let Err(err) = self.flush(&entries) {
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "mission-store-{label}-{}.json",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ))
    }

    #[test]
    fn memory_store_clones_share_entries() {
        let store = MemoryStore::new();
        let other = store.clone();
        write_json(&store, "a.b", &42_i64).unwrap();
        let value: Option<i64> = read_json(&other, "a.b").unwrap();
        assert_eq!(value, Some(42));
        other.remove("a.b").unwrap();
        assert!(store.get("a.b").unwrap().is_none());
    }

    #[test]
    fn update_failure_leaves_value_untouched() {
        let store = MemoryStore::new();
        store.set("k", "1".to_string()).unwrap();
        let result = store.update("k", |_| Err(StorageError::Backend("nope".into())));
        assert!(result.is_err());
        assert_eq!(store.get("k").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn keyspace_scopes_fields_per_user() {
        let keys = Keyspace::for_user("daily_mission", "alice");
        assert_eq!(keys.key("phase"), "daily_mission.alice.phase");
        assert_eq!(
            keys.child("counter").key("steps"),
            "daily_mission.alice.counter.steps"
        );
    }

    #[test]
    fn prefix_listing_is_sorted_and_filtered() {
        let store = MemoryStore::new();
        store.set("x.b", "1".into()).unwrap();
        store.set("x.a", "2".into()).unwrap();
        store.set("y.a", "3".into()).unwrap();
        assert_eq!(store.keys_with_prefix("x.").unwrap(), vec!["x.a", "x.b"]);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let path = temp_path("reopen");
        {
            let store = FileStore::open(&path).unwrap();
            write_json(&store, "daily_mission.u.phase", &2_u8).unwrap();
            store
                .update("daily_mission.u.counter.steps", |_| Ok("7".to_string()))
                .unwrap();
        }
        let reopened = FileStore::open(&path).unwrap();
        let phase: Option<u8> = read_json(&reopened, "daily_mission.u.phase").unwrap();
        assert_eq!(phase, Some(2));
        assert_eq!(
            reopened.get("daily_mission.u.counter.steps").unwrap().as_deref(),
            Some("7")
        );
        let _ = fs::remove_file(path);
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let path = temp_path("corrupt");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileStore::open(&path),
            Err(StorageError::Serialization(_))
        ));
        let _ = fs::remove_file(path);
    }
}
