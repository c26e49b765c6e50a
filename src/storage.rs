//! Persisted key-value collaborator.
//!
//! The registries treat persistence as an abstract flat keyspace. Two
//! implementations are provided: an in-process [`MemoryStore`] and a
//! write-through [`JsonFileStore`] keeping the whole keyspace in a single
//! JSON document.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::StorageError;

/// Abstract persisted key-value store.
///
/// Mutations are atomic read-modify-persist steps serialized by the
/// calling registries; implementations only need per-call consistency.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-process store backed by a concurrent map. The default for tests and
/// for hosts that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.entries.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }
}

/// Single-file JSON store, written through on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open a store at `path`, loading the existing document if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        let rendered = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&self.path, rendered)?;
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_owned(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        store.set("a", json!({"x": 1})).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!({"x": 1})));
        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn json_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("scripts", json!({"id-1": {"name": "n"}})).unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("scripts").unwrap(),
            Some(json!({"id-1": {"name": "n"}}))
        );
        assert_eq!(reopened.keys().unwrap(), vec!["scripts".to_owned()]);
    }

    #[test]
    fn remove_missing_key_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).unwrap();
        store.remove("absent").unwrap();
        assert!(store.keys().unwrap().is_empty());
    }
}
