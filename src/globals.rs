//! Cross-script `global` namespace.
//!
//! A flat keyed store shared by every script, persisted under the
//! [`GLOBAL_NS_PREFIX`] keyspace. Deliberately unscoped: concurrent runs
//! see each other's writes and the last write wins. Scripts that need
//! isolation should namespace their own keys.

use std::sync::Arc;

use serde_json::Value;

use crate::config::GLOBAL_NS_PREFIX;
use crate::error::StorageError;
use crate::storage::KvStore;

pub struct GlobalNamespace {
    kv: Arc<dyn KvStore>,
}

impl GlobalNamespace {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.kv.get(&self.qualify(key))
    }

    /// Stores `value` under `key`. A `null` value removes the key so it no
    /// longer shows up in [`GlobalNamespace::keys`].
    pub fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        if value.is_null() {
            self.kv.remove(&self.qualify(key))
        } else {
            self.kv.set(&self.qualify(key), value)
        }
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .kv
            .keys()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(GLOBAL_NS_PREFIX).map(str::to_owned))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn qualify(&self, key: &str) -> String {
        format!("{GLOBAL_NS_PREFIX}{key}")
    }
}
