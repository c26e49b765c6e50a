//! Token registry.
//!
//! Reconciles the persisted `id -> TokenEntry` map with live token
//! handles held by the automation platform. Every entry is supposed to
//! have exactly one live handle; the registry is the only writer of
//! either side.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::KEY_TOKENS;
use crate::error::{StorageError, TokenError};
use crate::logging::{debug, warn};
use crate::storage::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    String,
    Number,
    Boolean,
}

impl TokenKind {
    /// Infer the token type from a value. Only scalar values map to
    /// platform token types.
    pub fn infer(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(Self::String),
            Value::Number(_) => Some(Self::Number),
            Value::Bool(_) => Some(Self::Boolean),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub value: Value,
}

/// Live token handle owned by the automation platform.
#[async_trait]
pub trait TokenHandle: Send + Sync {
    async fn set_value(&self, value: &Value) -> anyhow::Result<()>;

    async fn unregister(&self) -> anyhow::Result<()>;
}

/// The automation platform's token surface.
#[async_trait]
pub trait TokenPlatform: Send + Sync {
    /// Register a live token titled `id` with an initial value.
    async fn create_token(
        &self,
        id: &str,
        kind: TokenKind,
        value: &Value,
    ) -> anyhow::Result<Box<dyn TokenHandle>>;
}

pub struct TokenRegistry {
    kv: Arc<dyn KvStore>,
    platform: Arc<dyn TokenPlatform>,
    entries: RwLock<BTreeMap<String, TokenEntry>>,
    handles: Mutex<HashMap<String, Box<dyn TokenHandle>>>,
}

impl TokenRegistry {
    pub fn new(
        kv: Arc<dyn KvStore>,
        platform: Arc<dyn TokenPlatform>,
    ) -> Result<Self, StorageError> {
        let entries = match kv.get(KEY_TOKENS)? {
            Some(raw) => serde_json::from_value(raw)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            kv,
            platform,
            entries: RwLock::new(entries),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Create, update, or delete a token.
    ///
    /// A `null` value deletes: the handle is unregistered (failures are
    /// logged, the entry is removed regardless) and the entry dropped.
    /// Otherwise the value is pushed to the existing handle, or a new
    /// handle is registered when none exists. `kind` defaults to the type
    /// inferred from the value.
    pub async fn set_token(
        &self,
        id: &str,
        value: Value,
        kind: Option<TokenKind>,
    ) -> Result<(), TokenError> {
        if value.is_null() {
            let handle = self.handles.lock().await.remove(id);
            if let Some(handle) = handle {
                if let Err(err) = handle.unregister().await {
                    warn!(token = %id, error = %err, "failed to unregister token handle");
                }
            }
            let mut entries = self.entries.write();
            entries.remove(id);
            return Ok(self.persist(&entries)?);
        }

        let kind = match kind {
            Some(kind) => kind,
            None => TokenKind::infer(&value).ok_or(TokenError::UnsupportedValue)?,
        };

        {
            let mut handles = self.handles.lock().await;
            match handles.get(id) {
                Some(handle) => handle
                    .set_value(&value)
                    .await
                    .map_err(TokenError::Platform)?,
                None => {
                    let handle = self
                        .platform
                        .create_token(id, kind, &value)
                        .await
                        .map_err(TokenError::Platform)?;
                    handles.insert(id.to_owned(), handle);
                }
            }
        }

        let mut entries = self.entries.write();
        entries
            .entry(id.to_owned())
            .and_modify(|entry| entry.value = value.clone())
            .or_insert_with(|| TokenEntry {
                id: id.to_owned(),
                kind,
                value,
            });
        Ok(self.persist(&entries)?)
    }

    pub fn get(&self, id: &str) -> Option<TokenEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<TokenEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Reconstruct live handles for every persisted entry. Runs once at
    /// startup; each entry is restored independently so one platform
    /// failure cannot block the rest or prevent the application from
    /// starting.
    pub async fn restore(&self) {
        let entries: Vec<TokenEntry> = self.entries.read().values().cloned().collect();
        let restored = futures::future::join_all(entries.into_iter().map(|entry| async move {
            let handle = self
                .platform
                .create_token(&entry.id, entry.kind, &entry.value)
                .await;
            (entry.id, handle)
        }))
        .await;

        let mut handles = self.handles.lock().await;
        for (id, result) in restored {
            match result {
                Ok(handle) => {
                    handles.insert(id, handle);
                }
                Err(err) => warn!(token = %id, error = %err, "failed to restore token handle"),
            }
        }
        debug!(count = handles.len(), "token handles restored");
    }

    /// Number of live handles. Mostly for reconciliation checks in tests.
    pub async fn live_handles(&self) -> usize {
        self.handles.lock().await.len()
    }

    fn persist(&self, entries: &BTreeMap<String, TokenEntry>) -> Result<(), StorageError> {
        self.kv.set(KEY_TOKENS, serde_json::to_value(entries)?)
    }
}

/// In-memory platform: tokens live in a shared map. Used as the default
/// for embedding without a platform and by tests.
#[derive(Debug, Default)]
pub struct InMemoryTokenPlatform {
    live: Arc<DashMap<String, (TokenKind, Value)>>,
}

impl InMemoryTokenPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_value(&self, id: &str) -> Option<Value> {
        self.live.get(id).map(|entry| entry.value().1.clone())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

struct InMemoryTokenHandle {
    live: Arc<DashMap<String, (TokenKind, Value)>>,
    id: String,
}

#[async_trait]
impl TokenHandle for InMemoryTokenHandle {
    async fn set_value(&self, value: &Value) -> anyhow::Result<()> {
        match self.live.get_mut(&self.id) {
            Some(mut entry) => {
                entry.value_mut().1 = value.clone();
                Ok(())
            }
            None => Err(anyhow::anyhow!("token {} is no longer registered", self.id)),
        }
    }

    async fn unregister(&self) -> anyhow::Result<()> {
        self.live.remove(&self.id);
        Ok(())
    }
}

#[async_trait]
impl TokenPlatform for InMemoryTokenPlatform {
    async fn create_token(
        &self,
        id: &str,
        kind: TokenKind,
        value: &Value,
    ) -> anyhow::Result<Box<dyn TokenHandle>> {
        if self.live.contains_key(id) {
            return Err(anyhow::anyhow!("token {id} is already registered"));
        }
        self.live.insert(id.to_owned(), (kind, value.clone()));
        Ok(Box::new(InMemoryTokenHandle {
            live: Arc::clone(&self.live),
            id: id.to_owned(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn registry() -> (TokenRegistry, Arc<InMemoryTokenPlatform>) {
        let platform = Arc::new(InMemoryTokenPlatform::new());
        let registry = TokenRegistry::new(MemoryStore::shared(), platform.clone()).unwrap();
        (registry, platform)
    }

    #[tokio::test]
    async fn create_registers_entry_and_handle() {
        let (registry, platform) = registry();
        registry.set_token("temp", json!(21.5), None).await.unwrap();

        let entry = registry.get("temp").unwrap();
        assert_eq!(entry.kind, TokenKind::Number);
        assert_eq!(entry.value, json!(21.5));
        assert_eq!(platform.live_value("temp"), Some(json!(21.5)));
        assert_eq!(registry.live_handles().await, 1);
    }

    #[tokio::test]
    async fn update_pushes_value_to_existing_handle() {
        let (registry, platform) = registry();
        registry.set_token("mode", json!("day"), None).await.unwrap();
        registry.set_token("mode", json!("night"), None).await.unwrap();

        assert_eq!(registry.get("mode").unwrap().value, json!("night"));
        assert_eq!(platform.live_value("mode"), Some(json!("night")));
        // Updating never registers a second handle.
        assert_eq!(registry.live_handles().await, 1);
    }

    #[tokio::test]
    async fn null_deletes_entry_and_handle() {
        let (registry, platform) = registry();
        registry.set_token("gone", json!(5), None).await.unwrap();
        registry.set_token("gone", Value::Null, None).await.unwrap();

        assert!(registry.get("gone").is_none());
        assert_eq!(platform.live_value("gone"), None);
        assert_eq!(registry.live_handles().await, 0);
        assert_eq!(platform.live_count(), 0);
    }

    #[tokio::test]
    async fn deleting_an_absent_token_is_a_no_op() {
        let (registry, _) = registry();
        registry.set_token("ghost", Value::Null, None).await.unwrap();
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn compound_values_are_rejected() {
        let (registry, _) = registry();
        let err = registry
            .set_token("bad", json!({"nested": true}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::UnsupportedValue));
    }

    #[tokio::test]
    async fn restore_rebuilds_handles_from_persisted_entries() {
        let kv = MemoryStore::shared();
        {
            let platform = Arc::new(InMemoryTokenPlatform::new());
            let registry = TokenRegistry::new(kv.clone(), platform).unwrap();
            registry.set_token("a", json!(1), None).await.unwrap();
            registry.set_token("b", json!("x"), None).await.unwrap();
        }

        // Fresh platform, as after a process restart.
        let platform = Arc::new(InMemoryTokenPlatform::new());
        let registry = TokenRegistry::new(kv, platform.clone()).unwrap();
        registry.restore().await;

        assert_eq!(registry.live_handles().await, 2);
        assert_eq!(platform.live_value("a"), Some(json!(1)));
        assert_eq!(platform.live_value("b"), Some(json!("x")));
    }

    #[tokio::test]
    async fn restore_isolates_per_entry_failures() {
        struct FlakyPlatform {
            inner: InMemoryTokenPlatform,
        }

        #[async_trait]
        impl TokenPlatform for FlakyPlatform {
            async fn create_token(
                &self,
                id: &str,
                kind: TokenKind,
                value: &Value,
            ) -> anyhow::Result<Box<dyn TokenHandle>> {
                if id == "broken" {
                    return Err(anyhow::anyhow!("platform rejected {id}"));
                }
                self.inner.create_token(id, kind, value).await
            }
        }

        let kv = MemoryStore::shared();
        kv.set(
            KEY_TOKENS,
            json!({
                "broken": {"id": "broken", "type": "number", "value": 1},
                "fine": {"id": "fine", "type": "string", "value": "ok"},
            }),
        )
        .unwrap();

        let platform = Arc::new(FlakyPlatform {
            inner: InMemoryTokenPlatform::new(),
        });
        let registry = TokenRegistry::new(kv, platform).unwrap();
        registry.restore().await;

        // The broken entry is skipped, the rest come up.
        assert_eq!(registry.live_handles().await, 1);
    }
}
