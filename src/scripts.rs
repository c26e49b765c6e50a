//! Script registry.
//!
//! Owns the persisted `id -> ScriptDefinition` map. The registry keeps an
//! in-memory mirror and writes the whole map back through the key-value
//! store on every mutation; mutations are serialized by the mirror lock.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{
    RuntimeConfig, EXAMPLE_SCRIPT_PREFIX, KEY_SCRIPTS, LEGACY_LAST_EXECUTED_PREFIX,
};
use crate::error::{StorageError, StoreError};
use crate::logging::{debug, warn};
use crate::storage::KvStore;

/// Example scripts seeded into an empty registry.
const BUNDLED_SCRIPTS: &[(&str, &str)] = &[
    ("welcome", include_str!("../bundled/welcome.js")),
    ("web-request", include_str!("../bundled/web-request.js")),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(rename = "lastExecuted", default)]
    pub last_executed: Option<DateTime<Utc>>,
}

/// Partial update: only the provided fields are merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

pub struct ScriptStore {
    kv: Arc<dyn KvStore>,
    scripts: RwLock<BTreeMap<String, ScriptDefinition>>,
}

impl ScriptStore {
    /// Load the registry, seeding it on first boot from the bundled
    /// examples and any legacy per-script files on disk.
    pub fn open(kv: Arc<dyn KvStore>, config: &RuntimeConfig) -> Result<Self, StorageError> {
        let store = Self {
            kv,
            scripts: RwLock::new(BTreeMap::new()),
        };

        match store.kv.get(KEY_SCRIPTS)? {
            Some(raw) => store.load(raw),
            None => store.seed(config)?,
        }
        Ok(store)
    }

    fn load(&self, raw: Value) {
        let Value::Object(entries) = raw else {
            warn!("script registry is not an object, starting empty");
            return;
        };
        let mut scripts = self.scripts.write();
        for (key, entry) in entries {
            match serde_json::from_value::<ScriptDefinition>(entry) {
                Ok(def) => {
                    scripts.insert(key, def);
                }
                Err(err) => warn!(script = %key, error = %err, "skipping unreadable script entry"),
            }
        }
    }

    fn seed(&self, config: &RuntimeConfig) -> Result<(), StorageError> {
        let mut scripts = self.scripts.write();

        if config.seed_examples {
            for (stem, code) in BUNDLED_SCRIPTS {
                let id = format!("{EXAMPLE_SCRIPT_PREFIX}{stem}");
                scripts.insert(
                    id.clone(),
                    ScriptDefinition {
                        id,
                        name: (*stem).to_owned(),
                        code: (*code).to_owned(),
                        last_executed: None,
                    },
                );
            }
        }

        if let Some(dir) = &config.legacy_scripts_dir {
            self.import_legacy(dir, &mut scripts)?;
        }

        debug!(count = scripts.len(), "seeded script registry");
        self.persist(&scripts)
    }

    /// One-file-per-script layout used before the registry existed:
    /// `<id>.js` on disk, last execution under a per-id record.
    fn import_legacy(
        &self,
        dir: &Path,
        scripts: &mut BTreeMap<String, ScriptDefinition>,
    ) -> Result<(), StorageError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "no legacy scripts to import");
                return Ok(());
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("js") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let code = match std::fs::read_to_string(&path) {
                Ok(code) => code,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable legacy script");
                    continue;
                }
            };
            let id = stem.to_owned();
            let last_executed = self
                .kv
                .get(&format!("{LEGACY_LAST_EXECUTED_PREFIX}{id}"))?
                .and_then(parse_legacy_timestamp);
            scripts.insert(
                id.clone(),
                ScriptDefinition {
                    id,
                    name: stem.to_owned(),
                    code,
                    last_executed,
                },
            );
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<ScriptDefinition> {
        self.scripts.read().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<ScriptDefinition, StoreError> {
        self.scripts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))
    }

    pub fn create(&self, name: &str, code: &str) -> Result<ScriptDefinition, StoreError> {
        let def = ScriptDefinition {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            code: code.to_owned(),
            last_executed: None,
        };
        let mut scripts = self.scripts.write();
        scripts.insert(def.id.clone(), def.clone());
        self.persist(&scripts)?;
        Ok(def)
    }

    /// Merge the provided fields into an existing definition. Unknown ids
    /// fail with NotFound; update never creates entries.
    pub fn update(&self, id: &str, patch: UpdatePatch) -> Result<ScriptDefinition, StoreError> {
        let mut scripts = self.scripts.write();
        let def = scripts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        if let Some(name) = patch.name {
            def.name = name;
        }
        if let Some(code) = patch.code {
            def.code = code;
        }
        let updated = def.clone();
        self.persist(&scripts)?;
        Ok(updated)
    }

    /// Idempotent: deleting an absent id is a no-op.
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut scripts = self.scripts.write();
        if scripts.remove(id).is_some() {
            self.persist(&scripts)?;
        }
        Ok(())
    }

    /// Stamp the last execution time. An id deleted while its run was in
    /// flight is logged and ignored.
    pub fn record_execution(&self, id: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let mut scripts = self.scripts.write();
        match scripts.get_mut(id) {
            Some(def) => {
                def.last_executed = Some(ts);
                self.persist(&scripts)?;
            }
            None => warn!(script = %id, "not recording execution for unknown script"),
        }
        Ok(())
    }

    fn persist(&self, scripts: &BTreeMap<String, ScriptDefinition>) -> Result<(), StorageError> {
        self.kv.set(KEY_SCRIPTS, serde_json::to_value(scripts)?)
    }
}

/// Legacy records stored either an RFC 3339 string or epoch milliseconds.
fn parse_legacy_timestamp(value: Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(ms) => ms
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn empty_config() -> RuntimeConfig {
        RuntimeConfig {
            seed_examples: false,
            ..RuntimeConfig::default()
        }
    }

    fn open_empty() -> ScriptStore {
        ScriptStore::open(MemoryStore::shared(), &empty_config()).unwrap()
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = open_empty();
        let def = store.create("My Script", "return 1+1").unwrap();

        let fetched = store.get(&def.id).unwrap();
        assert_eq!(fetched.name, "My Script");
        assert_eq!(fetched.code, "return 1+1");
        assert_eq!(fetched.last_executed, None);
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let store = open_empty();
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn update_merges_only_provided_fields() {
        let store = open_empty();
        let def = store.create("name", "old code").unwrap();

        let updated = store
            .update(
                &def.id,
                UpdatePatch {
                    code: Some("new code".into()),
                    ..UpdatePatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, "name");
        assert_eq!(updated.code, "new code");
        assert_eq!(updated.id, def.id);

        let untouched = store.update(&def.id, UpdatePatch::default()).unwrap();
        assert_eq!(untouched, updated);
    }

    #[test]
    fn update_unknown_id_does_not_create() {
        let store = open_empty();
        assert!(matches!(
            store.update("ghost", UpdatePatch::default()),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list().is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = open_empty();
        let def = store.create("n", "c").unwrap();

        store.delete(&def.id).unwrap();
        assert!(matches!(store.get(&def.id), Err(StoreError::NotFound(_))));
        store.delete(&def.id).unwrap();
    }

    #[test]
    fn record_execution_sets_timestamp() {
        let store = open_empty();
        let def = store.create("n", "c").unwrap();
        let ts = Utc::now();

        store.record_execution(&def.id, ts).unwrap();
        assert_eq!(store.get(&def.id).unwrap().last_executed, Some(ts));
    }

    #[test]
    fn first_boot_seeds_bundled_examples() {
        let kv = MemoryStore::shared();
        let store = ScriptStore::open(kv.clone(), &RuntimeConfig::default()).unwrap();

        let ids: Vec<String> = store.list().into_iter().map(|def| def.id).collect();
        assert!(ids.iter().any(|id| id == "example-welcome"));
        assert!(ids.iter().any(|id| id == "example-web-request"));
        // Seeding persisted the registry.
        assert!(kv.get(KEY_SCRIPTS).unwrap().is_some());
    }

    #[test]
    fn existing_registry_is_not_reseeded() {
        let kv = MemoryStore::shared();
        kv.set(KEY_SCRIPTS, json!({})).unwrap();

        let store = ScriptStore::open(kv, &RuntimeConfig::default()).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn legacy_scripts_are_imported_with_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old-script.js"), "return 'legacy'").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a script").unwrap();

        let kv = MemoryStore::shared();
        kv.set("lastExecuted-old-script", json!("2023-04-01T12:00:00Z"))
            .unwrap();

        let config = RuntimeConfig {
            legacy_scripts_dir: Some(dir.path().to_path_buf()),
            seed_examples: false,
            ..RuntimeConfig::default()
        };
        let store = ScriptStore::open(kv, &config).unwrap();

        let def = store.get("old-script").unwrap();
        assert_eq!(def.name, "old-script");
        assert_eq!(def.code, "return 'legacy'");
        assert_eq!(
            def.last_executed,
            Some(Utc.with_ymd_and_hms(2023, 4, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn missing_legacy_dir_is_ignored() {
        let config = RuntimeConfig {
            legacy_scripts_dir: Some("/definitely/not/here".into()),
            seed_examples: false,
            ..RuntimeConfig::default()
        };
        let store = ScriptStore::open(MemoryStore::shared(), &config).unwrap();
        assert!(store.list().is_empty());
    }
}
