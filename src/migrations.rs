//! One-shot schema migrations.
//!
//! Migrations are an ordered, integer-indexed registry. Each index is
//! checked against the persisted applied set before running, and every
//! migration must be idempotent so a crash between apply and marker
//! persistence cannot corrupt data on the retry.

use serde_json::Value;

use crate::config::{KEY_MIGRATIONS, KEY_SCRIPTS};
use crate::error::StorageError;
use crate::logging::debug;
use crate::storage::KvStore;

pub struct Migration {
    pub index: u32,
    pub name: &'static str,
    pub apply: fn(&dyn KvStore) -> Result<(), StorageError>,
}

/// All known migrations, in application order.
pub fn registered() -> &'static [Migration] {
    &[Migration {
        index: 0,
        name: "backfill-script-identity",
        apply: backfill_script_identity,
    }]
}

/// Run every registered migration that has not been applied yet.
pub fn run_pending(kv: &dyn KvStore) -> Result<(), StorageError> {
    run(kv, registered())
}

pub(crate) fn run(kv: &dyn KvStore, migrations: &[Migration]) -> Result<(), StorageError> {
    let mut applied: Vec<u32> = match kv.get(KEY_MIGRATIONS)? {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };

    for migration in migrations {
        if applied.contains(&migration.index) {
            continue;
        }
        debug!(index = migration.index, name = migration.name, "applying migration");
        (migration.apply)(kv)?;
        applied.push(migration.index);
        kv.set(KEY_MIGRATIONS, serde_json::to_value(&applied)?)?;
    }

    Ok(())
}

/// Migration 0: early registries stored entries keyed by name only, with
/// no `id`/`name` fields on the entry itself. Backfill both from the
/// registry key.
fn backfill_script_identity(kv: &dyn KvStore) -> Result<(), StorageError> {
    let Some(Value::Object(mut scripts)) = kv.get(KEY_SCRIPTS)? else {
        return Ok(());
    };

    let mut changed = false;
    for (key, entry) in scripts.iter_mut() {
        let Some(fields) = entry.as_object_mut() else {
            continue;
        };
        for field in ["id", "name"] {
            if !fields.contains_key(field) {
                fields.insert(field.to_owned(), Value::String(key.clone()));
                changed = true;
            }
        }
    }

    if changed {
        kv.set(KEY_SCRIPTS, Value::Object(scripts))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn backfills_missing_identity_fields() {
        let kv = MemoryStore::new();
        kv.set(
            KEY_SCRIPTS,
            json!({
                "My Script": {"code": "return 1"},
                "complete": {"id": "complete", "name": "Complete", "code": ""},
            }),
        )
        .unwrap();

        run_pending(&kv).unwrap();

        assert_eq!(
            kv.get(KEY_SCRIPTS).unwrap().unwrap(),
            json!({
                "My Script": {"id": "My Script", "name": "My Script", "code": "return 1"},
                "complete": {"id": "complete", "name": "Complete", "code": ""},
            })
        );
        assert_eq!(kv.get(KEY_MIGRATIONS).unwrap().unwrap(), json!([0]));
    }

    #[test]
    fn second_run_changes_nothing() {
        let kv = MemoryStore::new();
        kv.set(KEY_SCRIPTS, json!({"s": {"code": "x"}})).unwrap();

        run_pending(&kv).unwrap();
        let first = kv.get(KEY_SCRIPTS).unwrap();

        run_pending(&kv).unwrap();
        assert_eq!(kv.get(KEY_SCRIPTS).unwrap(), first);
        assert_eq!(kv.get(KEY_MIGRATIONS).unwrap().unwrap(), json!([0]));
    }

    #[test]
    fn runs_without_a_registry() {
        let kv = MemoryStore::new();
        run_pending(&kv).unwrap();
        assert_eq!(kv.get(KEY_MIGRATIONS).unwrap().unwrap(), json!([0]));
    }

    #[test]
    fn applies_only_unapplied_indexes() {
        fn mark(kv: &dyn KvStore) -> Result<(), StorageError> {
            let n = kv
                .get("marker")?
                .and_then(|v| v.as_i64())
                .unwrap_or_default();
            kv.set("marker", json!(n + 1))
        }

        let table = [
            Migration { index: 0, name: "a", apply: mark },
            Migration { index: 1, name: "b", apply: mark },
        ];

        let kv = MemoryStore::new();
        kv.set(KEY_MIGRATIONS, json!([0])).unwrap();
        run(&kv, &table).unwrap();

        assert_eq!(kv.get("marker").unwrap().unwrap(), json!(1));
        assert_eq!(kv.get(KEY_MIGRATIONS).unwrap().unwrap(), json!([0, 1]));
    }
}
