//! Name search over the script registry.
//!
//! Read-only derived view used by the automation-trigger pickers: plain
//! case-insensitive substring matching, no ranking, results in registry
//! iteration order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::scripts::ScriptStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptHit {
    pub id: String,
    pub name: String,
}

pub struct AutocompleteIndex {
    store: Arc<ScriptStore>,
}

impl AutocompleteIndex {
    pub fn new(store: Arc<ScriptStore>) -> Self {
        Self { store }
    }

    pub fn search(&self, query: &str) -> Vec<ScriptHit> {
        let needle = query.to_lowercase();
        self.store
            .list()
            .into_iter()
            .filter(|def| def.name.to_lowercase().contains(&needle))
            .map(|def| ScriptHit {
                id: def.id,
                name: def.name,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::storage::MemoryStore;

    fn index_with(names: &[&str]) -> AutocompleteIndex {
        let config = RuntimeConfig {
            seed_examples: false,
            ..RuntimeConfig::default()
        };
        let store = Arc::new(ScriptStore::open(MemoryStore::shared(), &config).unwrap());
        for name in names {
            store.create(name, "").unwrap();
        }
        AutocompleteIndex::new(store)
    }

    #[test]
    fn matches_are_case_insensitive() {
        let index = index_with(&["Foo Lights", "morning", "FOOD"]);
        let hits = index.search("foo");
        let names: Vec<&str> = hits.iter().map(|hit| hit.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Foo Lights"));
        assert!(names.contains(&"FOOD"));
    }

    #[test]
    fn empty_query_returns_everything() {
        let index = index_with(&["a", "b"]);
        assert_eq!(index.search("").len(), 2);
    }

    #[test]
    fn results_follow_registry_order() {
        let index = index_with(&["zeta", "alpha"]);
        let hits = index.search("");
        // Registry iteration order is by id, so repeated searches agree.
        assert_eq!(hits, index.search(""));
    }
}
