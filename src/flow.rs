//! Automation-trigger ("flow card") bindings.
//!
//! The platform invokes these handlers with structured arguments; the
//! registration mechanics live outside this crate. Script pickers are
//! backed by the autocomplete index.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::autocomplete::ScriptHit;
use crate::error::HostError;
use crate::host::ScriptHost;

pub struct FlowBindings {
    host: Arc<ScriptHost>,
}

impl FlowBindings {
    pub fn new(host: Arc<ScriptHost>) -> Self {
        Self { host }
    }

    /// Picker items for the card's script argument.
    pub fn autocomplete(&self, query: &str) -> Vec<ScriptHit> {
        self.host.search(query)
    }

    /// "Run script" card.
    pub async fn run_script(&self, script: &ScriptHit) -> Result<(), HostError> {
        self.host.run_script(&script.id, vec![]).await.map(|_| ())
    }

    /// "Run script with argument" card: the single text argument becomes
    /// `args[0]`.
    pub async fn run_script_with_arg(
        &self,
        script: &ScriptHit,
        argument: &str,
    ) -> Result<(), HostError> {
        self.host
            .run_script(&script.id, vec![json!(argument)])
            .await
            .map(|_| ())
    }

    /// "Run inline code with argument, return string" card: the result is
    /// rendered into a string-typed field. String results pass through
    /// unquoted; everything else is JSON.
    pub async fn run_code_with_arg(
        &self,
        code: &str,
        argument: &str,
    ) -> Result<String, HostError> {
        let value = self.host.run_code(code, vec![json!(argument)]).await?;
        Ok(match value {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }
}
