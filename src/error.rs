//! Unified error handling.
//!
//! Registry errors propagate untouched; everything that happens on the
//! execution path is normalized into [`ScriptError`] before it crosses
//! back to the caller, so transport layers never see engine internals.

use serde::Serialize;
use thiserror::Error;

/// Faults raised by the persisted key-value collaborator. Treated as
/// fatal: this core does not attempt recovery from a failing store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Script registry errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("script not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Token registry errors.
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("token value must be a string, number, or boolean")]
    UnsupportedValue,

    #[error("token platform failure: {0}")]
    Platform(anyhow::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Classification of a failed script run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptErrorKind {
    /// The code failed to parse. Positions are corrected for the wrapper
    /// so they match the user-visible source.
    Compile {
        line: Option<u32>,
        column: Option<u32>,
    },
    /// A value was thrown during execution, or an injected capability
    /// failed.
    Runtime,
    /// The run exceeded the wall-clock budget.
    Timeout,
}

/// Normalized execution error: message plus stack, nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub kind: ScriptErrorKind,
    pub message: String,
    pub stack: String,
}

impl ScriptError {
    pub fn compile(message: impl Into<String>, line: Option<u32>, column: Option<u32>) -> Self {
        let message = message.into();
        Self {
            kind: ScriptErrorKind::Compile { line, column },
            stack: message.clone(),
            message,
        }
    }

    /// A thrown value or capability failure. The stack falls back to the
    /// message when the thrown value carried none.
    pub fn runtime(message: impl Into<String>, stack: Option<String>) -> Self {
        let message = message.into();
        let stack = stack.unwrap_or_else(|| message.clone());
        Self {
            kind: ScriptErrorKind::Runtime,
            message,
            stack,
        }
    }

    pub fn timeout(budget_ms: u64) -> Self {
        let message = format!("script exceeded the {budget_ms} ms execution budget");
        Self {
            kind: ScriptErrorKind::Timeout,
            stack: message.clone(),
            message,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ScriptErrorKind::Timeout)
    }
}

/// Errors surfaced by the [`crate::host::ScriptHost`] command surface.
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}
