//! Sandboxed script execution.
//!
//! Boa runs each script in a fresh context on a dedicated worker thread,
//! with the host side enforcing the wall-clock budget and bridging async
//! capability calls onto the tokio runtime.

pub mod engine;
pub mod executor;
pub mod inject;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

pub use engine::{SandboxLimits, SandboxRuntime};
pub use executor::{ExecutionEngine, ExecutionReport};
pub use inject::CapabilityBinding;

/// Identity of the script a run executes under. Ad-hoc code gets the
/// inline sentinel id and the current time as its last execution.
#[derive(Debug, Clone)]
pub struct ScriptMeta {
    pub id: String,
    pub name: String,
    pub last_executed: Option<DateTime<Utc>>,
}

/// One log line pushed to realtime subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub text: String,
    pub script: String,
}

/// Per-run log sink. Lines are always captured locally and mirrored to
/// tracing; runs started with the realtime flag additionally broadcast
/// every line to live subscribers.
#[derive(Clone)]
pub struct RunLog {
    script_id: String,
    lines: Arc<Mutex<Vec<String>>>,
    realtime: Option<broadcast::Sender<LogEvent>>,
}

impl RunLog {
    pub fn new(script_id: String, realtime: Option<broadcast::Sender<LogEvent>>) -> Self {
        Self {
            script_id,
            lines: Arc::new(Mutex::new(Vec::new())),
            realtime,
        }
    }

    pub fn record(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(target: "flowscript::script", script = %self.script_id, "{text}");
        self.lines.lock().push(text.clone());
        if let Some(tx) = &self.realtime {
            let _ = tx.send(LogEvent {
                text,
                script: self.script_id.clone(),
            });
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}
