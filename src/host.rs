//! ScriptHost facade.
//!
//! Wires the registries, the execution engine, and the realtime log
//! channel together, and exposes the command surface the surrounding
//! application calls.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::autocomplete::{AutocompleteIndex, ScriptHit};
use crate::config::{RuntimeConfig, INLINE_SCRIPT_ID, REALTIME_CHANNEL_CAPACITY};
use crate::error::HostError;
use crate::globals::GlobalNamespace;
use crate::host_api::{HostApiProvider, NullHostApiProvider};
use crate::logging::warn;
use crate::migrations;
use crate::sandbox::{ExecutionEngine, ExecutionReport, LogEvent, ScriptMeta};
use crate::scripts::{ScriptDefinition, ScriptStore, UpdatePatch};
use crate::storage::KvStore;
use crate::tokens::{InMemoryTokenPlatform, TokenPlatform, TokenRegistry};

/// What to execute: a stored script or ad-hoc code.
#[derive(Debug, Clone)]
pub enum Program {
    ScriptId(String),
    Inline(String),
}

/// One execution request. Not persisted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub program: Program,
    pub args: Vec<Value>,
    /// Stream every log line to realtime subscribers.
    pub realtime: bool,
}

impl ExecutionRequest {
    pub fn script(id: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            program: Program::ScriptId(id.into()),
            args,
            realtime: false,
        }
    }

    pub fn inline(code: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            program: Program::Inline(code.into()),
            args,
            realtime: false,
        }
    }

    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }
}

pub struct ScriptHostBuilder {
    kv: Arc<dyn KvStore>,
    platform: Arc<dyn TokenPlatform>,
    host_api: Arc<dyn HostApiProvider>,
    config: RuntimeConfig,
}

impl ScriptHostBuilder {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            platform: Arc::new(InMemoryTokenPlatform::new()),
            host_api: Arc::new(NullHostApiProvider),
            config: RuntimeConfig::default(),
        }
    }

    pub fn platform(mut self, platform: Arc<dyn TokenPlatform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn host_api(mut self, host_api: Arc<dyn HostApiProvider>) -> Self {
        self.host_api = host_api;
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Run migrations, load (or seed) the registries, restore token
    /// handles, and wire the engine. Startup faults that are not
    /// persistence failures are logged, never raised.
    pub async fn bootstrap(self) -> anyhow::Result<Arc<ScriptHost>> {
        migrations::run_pending(self.kv.as_ref())?;

        let store = Arc::new(ScriptStore::open(Arc::clone(&self.kv), &self.config)?);
        let tokens = Arc::new(TokenRegistry::new(Arc::clone(&self.kv), self.platform)?);
        tokens.restore().await;
        let globals = Arc::new(GlobalNamespace::new(Arc::clone(&self.kv)));

        let (realtime, _) = broadcast::channel(REALTIME_CHANNEL_CAPACITY);
        let engine = ExecutionEngine::new(
            self.config.limits.clone(),
            Arc::clone(&tokens),
            Arc::clone(&globals),
            self.host_api,
            realtime.clone(),
        );

        Ok(Arc::new(ScriptHost {
            autocomplete: AutocompleteIndex::new(Arc::clone(&store)),
            store,
            tokens,
            globals,
            engine,
            realtime,
        }))
    }
}

pub struct ScriptHost {
    store: Arc<ScriptStore>,
    tokens: Arc<TokenRegistry>,
    globals: Arc<GlobalNamespace>,
    engine: ExecutionEngine,
    autocomplete: AutocompleteIndex,
    realtime: broadcast::Sender<LogEvent>,
}

impl ScriptHost {
    pub fn builder(kv: Arc<dyn KvStore>) -> ScriptHostBuilder {
        ScriptHostBuilder::new(kv)
    }

    pub fn list(&self) -> Vec<ScriptDefinition> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Result<ScriptDefinition, HostError> {
        Ok(self.store.get(id)?)
    }

    pub fn create(&self, name: &str, code: &str) -> Result<ScriptDefinition, HostError> {
        Ok(self.store.create(name, code)?)
    }

    pub fn update(&self, id: &str, patch: UpdatePatch) -> Result<ScriptDefinition, HostError> {
        Ok(self.store.update(id, patch)?)
    }

    pub fn delete(&self, id: &str) -> Result<(), HostError> {
        Ok(self.store.delete(id)?)
    }

    pub fn search(&self, query: &str) -> Vec<ScriptHit> {
        self.autocomplete.search(query)
    }

    /// Run a stored script. The result (or normalized error) comes back
    /// and the execution timestamp is recorded either way.
    pub async fn run_script(&self, id: &str, args: Vec<Value>) -> Result<Value, HostError> {
        let report = self.execute(ExecutionRequest::script(id, args)).await?;
        Ok(report.outcome?)
    }

    /// Run ad-hoc code under the inline sentinel id.
    pub async fn run_code(&self, code: &str, args: Vec<Value>) -> Result<Value, HostError> {
        let report = self.execute(ExecutionRequest::inline(code, args)).await?;
        Ok(report.outcome?)
    }

    /// Full-form execution: returns the report with the captured log.
    /// Registry misses propagate untouched; execution failures live in
    /// the report's outcome.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionReport, HostError> {
        let (meta, code, stored) = match &request.program {
            Program::ScriptId(id) => {
                let def = self.store.get(id)?;
                (
                    ScriptMeta {
                        id: def.id.clone(),
                        name: def.name.clone(),
                        last_executed: def.last_executed,
                    },
                    def.code,
                    true,
                )
            }
            Program::Inline(code) => (
                ScriptMeta {
                    id: INLINE_SCRIPT_ID.to_owned(),
                    name: INLINE_SCRIPT_ID.trim_matches('_').to_owned(),
                    last_executed: Some(Utc::now()),
                },
                code.clone(),
                false,
            ),
        };

        let report = self
            .engine
            .run(meta.clone(), &code, request.args, request.realtime)
            .await;

        if stored {
            if let Err(err) = self.store.record_execution(&meta.id, Utc::now()) {
                warn!(script = %meta.id, error = %err, "failed to record execution time");
            }
        }
        Ok(report)
    }

    /// Subscribe to the realtime log stream. Only runs started with the
    /// realtime flag publish here.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.realtime.subscribe()
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    pub fn globals(&self) -> &Arc<GlobalNamespace> {
        &self.globals
    }
}
