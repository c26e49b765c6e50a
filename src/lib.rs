//! flowscript
//!
//! Embeddable runtime for user-authored automation scripts: a persisted
//! script registry, a sandboxed JavaScript execution engine with a fixed
//! injected capability surface and a wall-clock budget, structured log
//! capture with an optional realtime stream, and a token registry that
//! reconciles persisted named values with live platform handles.
//!
//! The surrounding application supplies the collaborators: a [`KvStore`]
//! for persistence, a [`TokenPlatform`] for live tokens, and a
//! [`HostApiProvider`] for per-run host-API sessions. Everything else is
//! wired by [`ScriptHost::builder`].

pub mod autocomplete;
pub mod config;
pub mod error;
pub mod flow;
pub mod globals;
pub mod host;
pub mod host_api;
pub mod logging;
pub mod migrations;
pub mod sandbox;
pub mod scripts;
pub mod storage;
pub mod tokens;

// Re-export commonly used types for convenience
pub use autocomplete::{AutocompleteIndex, ScriptHit};
pub use config::RuntimeConfig;
pub use error::{HostError, ScriptError, ScriptErrorKind, StorageError, StoreError, TokenError};
pub use flow::FlowBindings;
pub use globals::GlobalNamespace;
pub use host::{ExecutionRequest, Program, ScriptHost, ScriptHostBuilder};
pub use host_api::{HostApi, HostApiProvider, NullHostApi, NullHostApiProvider};
pub use sandbox::{
    ExecutionEngine, ExecutionReport, LogEvent, SandboxLimits, ScriptMeta,
};
pub use scripts::{ScriptDefinition, ScriptStore, UpdatePatch};
pub use storage::{JsonFileStore, KvStore, MemoryStore};
pub use tokens::{
    InMemoryTokenPlatform, TokenEntry, TokenHandle, TokenKind, TokenPlatform, TokenRegistry,
};
