//! Host-API collaborator seam.
//!
//! Each script run borrows exactly one host-API session for its lifetime.
//! The engine acquires it before injection and releases it on every exit
//! path; sessions are never shared across concurrent runs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::logging::debug;

/// One per-run session against the host application's API.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Generic API call, e.g. `call("GET", "/devices")`.
    async fn call(&self, method: &str, path: &str, body: Option<Value>) -> anyhow::Result<Value>;

    /// Speech output shortcut.
    async fn speak(&self, text: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait HostApiProvider: Send + Sync {
    async fn acquire(&self, script_id: &str) -> anyhow::Result<Arc<dyn HostApi>>;

    async fn release(&self, session: Arc<dyn HostApi>) -> anyhow::Result<()>;
}

/// Headless default: `say` is logged and dropped, API calls fail. Scripts
/// that never touch `api`/`say` run unaffected.
#[derive(Debug, Default)]
pub struct NullHostApi;

#[async_trait]
impl HostApi for NullHostApi {
    async fn call(&self, method: &str, path: &str, _body: Option<Value>) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!("no host api attached: {method} {path}"))
    }

    async fn speak(&self, text: &str) -> anyhow::Result<()> {
        debug!(text = %text, "say() without a host api, dropping");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NullHostApiProvider;

#[async_trait]
impl HostApiProvider for NullHostApiProvider {
    async fn acquire(&self, _script_id: &str) -> anyhow::Result<Arc<dyn HostApi>> {
        Ok(Arc::new(NullHostApi))
    }

    async fn release(&self, _session: Arc<dyn HostApi>) -> anyhow::Result<()> {
        Ok(())
    }
}
