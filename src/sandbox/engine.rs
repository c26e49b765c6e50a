//! Boa sandbox runtime.
//!
//! A Boa `Context` is not `Send`, so every run owns a dedicated worker
//! thread holding one fresh context. The host side talks to it over a
//! channel and enforces the wall-clock budget; a worker that blows the
//! budget is abandoned, never joined.

use anyhow::{anyhow, Result};
use boa_engine::{builtins::promise::PromiseState, Context, JsError, JsValue, Source};
use crossbeam::channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::ScriptError;
use crate::logging::warn;

/// Lines the execution wrapper prepends to user code.
pub const SOURCE_LINE_OFFSET: u32 = 1;

/// Execution limits for one sandboxed run.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Maximum wall-clock execution time in milliseconds.
    pub max_execution_time_ms: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000,
        }
    }
}

impl SandboxLimits {
    fn budget(&self) -> Duration {
        Duration::from_millis(self.max_execution_time_ms)
    }
}

/// Wrap user code so its top level may await, and so the body only starts
/// evaluating once the synchronous wrapper has finished: the budget then
/// covers the asynchronous tail, not just the initial burst. The prefix
/// is a single line, giving a fixed offset for reported positions.
pub fn wrap_source(code: &str) -> String {
    format!("Promise.resolve().then(async () => {{\n{code}\n}})")
}

/// Result of a successful evaluation. `lossy` marks a return value that
/// could not be serialized and degraded to `null`.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub value: Value,
    pub lossy: bool,
}

/// A sandboxed Boa context (not Send); lives on the worker thread.
struct SandboxWorker {
    context: Context,
}

impl SandboxWorker {
    fn new() -> Result<Self> {
        let mut context = Context::default();
        Self::lock_down(&mut context)?;
        Ok(Self { context })
    }

    fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Remove escape hatches from the global scope. Everything a script
    /// may touch is injected explicitly.
    fn lock_down(context: &mut Context) -> Result<()> {
        let dangerous = ["eval", "Function", "require", "import"];
        for api in dangerous {
            let code = format!("delete globalThis.{}", api);
            context
                .eval(Source::from_bytes(code.as_bytes()))
                .map_err(|e| anyhow!("Failed to disable {}: {}", api, e))?;
        }

        // Prevent prototype pollution attempts via __proto__ access.
        context
            .eval(Source::from_bytes(
                b"delete Object.prototype.__proto__;" as &[u8],
            ))
            .map_err(|e| anyhow!("Failed to lock down __proto__: {}", e))?;

        Ok(())
    }

    fn execute(&mut self, code: &str) -> Result<EvalOutcome, ScriptError> {
        let source = Source::from_bytes(code);
        let value = match self.context.eval(source) {
            Ok(value) => value,
            Err(err) => return Err(self.normalize_error(err)),
        };

        if let Err(err) = self.context.run_jobs() {
            let js_err = JsError::from_opaque(err.to_opaque(&mut self.context));
            return Err(self.normalize_error(js_err));
        }

        if value.is_promise() {
            self.resolve_promise(value)
        } else {
            Ok(self.value_to_json(&value))
        }
    }

    fn resolve_promise(&mut self, value: JsValue) -> Result<EvalOutcome, ScriptError> {
        let promise = value
            .as_promise()
            .ok_or_else(|| ScriptError::runtime("expected the wrapper to produce a promise", None))?;

        match promise.state() {
            PromiseState::Pending => Err(ScriptError::runtime(
                "script did not settle before the job queue drained",
                None,
            )),
            PromiseState::Fulfilled(result) => Ok(self.value_to_json(&result)),
            PromiseState::Rejected(reason) => Err(normalize_thrown(&reason, &mut self.context)),
        }
    }

    fn normalize_error(&mut self, err: JsError) -> ScriptError {
        let rendered = err.to_string();
        if rendered.contains("SyntaxError") {
            let (message, line, column) = fix_source_position(&rendered, SOURCE_LINE_OFFSET);
            return ScriptError::compile(message, line, column);
        }
        let thrown = err.to_opaque(&mut self.context);
        normalize_thrown(&thrown, &mut self.context)
    }

    /// Convert the final JsValue to JSON. A value that cannot be
    /// serialized degrades to `null` rather than failing the run.
    fn value_to_json(&mut self, value: &JsValue) -> EvalOutcome {
        match value.to_json(&mut self.context) {
            Ok(Some(json)) => EvalOutcome {
                value: json,
                lossy: false,
            },
            Ok(None) => EvalOutcome {
                value: Value::Null,
                lossy: false,
            },
            Err(_) => EvalOutcome {
                value: Value::Null,
                lossy: true,
            },
        }
    }
}

/// Build a normalized error from a thrown value. Error objects contribute
/// their own `message`/`stack`; anything else is stringified.
fn normalize_thrown(value: &JsValue, context: &mut Context) -> ScriptError {
    if let Some(obj) = value.as_object() {
        let message = read_string_property(&obj, "message", context);
        if let Some(message) = message {
            let stack = read_string_property(&obj, "stack", context).unwrap_or_else(|| {
                let name = read_string_property(&obj, "name", context)
                    .unwrap_or_else(|| "Error".to_owned());
                format!("{name}: {message}")
            });
            let (message, _, _) = fix_source_position(&message, SOURCE_LINE_OFFSET);
            let (stack, _, _) = fix_source_position(&stack, SOURCE_LINE_OFFSET);
            return ScriptError::runtime(message, Some(stack));
        }
    }

    let message = value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| "<unknown>".to_owned());
    let (message, _, _) = fix_source_position(&message, SOURCE_LINE_OFFSET);
    ScriptError::runtime(message, None)
}

fn read_string_property(
    obj: &boa_engine::JsObject,
    name: &str,
    context: &mut Context,
) -> Option<String> {
    let value = obj.get(boa_engine::JsString::from(name), context).ok()?;
    if value.is_undefined() || value.is_null() {
        return None;
    }
    value
        .to_string(context)
        .ok()
        .map(|s| s.to_std_string_escaped())
}

static SOURCE_POSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"line (\d+), column (\d+)").expect("valid position regex"));

/// Rewrite the first reported source position so it matches the
/// user-visible code instead of the wrapped source.
fn fix_source_position(message: &str, offset: u32) -> (String, Option<u32>, Option<u32>) {
    let mut line = None;
    let mut column = None;
    let fixed = SOURCE_POSITION.replace(message, |caps: &regex::Captures<'_>| {
        let reported: u32 = caps[1].parse().unwrap_or(0);
        let corrected = reported.saturating_sub(offset).max(1);
        line = Some(corrected);
        column = caps[2].parse().ok();
        format!("line {}, column {}", corrected, &caps[2])
    });
    (fixed.into_owned(), line, column)
}

/// Commands sent to the sandbox worker thread.
enum SandboxCommand {
    Execute {
        code: String,
        responder: oneshot::Sender<Result<EvalOutcome, ScriptError>>,
    },
    WithContext {
        job: Box<dyn FnOnce(&mut Context) -> Result<()> + Send>,
        responder: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// Host-side handle to one sandbox worker.
pub struct SandboxRuntime {
    sender: Sender<SandboxCommand>,
    limits: SandboxLimits,
    thread: Mutex<Option<JoinHandle<()>>>,
    abandoned: AtomicBool,
}

impl SandboxRuntime {
    /// Spawn a fresh, locked-down context on its own worker thread.
    pub fn new(limits: SandboxLimits) -> Result<Self> {
        let (sender, handle) = spawn_worker()?;
        Ok(Self {
            sender,
            limits,
            thread: Mutex::new(Some(handle)),
            abandoned: AtomicBool::new(false),
        })
    }

    /// Run a closure with exclusive access to the context, e.g. to inject
    /// capabilities before execution.
    pub async fn with_context<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut Context) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SandboxCommand::WithContext {
                job: Box::new(job),
                responder: tx,
            })
            .map_err(|_| anyhow!("sandbox worker unavailable"))?;
        rx.await
            .map_err(|_| anyhow!("sandbox worker dropped response"))?
    }

    /// Execute already-wrapped code under the wall-clock budget. The
    /// budget spans evaluation plus the entire async job queue drain.
    pub async fn execute(&self, code: &str) -> Result<EvalOutcome, ScriptError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SandboxCommand::Execute {
                code: code.to_owned(),
                responder: tx,
            })
            .map_err(|_| ScriptError::runtime("sandbox worker unavailable", None))?;

        match timeout(self.limits.budget(), async { rx.await }).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScriptError::runtime("sandbox worker dropped response", None)),
            Err(_) => {
                self.abandoned.store(true, Ordering::SeqCst);
                warn!(
                    budget_ms = self.limits.max_execution_time_ms,
                    "abandoning sandbox worker after timeout"
                );
                Err(ScriptError::timeout(self.limits.max_execution_time_ms))
            }
        }
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        let _ = self.sender.send(SandboxCommand::Shutdown);
        // A worker that blew its budget may never observe the shutdown
        // command; leave its thread behind rather than hang the caller.
        if self.abandoned.load(Ordering::SeqCst) {
            if let Ok(mut handle) = self.thread.lock() {
                handle.take();
            }
            return;
        }
        if let Some(handle) = self.thread.lock().ok().and_then(|mut h| h.take()) {
            let _ = handle.join();
        }
    }
}

fn spawn_worker() -> Result<(Sender<SandboxCommand>, JoinHandle<()>)> {
    let (sender, receiver) = unbounded();
    let (init_tx, init_rx) = mpsc::channel();

    let handle = thread::Builder::new()
        .name("flowscript-sandbox".into())
        .spawn(move || match SandboxWorker::new() {
            Ok(mut worker) => {
                let _ = init_tx.send(Ok(()));
                worker_loop(&mut worker, receiver);
            }
            Err(err) => {
                let _ = init_tx.send(Err(err));
            }
        })
        .map_err(|err| anyhow!("failed to spawn sandbox worker: {err}"))?;

    init_rx
        .recv()
        .map_err(|_| anyhow!("sandbox worker failed to initialize"))??;

    Ok((sender, handle))
}

fn worker_loop(worker: &mut SandboxWorker, receiver: Receiver<SandboxCommand>) {
    for command in receiver {
        match command {
            SandboxCommand::Execute { code, responder } => {
                let _ = responder.send(worker.execute(&code));
            }
            SandboxCommand::WithContext { job, responder } => {
                let _ = responder.send(job(worker.context_mut()));
            }
            SandboxCommand::Shutdown => break,
        }
    }
}
