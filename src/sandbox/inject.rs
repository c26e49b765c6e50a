//! Capability injection.
//!
//! Everything a sandboxed script may touch is registered here, and only
//! here. The injected name set is a public contract for stored scripts:
//! removing or renaming an entry is a breaking change.
//!
//! Async capabilities bridge into the host: the native function spawns
//! the real work onto the tokio runtime, returns a pending promise, and
//! an async job settles it when the host side answers.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use boa_engine::{
    job::NativeAsyncJob, js_string, object::builtins::JsPromise, object::ObjectInitializer,
    property::Attribute, Context, JsError, JsResult, JsString, JsValue, NativeFunction,
};
use boa_gc::{custom_trace, Finalize, Trace};
use chrono::Utc;
use serde_json::Value;
use tokio::{runtime::Handle, sync::oneshot};

use crate::globals::GlobalNamespace;
use crate::host_api::HostApi;
use crate::tokens::TokenRegistry;

use super::{RunLog, ScriptMeta};

/// The full capability surface for one run.
pub struct CapabilityBinding {
    pub meta: ScriptMeta,
    pub args: Vec<Value>,
    pub http: reqwest::Client,
    pub tokens: Arc<TokenRegistry>,
    pub globals: Arc<GlobalNamespace>,
    pub api: Arc<dyn HostApi>,
    pub log: RunLog,
}

impl CapabilityBinding {
    /// Register the whole surface into a fresh context.
    pub fn inject(self, context: &mut Context, handle: Handle) -> Result<()> {
        self.register_args(context)?;
        self.register_metadata(context)?;
        self.register_log(context)?;
        self.register_http(context, &handle)?;
        self.register_querystring(context)?;
        self.register_host_api(context, &handle)?;
        self.register_tokens(context, &handle)?;
        self.register_wait(context, &handle)?;
        self.register_global_namespace(context)?;
        Ok(())
    }

    fn register_args(&self, context: &mut Context) -> Result<()> {
        let args = JsValue::from_json(&Value::Array(self.args.clone()), context)
            .map_err(|err| anyhow!("failed to convert script arguments: {err}"))?;
        register_value(context, "args", args)
    }

    fn register_metadata(&self, context: &mut Context) -> Result<()> {
        let filename = JsString::from(format!("{}.js", self.meta.name));
        register_value(context, "__filename__", filename)?;
        register_value(context, "__script_id__", JsString::from(self.meta.id.clone()))?;

        let last_executed = match self.meta.last_executed {
            Some(ts) => JsValue::from(JsString::from(ts.to_rfc3339())),
            None => JsValue::null(),
        };
        register_value(context, "__last_executed__", last_executed)?;

        let ms_since = match self.meta.last_executed {
            Some(ts) => JsValue::from((Utc::now() - ts).num_milliseconds() as f64),
            None => JsValue::null(),
        };
        register_value(context, "__ms_since_last_executed__", ms_since)
    }

    /// `log(...)` plus a console shim routing `log`/`error`/`info`
    /// through the same sink.
    fn register_log(&self, context: &mut Context) -> Result<()> {
        let native = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &LogCapture, context| {
                let text = render_log_args(args, context)?;
                captures.log.record(text);
                Ok(JsValue::undefined())
            },
            LogCapture {
                log: self.log.clone(),
            },
        );
        let log_function = native.to_js_function(context.realm());

        register_value(context, "log", log_function.clone())?;

        let console = ObjectInitializer::new(context)
            .property(js_string!("log"), log_function.clone(), Attribute::all())
            .property(js_string!("error"), log_function.clone(), Attribute::all())
            .property(js_string!("info"), log_function, Attribute::all())
            .build();
        register_value(context, "console", console)
    }

    fn register_http(&self, context: &mut Context, handle: &Handle) -> Result<()> {
        let get = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &HttpCapture, context| {
                let url = string_arg(args, 0, context)?;
                if url.trim().is_empty() {
                    return Err(js_error("http.get(url) requires a non-empty url"));
                }
                let client = captures.client.clone();
                Ok(settle_with(context, &captures.handle, async move {
                    let response = client
                        .get(&url)
                        .send()
                        .await
                        .and_then(|response| response.error_for_status())
                        .map_err(|err| err.to_string())?;
                    let body = response.text().await.map_err(|err| err.to_string())?;
                    Ok(Value::String(body))
                }))
            },
            HttpCapture {
                client: self.http.clone(),
                handle: handle.clone(),
            },
        );

        let post = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &HttpCapture, context| {
                let url = string_arg(args, 0, context)?;
                if url.trim().is_empty() {
                    return Err(js_error("http.post(url, body) requires a non-empty url"));
                }
                let body = json_arg(args, 1, context)?;
                let content_type = match args.get(2) {
                    Some(value) if !value.is_undefined() => Some(
                        value
                            .to_string(context)?
                            .to_std_string_escaped(),
                    ),
                    _ => None,
                };
                let client = captures.client.clone();
                Ok(settle_with(context, &captures.handle, async move {
                    let request = client.post(&url);
                    let request = match body {
                        Value::String(text) => request
                            .header(
                                "content-type",
                                content_type.as_deref().unwrap_or("text/plain"),
                            )
                            .body(text),
                        other => request.json(&other),
                    };
                    let response = request
                        .send()
                        .await
                        .and_then(|response| response.error_for_status())
                        .map_err(|err| err.to_string())?;
                    let body = response.text().await.map_err(|err| err.to_string())?;
                    Ok(Value::String(body))
                }))
            },
            HttpCapture {
                client: self.http.clone(),
                handle: handle.clone(),
            },
        );

        let get = get.to_js_function(context.realm());
        let post = post.to_js_function(context.realm());
        let http = ObjectInitializer::new(context)
            .property(js_string!("get"), get, Attribute::all())
            .property(js_string!("post"), post, Attribute::all())
            .build();
        register_value(context, "http", http)
    }

    fn register_querystring(&self, context: &mut Context) -> Result<()> {
        let stringify = NativeFunction::from_copy_closure(|_, args, context| {
            let value = json_arg(args, 0, context)?;
            let Value::Object(fields) = value else {
                return Err(js_error("querystring.stringify expects an object"));
            };
            let rendered = fields
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    format!(
                        "{}={}",
                        urlencoding::encode(key),
                        urlencoding::encode(&value)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            Ok(JsValue::from(JsString::from(rendered)))
        });

        let parse = NativeFunction::from_copy_closure(|_, args, context| {
            let text = string_arg(args, 0, context)?;
            let mut fields = serde_json::Map::new();
            for (key, value) in url::form_urlencoded::parse(text.as_bytes()) {
                fields.insert(key.into_owned(), Value::String(value.into_owned()));
            }
            JsValue::from_json(&Value::Object(fields), context)
        });

        let stringify = stringify.to_js_function(context.realm());
        let parse = parse.to_js_function(context.realm());
        let querystring = ObjectInitializer::new(context)
            .property(js_string!("stringify"), stringify, Attribute::all())
            .property(js_string!("parse"), parse, Attribute::all())
            .build();
        register_value(context, "querystring", querystring)
    }

    /// The bound host-API object plus the `say` shortcut.
    fn register_host_api(&self, context: &mut Context, handle: &Handle) -> Result<()> {
        let call = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &ApiCapture, context| {
                let method = string_arg(args, 0, context)?;
                let path = string_arg(args, 1, context)?;
                if method.trim().is_empty() || path.trim().is_empty() {
                    return Err(js_error(
                        "api.call(method, path, body) requires a method and a path",
                    ));
                }
                let body = match args.get(2) {
                    Some(value) if !value.is_undefined() => Some(json_arg(args, 2, context)?),
                    _ => None,
                };
                let api = Arc::clone(&captures.api);
                Ok(settle_with(context, &captures.handle, async move {
                    api.call(&method, &path, body)
                        .await
                        .map_err(|err| err.to_string())
                }))
            },
            ApiCapture {
                api: Arc::clone(&self.api),
                handle: handle.clone(),
            },
        );
        let call = call.to_js_function(context.realm());
        let api = ObjectInitializer::new(context)
            .property(js_string!("call"), call, Attribute::all())
            .build();
        register_value(context, "api", api)?;

        let say = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &ApiCapture, context| {
                let text = string_arg(args, 0, context)?;
                let api = Arc::clone(&captures.api);
                Ok(settle_with(context, &captures.handle, async move {
                    api.speak(&text)
                        .await
                        .map(|_| Value::Null)
                        .map_err(|err| err.to_string())
                }))
            },
            ApiCapture {
                api: Arc::clone(&self.api),
                handle: handle.clone(),
            },
        );
        register_value(context, "say", say.to_js_function(context.realm()))
    }

    /// `tag(id, value)` and its deprecated predecessor
    /// `setTagValue(id, opts, value)`.
    fn register_tokens(&self, context: &mut Context, handle: &Handle) -> Result<()> {
        let tag = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &TokenCapture, context| {
                let id = string_arg(args, 0, context)?;
                if id.trim().is_empty() {
                    return Err(js_error("tag(id, value) requires a non-empty token id"));
                }
                let value = json_arg(args, 1, context)?;
                let tokens = Arc::clone(&captures.tokens);
                Ok(settle_with(context, &captures.handle, async move {
                    tokens
                        .set_token(&id, value, None)
                        .await
                        .map(|_| Value::Null)
                        .map_err(|err| err.to_string())
                }))
            },
            TokenCapture {
                tokens: Arc::clone(&self.tokens),
                handle: handle.clone(),
            },
        );
        register_value(context, "tag", tag.to_js_function(context.realm()))?;

        // Kept for stored scripts written against the old surface. Warns
        // once per run, then behaves exactly like tag().
        let set_tag_value = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &DeprecatedTokenCapture, context| {
                if !captures.warned.get() {
                    captures.warned.set(true);
                    captures
                        .log
                        .record("setTagValue(id, opts, value) is deprecated, use tag(id, value)");
                }
                let id = string_arg(args, 0, context)?;
                if id.trim().is_empty() {
                    return Err(js_error("setTagValue requires a non-empty token id"));
                }
                let value = json_arg(args, 2, context)?;
                let tokens = Arc::clone(&captures.tokens);
                Ok(settle_with(context, &captures.handle, async move {
                    tokens
                        .set_token(&id, value, None)
                        .await
                        .map(|_| Value::Null)
                        .map_err(|err| err.to_string())
                }))
            },
            DeprecatedTokenCapture {
                tokens: Arc::clone(&self.tokens),
                handle: handle.clone(),
                log: self.log.clone(),
                warned: Cell::new(false),
            },
        );
        register_value(
            context,
            "setTagValue",
            set_tag_value.to_js_function(context.realm()),
        )
    }

    fn register_wait(&self, context: &mut Context, handle: &Handle) -> Result<()> {
        let wait = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &SleepCapture, context| {
                let ms = args
                    .get(0)
                    .cloned()
                    .unwrap_or_else(JsValue::undefined)
                    .to_number(context)?;
                let delay = if ms.is_finite() && ms > 0.0 {
                    Duration::from_millis(ms as u64)
                } else {
                    Duration::ZERO
                };
                Ok(settle_with(context, &captures.handle, async move {
                    tokio::time::sleep(delay).await;
                    Ok(Value::Null)
                }))
            },
            SleepCapture {
                handle: handle.clone(),
            },
        );
        register_value(context, "wait", wait.to_js_function(context.realm()))
    }

    /// The cross-script `global` namespace: shared by every run, last
    /// write wins.
    fn register_global_namespace(&self, context: &mut Context) -> Result<()> {
        let get = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &GlobalCapture, context| {
                let key = string_arg(args, 0, context)?;
                match captures.globals.get(&key) {
                    Ok(Some(value)) => JsValue::from_json(&value, context),
                    Ok(None) => Ok(JsValue::undefined()),
                    Err(err) => Err(js_error(format!("global.get failed: {err}"))),
                }
            },
            GlobalCapture {
                globals: Arc::clone(&self.globals),
            },
        );

        let set = NativeFunction::from_copy_closure_with_captures(
            |_, args, captures: &GlobalCapture, context| {
                let key = string_arg(args, 0, context)?;
                if key.is_empty() {
                    return Err(js_error("global.set(key, value) requires a key"));
                }
                let value = json_arg(args, 1, context)?;
                captures
                    .globals
                    .set(&key, value)
                    .map_err(|err| js_error(format!("global.set failed: {err}")))?;
                Ok(JsValue::undefined())
            },
            GlobalCapture {
                globals: Arc::clone(&self.globals),
            },
        );

        let keys = NativeFunction::from_copy_closure_with_captures(
            |_, _args, captures: &GlobalCapture, context| {
                let keys = captures
                    .globals
                    .keys()
                    .map_err(|err| js_error(format!("global.keys failed: {err}")))?;
                JsValue::from_json(&serde_json::json!(keys), context)
            },
            GlobalCapture {
                globals: Arc::clone(&self.globals),
            },
        );

        let get = get.to_js_function(context.realm());
        let set = set.to_js_function(context.realm());
        let keys = keys.to_js_function(context.realm());
        let global = ObjectInitializer::new(context)
            .property(js_string!("get"), get, Attribute::all())
            .property(js_string!("set"), set, Attribute::all())
            .property(js_string!("keys"), keys, Attribute::all())
            .build();
        register_value(context, "global", global)
    }
}

/// Spawn a host future and return a promise settled by an async job once
/// the future answers. Failures reject with a plain message string.
fn settle_with<F>(context: &mut Context, handle: &Handle, fut: F) -> JsValue
where
    F: std::future::Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    let (promise, resolvers) = JsPromise::new_pending(context);
    let (tx, rx) = oneshot::channel();

    handle.spawn(async move {
        let _ = tx.send(fut.await);
    });

    context.enqueue_job(
        NativeAsyncJob::new(async move |ctx_ref| {
            let result = rx
                .await
                .map_err(|_| js_error("host task cancelled before returning a result"))?;

            let mut ctx = ctx_ref.borrow_mut();
            match result {
                Ok(value) => {
                    let js_value = JsValue::from_json(&value, &mut ctx)?;
                    resolvers
                        .resolve
                        .call(&JsValue::undefined(), &[js_value], &mut ctx)
                        .map(|_| JsValue::undefined())
                }
                Err(err) => {
                    let error_value = JsValue::from(JsString::from(err));
                    resolvers
                        .reject
                        .call(&JsValue::undefined(), &[error_value], &mut ctx)
                        .map(|_| JsValue::undefined())
                }
            }
        })
        .into(),
    );

    promise.into()
}

fn register_value(context: &mut Context, name: &str, value: impl Into<JsValue>) -> Result<()> {
    context
        .register_global_property(JsString::from(name), value, Attribute::all())
        .map_err(|err| anyhow!("failed to register global {name}: {err}"))
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    args.get(index)
        .cloned()
        .unwrap_or_else(JsValue::undefined)
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
}

fn json_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<Value> {
    match args
        .get(index)
        .cloned()
        .unwrap_or_else(JsValue::undefined)
        .to_json(context)?
    {
        Some(json) => Ok(json),
        None => Ok(Value::Null),
    }
}

/// Render log arguments the way scripts expect: strings verbatim,
/// everything else as JSON.
fn render_log_args(args: &[JsValue], context: &mut Context) -> JsResult<String> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(text) = arg.as_string() {
            parts.push(text.to_std_string_escaped());
            continue;
        }
        let rendered = match arg.to_json(context) {
            Ok(Some(json)) => json.to_string(),
            Ok(None) => "undefined".to_owned(),
            Err(_) => arg.to_string(context)?.to_std_string_escaped(),
        };
        parts.push(rendered);
    }
    Ok(parts.join(" "))
}

fn js_error(message: impl Into<String>) -> JsError {
    JsError::from_opaque(JsValue::from(JsString::from(message.into())))
}

#[derive(Clone)]
struct LogCapture {
    log: RunLog,
}

#[derive(Clone)]
struct HttpCapture {
    client: reqwest::Client,
    handle: Handle,
}

#[derive(Clone)]
struct ApiCapture {
    api: Arc<dyn HostApi>,
    handle: Handle,
}

#[derive(Clone)]
struct TokenCapture {
    tokens: Arc<TokenRegistry>,
    handle: Handle,
}

struct DeprecatedTokenCapture {
    tokens: Arc<TokenRegistry>,
    handle: Handle,
    log: RunLog,
    warned: Cell<bool>,
}

#[derive(Clone)]
struct SleepCapture {
    handle: Handle,
}

#[derive(Clone)]
struct GlobalCapture {
    globals: Arc<GlobalNamespace>,
}

macro_rules! impl_inert_trace {
    ($($ty:ty),+ $(,)?) => {
        $(
            #[allow(unused_variables)]
            unsafe impl Trace for $ty {
                custom_trace!(this, _visitor, {});
            }
            impl Finalize for $ty {}
        )+
    };
}

impl_inert_trace!(
    LogCapture,
    HttpCapture,
    ApiCapture,
    TokenCapture,
    DeprecatedTokenCapture,
    SleepCapture,
    GlobalCapture,
);
