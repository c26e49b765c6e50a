//! Per-run execution orchestration.
//!
//! Wires one run together: host-API session, fresh sandbox, capability
//! injection, budget enforcement, and the structured finish markers in
//! the captured log. The session is released on every exit path.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::error::ScriptError;
use crate::globals::GlobalNamespace;
use crate::host_api::{HostApi, HostApiProvider};
use crate::logging::{debug, warn};
use crate::tokens::TokenRegistry;

use super::engine::{wrap_source, EvalOutcome, SandboxLimits, SandboxRuntime};
use super::inject::CapabilityBinding;
use super::{LogEvent, RunLog, ScriptMeta};

const LOG_RULE: &str = "----------------------------------------";

pub struct ExecutionEngine {
    limits: SandboxLimits,
    http: reqwest::Client,
    tokens: Arc<TokenRegistry>,
    globals: Arc<GlobalNamespace>,
    api_provider: Arc<dyn HostApiProvider>,
    realtime: broadcast::Sender<LogEvent>,
}

/// What one run produced: the normalized outcome, the captured log, and
/// how long it took.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: Result<Value, ScriptError>,
    pub log: Vec<String>,
    pub duration_ms: u128,
}

impl ExecutionEngine {
    pub fn new(
        limits: SandboxLimits,
        tokens: Arc<TokenRegistry>,
        globals: Arc<GlobalNamespace>,
        api_provider: Arc<dyn HostApiProvider>,
        realtime: broadcast::Sender<LogEvent>,
    ) -> Self {
        Self {
            limits,
            http: reqwest::Client::new(),
            tokens,
            globals,
            api_provider,
            realtime,
        }
    }

    /// Run `code` under `meta`'s identity. Any number of runs may execute
    /// concurrently; each gets its own context and host-API session, and
    /// shares only the token registry and the `global` namespace.
    pub async fn run(
        &self,
        meta: ScriptMeta,
        code: &str,
        args: Vec<Value>,
        realtime: bool,
    ) -> ExecutionReport {
        let started = Instant::now();
        let log = RunLog::new(meta.id.clone(), realtime.then(|| self.realtime.clone()));
        debug!(script = %meta.id, name = %meta.name, "starting script run");

        let result = self.run_isolated(&meta, code, args, &log).await;
        let outcome = match result {
            Ok(eval) => {
                log.record(LOG_RULE);
                if eval.lossy {
                    log.record("script finished, return value was not serializable");
                } else {
                    log.record(format!("script finished, returned: {}", eval.value));
                }
                Ok(eval.value)
            }
            Err(err) => {
                log.record(LOG_RULE);
                log.record(format!("script failed: {}", err.stack));
                warn!(script = %meta.id, error = %err, "script run failed");
                Err(err)
            }
        };

        ExecutionReport {
            outcome,
            log: log.snapshot(),
            duration_ms: started.elapsed().as_millis(),
        }
    }

    async fn run_isolated(
        &self,
        meta: &ScriptMeta,
        code: &str,
        args: Vec<Value>,
        log: &RunLog,
    ) -> Result<EvalOutcome, ScriptError> {
        let session = self
            .api_provider
            .acquire(&meta.id)
            .await
            .map_err(|err| ScriptError::runtime(format!("host api unavailable: {err}"), None))?;

        let result = self
            .run_sandboxed(meta, code, args, log, Arc::clone(&session))
            .await;

        if let Err(err) = self.api_provider.release(session).await {
            warn!(script = %meta.id, error = %err, "failed to release host api session");
        }
        result
    }

    async fn run_sandboxed(
        &self,
        meta: &ScriptMeta,
        code: &str,
        args: Vec<Value>,
        log: &RunLog,
        session: Arc<dyn HostApi>,
    ) -> Result<EvalOutcome, ScriptError> {
        let runtime = SandboxRuntime::new(self.limits.clone())
            .map_err(|err| ScriptError::runtime(format!("failed to start sandbox: {err}"), None))?;

        let binding = CapabilityBinding {
            meta: meta.clone(),
            args,
            http: self.http.clone(),
            tokens: Arc::clone(&self.tokens),
            globals: Arc::clone(&self.globals),
            api: session,
            log: log.clone(),
        };
        let handle = Handle::current();
        runtime
            .with_context(move |ctx| binding.inject(ctx, handle.clone()))
            .await
            .map_err(|err| {
                ScriptError::runtime(format!("failed to prepare sandbox: {err}"), None)
            })?;

        runtime.execute(&wrap_source(code)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptErrorKind;
    use crate::host_api::HostApiProvider;
    use crate::storage::MemoryStore;
    use crate::tokens::InMemoryTokenPlatform;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts sessions and records calls, so release-on-every-path is
    /// observable.
    #[derive(Default)]
    struct CountingApi {
        spoken: parking_lot::Mutex<Vec<String>>,
        fail_calls: bool,
    }

    #[async_trait]
    impl crate::host_api::HostApi for CountingApi {
        async fn call(
            &self,
            method: &str,
            path: &str,
            _body: Option<Value>,
        ) -> anyhow::Result<Value> {
            if self.fail_calls {
                return Err(anyhow::anyhow!("device backend offline"));
            }
            Ok(json!({ "method": method, "path": path }))
        }

        async fn speak(&self, text: &str) -> anyhow::Result<()> {
            self.spoken.lock().push(text.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingProvider {
        api: Arc<CountingApi>,
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl HostApiProvider for CountingProvider {
        async fn acquire(&self, _script_id: &str) -> anyhow::Result<Arc<dyn crate::host_api::HostApi>> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(self.api.clone())
        }

        async fn release(
            &self,
            _session: Arc<dyn crate::host_api::HostApi>,
        ) -> anyhow::Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        engine: ExecutionEngine,
        provider: Arc<CountingProvider>,
        platform: Arc<InMemoryTokenPlatform>,
        realtime: broadcast::Sender<LogEvent>,
    }

    fn fixture() -> Fixture {
        fixture_with_limits(SandboxLimits::default())
    }

    fn fixture_with_limits(limits: SandboxLimits) -> Fixture {
        let kv = MemoryStore::shared();
        let platform = Arc::new(InMemoryTokenPlatform::new());
        let tokens = Arc::new(TokenRegistry::new(kv.clone(), platform.clone()).unwrap());
        let globals = Arc::new(GlobalNamespace::new(kv));
        let provider = Arc::new(CountingProvider::default());
        let (realtime, _) = broadcast::channel(16);
        let engine = ExecutionEngine::new(
            limits,
            tokens,
            globals,
            provider.clone(),
            realtime.clone(),
        );
        Fixture {
            engine,
            provider,
            platform,
            realtime,
        }
    }

    fn meta(id: &str) -> ScriptMeta {
        ScriptMeta {
            id: id.to_owned(),
            name: id.to_owned(),
            last_executed: None,
        }
    }

    #[tokio::test]
    async fn returns_the_script_value_and_a_finish_marker() {
        let fx = fixture();
        let report = fx.engine.run(meta("t"), "return 1+1", vec![], false).await;

        assert_eq!(report.outcome.unwrap(), json!(2));
        assert!(report
            .log
            .iter()
            .any(|line| line.contains("returned: 2")));
    }

    #[tokio::test]
    async fn args_and_wait_flow_through() {
        let fx = fixture();
        let started = Instant::now();
        let report = fx
            .engine
            .run(
                meta("t"),
                "await wait(100); return args[0]",
                vec![json!(42)],
                false,
            )
            .await;

        assert_eq!(report.outcome.unwrap(), json!(42));
        assert!(started.elapsed() >= std::time::Duration::from_millis(100));
    }

    #[tokio::test]
    async fn session_is_released_on_success_and_failure() {
        let fx = fixture();
        fx.engine.run(meta("ok"), "return 1", vec![], false).await;
        fx.engine
            .run(meta("bad"), "throw new Error('nope')", vec![], false)
            .await;

        assert_eq!(fx.provider.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(fx.provider.released.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn session_is_released_on_timeout() {
        let fx = fixture_with_limits(SandboxLimits {
            max_execution_time_ms: 300,
        });
        let report = fx
            .engine
            .run(meta("spin"), "while (true) {}", vec![], false)
            .await;

        assert!(report.outcome.unwrap_err().is_timeout());
        assert_eq!(fx.provider.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(fx.provider.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn log_and_console_are_captured() {
        let fx = fixture();
        let report = fx
            .engine
            .run(
                meta("logs"),
                "log('a', 1); console.error('b'); return null",
                vec![],
                false,
            )
            .await;

        assert!(report.outcome.is_ok());
        assert!(report.log.iter().any(|line| line == "a 1"));
        assert!(report.log.iter().any(|line| line == "b"));
    }

    #[tokio::test]
    async fn realtime_runs_broadcast_each_line() {
        let fx = fixture();
        let mut rx = fx.realtime.subscribe();
        let report = fx
            .engine
            .run(meta("live"), "log('streamed'); return 1", vec![], true)
            .await;
        assert!(report.outcome.is_ok());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.text, "streamed");
        assert_eq!(event.script, "live");
    }

    #[tokio::test]
    async fn non_realtime_runs_do_not_broadcast() {
        let fx = fixture();
        let mut rx = fx.realtime.subscribe();
        fx.engine
            .run(meta("quiet"), "log('local only'); return 1", vec![], false)
            .await;

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn say_reaches_the_host_api() {
        let fx = fixture();
        let report = fx
            .engine
            .run(meta("talk"), "await say('hello'); return true", vec![], false)
            .await;

        assert_eq!(report.outcome.unwrap(), json!(true));
        assert_eq!(*fx.provider.api.spoken.lock(), vec!["hello".to_owned()]);
    }

    #[tokio::test]
    async fn api_call_failure_surfaces_as_runtime_error() {
        let kv = MemoryStore::shared();
        let tokens = Arc::new(
            TokenRegistry::new(kv.clone(), Arc::new(InMemoryTokenPlatform::new())).unwrap(),
        );
        let globals = Arc::new(GlobalNamespace::new(kv));
        let provider = Arc::new(CountingProvider {
            api: Arc::new(CountingApi {
                fail_calls: true,
                ..CountingApi::default()
            }),
            ..CountingProvider::default()
        });
        let (realtime, _) = broadcast::channel(16);
        let engine = ExecutionEngine::new(
            SandboxLimits::default(),
            tokens,
            globals,
            provider,
            realtime,
        );

        let report = engine
            .run(
                meta("api"),
                "return await api.call('GET', '/devices')",
                vec![],
                false,
            )
            .await;

        let err = report.outcome.unwrap_err();
        assert_eq!(err.kind, ScriptErrorKind::Runtime);
        assert!(err.message.contains("device backend offline"));
    }

    #[tokio::test]
    async fn tag_writes_through_the_token_registry() {
        let fx = fixture();
        let report = fx
            .engine
            .run(meta("tags"), "await tag('temp', 21); return 1", vec![], false)
            .await;

        assert!(report.outcome.is_ok());
        assert_eq!(fx.platform.live_value("temp"), Some(json!(21)));
    }

    #[tokio::test]
    async fn set_tag_value_warns_once_and_still_writes() {
        let fx = fixture();
        let report = fx
            .engine
            .run(
                meta("compat"),
                "await setTagValue('a', {}, 1); await setTagValue('b', {}, 2); return 1",
                vec![],
                false,
            )
            .await;

        assert!(report.outcome.is_ok());
        let warnings = report
            .log
            .iter()
            .filter(|line| line.contains("deprecated"))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(fx.platform.live_value("a"), Some(json!(1)));
        assert_eq!(fx.platform.live_value("b"), Some(json!(2)));
    }

    #[tokio::test]
    async fn global_namespace_is_shared_across_runs() {
        let fx = fixture();
        let first = fx
            .engine
            .run(
                meta("writer"),
                "global.set('shared', 7); return global.keys()",
                vec![],
                false,
            )
            .await;
        assert_eq!(first.outcome.unwrap(), json!(["shared"]));

        let second = fx
            .engine
            .run(meta("reader"), "return global.get('shared')", vec![], false)
            .await;
        assert_eq!(second.outcome.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn querystring_helpers_round_trip() {
        let fx = fixture();
        let report = fx
            .engine
            .run(
                meta("qs"),
                "const s = querystring.stringify({a: '1', b: 'two words'});\n\
                 const parsed = querystring.parse(s);\n\
                 return [s, parsed.b]",
                vec![],
                false,
            )
            .await;

        assert_eq!(
            report.outcome.unwrap(),
            json!(["a=1&b=two%20words", "two words"])
        );
    }

    #[tokio::test]
    async fn metadata_globals_describe_the_run() {
        let fx = fixture();
        let report = fx
            .engine
            .run(
                ScriptMeta {
                    id: "id-1".into(),
                    name: "My Script".into(),
                    last_executed: Some(Utc::now() - chrono::Duration::seconds(5)),
                },
                "return [__filename__, __script_id__, __ms_since_last_executed__ >= 5000]",
                vec![],
                false,
            )
            .await;

        assert_eq!(
            report.outcome.unwrap(),
            json!(["My Script.js", "id-1", true])
        );
    }

    #[tokio::test]
    async fn http_get_fetches_from_a_server() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hello"))
            .respond_with(ResponseTemplate::new(200).set_body_string("world"))
            .mount(&server)
            .await;

        let fx = fixture();
        let report = fx
            .engine
            .run(
                meta("web"),
                "return await http.get(args[0])",
                vec![json!(format!("{}/hello", server.uri()))],
                false,
            )
            .await;

        assert_eq!(report.outcome.unwrap(), json!("world"));
    }

    #[tokio::test]
    async fn http_error_status_rejects() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fx = fixture();
        let report = fx
            .engine
            .run(
                meta("web"),
                "return await http.get(args[0])",
                vec![json!(server.uri())],
                false,
            )
            .await;

        assert_eq!(report.outcome.unwrap_err().kind, ScriptErrorKind::Runtime);
    }
}
