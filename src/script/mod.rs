//! The seam between worker services and the embedded script engine.
//!
//! The engine itself lives outside this crate. Workers hand it three
//! things: the compiled [`Global`] bindings, a [`ScriptContext`] giving
//! access to the worker's sub-request channels, timers and background-task
//! set, and the request to handle. Embedders plug an engine in through
//! [`ScriptHostFactory`]; the default factory used by the CLI rejects
//! worker services with a configuration error.

use crate::server::{Error, HttpRequest, HttpResponse, RequestHandle, RequestMetadata, Result};
use crate::util::TaskSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Compiled bindings
// =============================================================================

/// One compiled global handed to the script engine.
pub struct Global {
    pub name: String,
    pub value: GlobalValue,
}

/// The value behind a global binding. Channel-carrying variants hold an
/// index into the worker's sub-request channel table.
pub enum GlobalValue {
    Text(String),
    Data(Vec<u8>),
    /// A JSON value, pre-serialized.
    Json(String),
    CryptoKey(CryptoKeyGlobal),
    /// Another service, callable via `channel`.
    Fetcher { channel: usize },
    /// A KV namespace backed by the service on `channel`.
    KvNamespace { channel: usize },
    /// An R2 bucket backed by the service on `channel`.
    R2Bucket { channel: usize },
    /// An R2 admin capability backed by the service on `channel`.
    R2Admin { channel: usize },
    /// A compiled Wasm module (legacy service-worker scripts only).
    WasmModule(Vec<u8>),
}

/// Compiled key material for a crypto-key binding.
pub struct CryptoKeyGlobal {
    /// Import format the engine should use: `raw`, `pkcs8`, `spki` or `jwk`.
    pub format: String,
    pub key_data: KeyData,
    /// The key algorithm as JSON (either a quoted name or a full object).
    pub algorithm: String,
    pub usages: Vec<String>,
    pub extractable: bool,
}

/// Key bytes, or JSON for `jwk` keys.
pub enum KeyData {
    Bytes(Vec<u8>),
    Json(String),
}

// =============================================================================
// Script source
// =============================================================================

/// Script text plus its layout, as handed to the engine.
pub struct ScriptSource {
    pub form: crate::config::ScriptForm,
    pub code: String,
}

// =============================================================================
// Per-request context
// =============================================================================

/// Dispatches sub-requests by channel index. Implemented by the worker's
/// channel table; slot 0 carries the worker's global outbound.
pub trait SubrequestDispatcher: Send + Sync {
    fn start_subrequest(
        &self,
        channel: usize,
        metadata: RequestMetadata,
    ) -> Result<Box<dyn RequestHandle>>;
}

/// A precise calendar clock plus timer waits, handed to the engine.
#[derive(Clone, Copy, Default)]
pub struct TimerChannel;

impl TimerChannel {
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Sleep until `when` (resolves immediately for past instants).
    pub async fn at_time(&self, when: DateTime<Utc>) {
        let delta = when - self.now();
        if let Ok(delta) = delta.to_std() {
            tokio::time::sleep(delta).await;
        }
    }

    pub async fn after_timeout(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

/// Resource-limit surface consulted around script execution.
///
/// Every method of the default implementation is deliberately a null
/// operation; the interface exists so an enforcement layer can slot in
/// without touching the request paths.
pub trait RequestLimiter: Send + Sync {
    /// Called before each outbound sub-request.
    fn new_subrequest(&self) {}

    /// Upper bound on bytes buffered for one response.
    fn buffering_limit(&self) -> usize {
        usize::MAX
    }

    /// Whether the request has exceeded its limits and must stop.
    fn limits_exceeded(&self) -> bool {
        false
    }
}

/// The no-op limiter used for every worker.
pub struct NullLimiter;

impl RequestLimiter for NullLimiter {}

/// Everything a script execution can reach besides the request itself.
#[derive(Clone)]
pub struct ScriptContext {
    /// The named entrypoint to run, or the default export.
    pub entrypoint: Option<String>,
    /// Opaque JSON describing the ultimate client.
    pub cf_blob_json: Option<String>,
    pub channels: Arc<dyn SubrequestDispatcher>,
    /// Fire-and-forget work that must finish before worker teardown.
    pub wait_until: TaskSet,
    pub timer: TimerChannel,
    pub limits: Arc<dyn RequestLimiter>,
}

// =============================================================================
// The engine traits
// =============================================================================

/// A compiled, validated script ready to serve events.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Run the script's request handler.
    async fn handle_request(&self, req: HttpRequest, ctx: ScriptContext) -> Result<HttpResponse>;

    /// Run the script's scheduled handler, if it declares one.
    async fn run_scheduled(
        &self,
        at: DateTime<Utc>,
        cron: &str,
        ctx: ScriptContext,
    ) -> Result<()> {
        let _ = (at, cron, ctx);
        Err(Error::EventNotSupported { service: "Workers" })
    }
}

/// Collects validation output while a script compiles: errors, and the
/// handlers the script declares (which become the worker's entrypoints).
pub trait ValidationReporter {
    fn add_error(&mut self, error: String);

    /// Record a declared handler. `export_name` is `None` for the default
    /// export; `kind` names the event type it accepts (e.g. `fetch`).
    fn add_handler(&mut self, export_name: Option<&str>, kind: &str);
}

/// Compiles scripts into hosts. The factory must report problems through
/// the reporter and still return a host - a worker whose script failed to
/// compile stays addressable and fails per-request instead.
pub trait ScriptHostFactory: Send + Sync {
    fn compile(
        &self,
        worker_name: &str,
        source: &ScriptSource,
        globals: Vec<Global>,
        reporter: &mut dyn ValidationReporter,
    ) -> Arc<dyn ScriptHost>;
}

// =============================================================================
// The default (engine-less) factory
// =============================================================================

/// Factory used when no engine is linked in: compiling reports a
/// configuration error and the resulting host fails every request.
pub struct UnsupportedScriptFactory;

impl ScriptHostFactory for UnsupportedScriptFactory {
    fn compile(
        &self,
        worker_name: &str,
        _source: &ScriptSource,
        _globals: Vec<Global>,
        reporter: &mut dyn ValidationReporter,
    ) -> Arc<dyn ScriptHost> {
        reporter.add_error(
            "no script engine is available in this build, so worker services cannot run".into(),
        );
        Arc::new(UnsupportedScriptHost {
            worker_name: worker_name.to_string(),
        })
    }
}

struct UnsupportedScriptHost {
    worker_name: String,
}

#[async_trait]
impl ScriptHost for UnsupportedScriptHost {
    async fn handle_request(
        &self,
        _req: HttpRequest,
        _ctx: ScriptContext,
    ) -> Result<HttpResponse> {
        Err(Error::script(
            &self.worker_name,
            "no script engine is available in this build",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingReporter {
        errors: Vec<String>,
        handlers: Vec<(Option<String>, String)>,
    }

    impl ValidationReporter for CollectingReporter {
        fn add_error(&mut self, error: String) {
            self.errors.push(error);
        }

        fn add_handler(&mut self, export_name: Option<&str>, kind: &str) {
            self.handlers
                .push((export_name.map(str::to_string), kind.to_string()));
        }
    }

    #[tokio::test]
    async fn test_unsupported_factory_reports_and_fails() {
        let mut reporter = CollectingReporter {
            errors: Vec::new(),
            handlers: Vec::new(),
        };
        let source = ScriptSource {
            form: crate::config::ScriptForm::Modules,
            code: String::new(),
        };
        let host = UnsupportedScriptFactory.compile("w", &source, Vec::new(), &mut reporter);
        assert_eq!(reporter.errors.len(), 1);
        assert!(reporter.errors[0].contains("no script engine"));

        let ctx = ScriptContext {
            entrypoint: None,
            cf_blob_json: None,
            channels: Arc::new(NoChannels),
            wait_until: TaskSet::new(),
            timer: TimerChannel,
            limits: Arc::new(NullLimiter),
        };
        let req = http::Request::builder()
            .uri("http://w/")
            .body(bytes::Bytes::new())
            .unwrap();
        let err = host.handle_request(req, ctx).await.unwrap_err();
        assert!(matches!(err, Error::Script { .. }));
    }

    struct NoChannels;

    impl SubrequestDispatcher for NoChannels {
        fn start_subrequest(
            &self,
            channel: usize,
            _metadata: RequestMetadata,
        ) -> Result<Box<dyn RequestHandle>> {
            Err(Error::InvalidChannel { channel })
        }
    }

    #[test]
    fn test_null_limiter_is_all_no_ops() {
        let limiter = NullLimiter;
        limiter.new_subrequest();
        assert_eq!(limiter.buffering_limit(), usize::MAX);
        assert!(!limiter.limits_exceeded());
    }

    #[tokio::test]
    async fn test_timer_channel_past_instants_resolve() {
        let timer = TimerChannel;
        let past = timer.now() - chrono::Duration::seconds(10);
        timer.at_time(past).await;
    }
}
