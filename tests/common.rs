//! Common test utilities for integration tests.
//!
//! Provides:
//! - `TestOrigin` - a capturing origin server services can forward to
//! - `EchoScriptFactory` - a stub script engine whose workers echo what
//!   they received (URL, entrypoint, identity blob) as JSON
//! - `TestServer` - a gatehouse server on an ephemeral port
//! - `http_request` - a raw HTTP/1.1 client for driving listeners

#![allow(dead_code)] // each integration test binary uses a subset

use async_trait::async_trait;
use bytes::Bytes;
use gatehouse::config::Config;
use gatehouse::script::{
    Global, GlobalValue, ScriptContext, ScriptHost, ScriptHostFactory, ScriptSource,
    SubrequestDispatcher, ValidationReporter,
};
use gatehouse::server::{
    ErrorReporter, HttpRequest, HttpResponse, RequestHandle, RequestMetadata, Server,
};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// =============================================================================
// Capturing origin server
// =============================================================================

/// One request as seen by the origin.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    /// The request target exactly as it appeared on the wire.
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A plaintext HTTP/1.1 origin that records every request and answers
/// `200 origin-ok`.
pub struct TestOrigin {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    _task: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::default();

        let captured = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let captured = captured.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let captured = captured.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await.unwrap().to_bytes();
                            captured.lock().push(CapturedRequest {
                                method: parts.method.to_string(),
                                target: parts.uri.to_string(),
                                headers: parts
                                    .headers
                                    .iter()
                                    .map(|(n, v)| {
                                        (n.to_string(), v.to_str().unwrap_or("").to_string())
                                    })
                                    .collect(),
                                body: body.to_vec(),
                            });
                            Ok::<_, std::convert::Infallible>(
                                Response::builder()
                                    .status(StatusCode::OK)
                                    .header("x-origin", "yes")
                                    .body(Full::new(Bytes::from_static(b"origin-ok")))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            requests,
            _task: task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn address_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> CapturedRequest {
        self.requests
            .lock()
            .last()
            .cloned()
            .expect("origin received no requests")
    }
}

// =============================================================================
// Stub script engine
// =============================================================================

/// A stub engine whose workers echo the request context as JSON, and can
/// issue sub-requests through their binding channels on demand:
///
/// - `x-call-binding: NAME` plus `x-sub-url: URL` makes the worker forward
///   a GET through binding NAME's channel and relay the response.
/// - anything else returns `{"url":…, "entrypoint":…, "cfBlob":…}`.
pub struct EchoScriptFactory {
    pub entrypoints: Vec<&'static str>,
}

impl EchoScriptFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entrypoints: Vec::new(),
        })
    }

    pub fn with_entrypoints(entrypoints: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self { entrypoints })
    }
}

impl ScriptHostFactory for EchoScriptFactory {
    fn compile(
        &self,
        _worker_name: &str,
        _source: &ScriptSource,
        globals: Vec<Global>,
        reporter: &mut dyn ValidationReporter,
    ) -> Arc<dyn ScriptHost> {
        reporter.add_handler(None, "fetch");
        for entrypoint in &self.entrypoints {
            reporter.add_handler(Some(entrypoint), "fetch");
        }

        let mut channels_by_name = HashMap::new();
        for global in &globals {
            if let GlobalValue::Fetcher { channel } = global.value {
                channels_by_name.insert(global.name.clone(), channel);
            }
        }
        Arc::new(EchoScriptHost { channels_by_name })
    }
}

struct EchoScriptHost {
    channels_by_name: HashMap<String, usize>,
}

#[async_trait]
impl ScriptHost for EchoScriptHost {
    async fn handle_request(
        &self,
        req: HttpRequest,
        ctx: ScriptContext,
    ) -> gatehouse::server::Result<HttpResponse> {
        if let Some(binding) = req
            .headers()
            .get("x-call-binding")
            .and_then(|v| v.to_str().ok())
        {
            let channel = *self
                .channels_by_name
                .get(binding)
                .expect("script references an unbound name");
            let sub_url = req
                .headers()
                .get("x-sub-url")
                .and_then(|v| v.to_str().ok())
                .expect("x-call-binding requires x-sub-url");

            // Sub-requests propagate the identity blob untouched.
            let metadata = RequestMetadata {
                cf_blob_json: ctx.cf_blob_json.clone(),
            };
            let sub_req = Request::builder()
                .method(Method::GET)
                .uri(sub_url)
                .body(Bytes::new())
                .unwrap();
            return ctx
                .channels
                .start_subrequest(channel, metadata)?
                .http(sub_req)
                .await;
        }

        let body = serde_json::json!({
            "url": req.uri().to_string(),
            "entrypoint": ctx.entrypoint,
            "cfBlob": ctx.cf_blob_json,
        });
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Bytes::from(body.to_string()))
            .unwrap())
    }
}

// =============================================================================
// Server harness
// =============================================================================

/// A gatehouse server bound to an ephemeral port, with its error reporter
/// exposed for assertions. The socket named `main` in the config is bound
/// via a pre-opened listener override.
pub struct TestServer {
    pub addr: SocketAddr,
    pub reporter: ErrorReporter,
    _task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(config: Config, factory: Arc<dyn ScriptHostFactory>) -> Self {
        Self::start_with(config, |server| server.script_host_factory(factory)).await
    }

    /// Start with extra builder customization (overrides etc.).
    pub async fn start_with(config: Config, customize: impl FnOnce(Server) -> Server) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = customize(Server::new()).override_socket_listener("main", listener);
        let reporter = server.error_reporter();
        let task = tokio::spawn(server.run(config));

        // Let service construction and the accept loop start.
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            addr,
            reporter,
            _task: task,
        }
    }
}

// =============================================================================
// Raw HTTP client
// =============================================================================

/// Send one HTTP/1.1 request and collect the response.
pub async fn http_request(
    addr: SocketAddr,
    method: Method,
    target: &str,
    headers: &[(&str, &str)],
    body: Bytes,
) -> (StatusCode, HeaderMap, Bytes) {
    let stream = TcpStream::connect(addr).await.expect("connect failed");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("handshake failed");
    tokio::spawn(conn);

    let mut builder = Request::builder().method(method).uri(target);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = sender
        .send_request(builder.body(Full::new(body)).unwrap())
        .await
        .expect("request failed");

    let (parts, body) = response.into_parts();
    let body = body.collect().await.expect("body read failed").to_bytes();
    (parts.status, parts.headers, body)
}

/// Convenience: GET with a Host header, returning status and body.
pub async fn get(addr: SocketAddr, target: &str, host: &str) -> (StatusCode, Bytes) {
    let (status, _, body) = http_request(
        addr,
        Method::GET,
        target,
        &[("host", host)],
        Bytes::new(),
    )
    .await;
    (status, body)
}
