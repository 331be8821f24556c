//! The uniform service contract every request flows through.
//!
//! A [`Service`] is a named node in the configured graph: an external
//! origin, a network gateway, a disk directory, or a worker. The listener
//! and every worker sub-request channel talk to services the same way:
//! `start_request` yields a single-shot [`RequestHandle`] that is then
//! driven with exactly one verb.

use crate::server::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::LazyLock;

/// A request as it travels between services: headers plus a fully collected
/// body. Upgrade capabilities ride in the extensions.
pub type HttpRequest = http::Request<Bytes>;

/// A response as it travels between services.
pub type HttpResponse = http::Response<Bytes>;

/// Carry-along metadata describing the ultimate client.
///
/// The blob is an opaque JSON string produced at the listener (or extracted
/// from a configured inbound header) and propagated untouched to the deepest
/// sub-request.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub cf_blob_json: Option<String>,
}

/// Outcome of asking a service for one of its named entrypoints.
pub enum EntrypointLookup {
    /// The service kind has no notion of entrypoints.
    NotSupported,
    /// The service has entrypoints, but none with that name.
    NotFound,
    /// A service pinned to the requested entrypoint.
    Found(Arc<dyn Service>),
}

/// A named request handler in the service graph.
pub trait Service: Send + Sync {
    /// Begin one incoming request. The returned handle is used for one
    /// request and then discarded.
    fn start_request(self: Arc<Self>, metadata: RequestMetadata) -> Box<dyn RequestHandle>;

    /// Resolve a named entrypoint, used by the registry when a service
    /// reference carries one. Only workers support this.
    fn lookup_entrypoint(self: Arc<Self>, name: &str) -> EntrypointLookup {
        let _ = name;
        EntrypointLookup::NotSupported
    }
}

/// A single-shot driver for one request: exactly one of the verbs may be
/// invoked, exactly once. `http` is the only verb every service supports;
/// the extended verbs default to a typed "event not supported" error, and
/// `prewarm` defaults to a no-op.
#[async_trait]
pub trait RequestHandle: Send {
    /// Label used in "don't support this event type" errors.
    fn describe(&self) -> &'static str;

    /// Drive an HTTP request/response exchange.
    async fn http(self: Box<Self>, req: HttpRequest) -> Result<HttpResponse>;

    /// Hint that a request to `url` is likely soon. Always accepted.
    fn prewarm(&self, url: &str) {
        let _ = url;
    }

    /// Deliver a scheduled (cron) event.
    async fn run_scheduled(self: Box<Self>, at: DateTime<Utc>, cron: &str) -> Result<()> {
        let _ = (at, cron);
        Err(Error::EventNotSupported {
            service: self.describe(),
        })
    }

    /// Deliver an alarm event.
    async fn run_alarm(self: Box<Self>, at: DateTime<Utc>) -> Result<()> {
        let _ = at;
        Err(Error::EventNotSupported {
            service: self.describe(),
        })
    }

    /// Deliver an embedder-defined event.
    async fn custom_event(self: Box<Self>, kind: &str) -> Result<()> {
        let _ = kind;
        Err(Error::EventNotSupported {
            service: self.describe(),
        })
    }

    /// Deliver collected trace data.
    async fn send_traces(self: Box<Self>) -> Result<()> {
        Err(Error::EventNotSupported {
            service: self.describe(),
        })
    }
}

/// Service used when the service's config is invalid.
///
/// A process-wide singleton; every part of the graph that failed
/// configuration shares the same instance through [`invalid_config_service`]
/// and every request through it fails loudly.
pub struct InvalidConfigService;

impl Service for InvalidConfigService {
    fn start_request(self: Arc<Self>, _metadata: RequestMetadata) -> Box<dyn RequestHandle> {
        Box::new(InvalidConfigHandle)
    }
}

struct InvalidConfigHandle;

#[async_trait]
impl RequestHandle for InvalidConfigHandle {
    fn describe(&self) -> &'static str {
        "misconfigured services"
    }

    async fn http(self: Box<Self>, _req: HttpRequest) -> Result<HttpResponse> {
        Err(Error::InvalidConfig)
    }
}

static INVALID_CONFIG_SINGLETON: LazyLock<Arc<InvalidConfigService>> =
    LazyLock::new(|| Arc::new(InvalidConfigService));

/// A shared handle to the invalid-config singleton.
pub fn invalid_config_service() -> Arc<dyn Service> {
    INVALID_CONFIG_SINGLETON.clone()
}
