//! Typed errors for the request pipeline, plus the configuration error
//! reporter.

use parking_lot::Mutex;
use std::sync::Arc;

/// Result type for request-pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Request-pipeline errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request hit a service whose configuration failed at startup.
    #[error("service cannot handle requests because its config is invalid")]
    InvalidConfig,

    /// A verb the target service does not implement.
    #[error("{service} don't support this event type")]
    EventNotSupported { service: &'static str },

    /// The request itself is malformed for the target service.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A worker asked for a sub-request channel outside its table.
    #[error("invalid subrequest channel number: {channel}")]
    InvalidChannel { channel: usize },

    /// A network service was asked to dial a peer its rules exclude.
    #[error("peer address {addr} is not allowed by this network's rules")]
    PeerNotAllowed { addr: String },

    /// An `https:` sub-request through a network service with no TLS
    /// configuration.
    #[error("this network service is not configured for TLS")]
    TlsNotConfigured,

    /// The origin could not be reached or spoke unusable HTTP.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Script execution failed inside a worker.
    #[error("worker '{name}' failed: {reason}")]
    Script { name: String, reason: String },

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an upstream failure.
    pub fn upstream(reason: impl Into<String>) -> Self {
        Self::Upstream(reason.into())
    }

    /// Create a script failure.
    pub fn script(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Script {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// The HTTP status a listener answers with when this error escapes a
    /// handler.
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::PeerNotAllowed { .. } => 403,
            Self::EventNotSupported { .. } => 501,
            Self::Upstream(_) => 502,
            Self::InvalidConfig
            | Self::InvalidChannel { .. }
            | Self::TlsNotConfigured
            | Self::Script { .. }
            | Self::Io { .. } => 500,
        }
    }
}

/// Collects configuration errors during server assembly.
///
/// Reporting is append-only and non-blocking; nothing reported here stops
/// startup. The offending component is replaced with the invalid-config
/// service so the rest of the graph stays usable, and callers (tests, the
/// CLI) can inspect everything that went wrong afterwards.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    messages: Arc<Mutex<Vec<String>>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one configuration error.
    pub fn report(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(target: "gatehouse::config", "{message}");
        self.messages.lock().push(message);
    }

    /// Everything reported so far.
    pub fn errors(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}
