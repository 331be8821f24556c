//! Type definitions for the gatehouse configuration file.
//!
//! The file declares a set of named services and a set of sockets. Each
//! socket binds an address and dispatches into one service; services may
//! reference each other by name (worker bindings, globalOutbound, socket
//! targets), forming a static graph that the server assembles at startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Top level
// =============================================================================

/// The root configuration: services plus sockets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub sockets: Vec<SocketConfig>,
}

/// One named service definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ServiceKind,
}

/// The service variants. In TOML the variant is selected with `type`:
///
/// ```toml
/// [[services]]
/// name = "api"
/// type = "external"
/// address = "api.internal:8080"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServiceKind {
    External(ExternalConfig),
    Network(NetworkConfig),
    Worker(WorkerConfig),
    DiskDirectory(DiskDirectoryConfig),
}

// =============================================================================
// External services
// =============================================================================

/// A reverse-proxy to one fixed remote origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalConfig {
    /// Remote address, `host[:port]`. May instead be supplied on the command
    /// line with `--external-addr NAME=ADDR`.
    pub address: Option<String>,
    /// Plaintext HTTP options. Mutually exclusive with `https`.
    pub http: Option<HttpOptions>,
    /// TLS transport to the origin. Mutually exclusive with `http`.
    pub https: Option<ExternalHttpsConfig>,
}

/// TLS parameters for an external origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalHttpsConfig {
    #[serde(default)]
    pub options: HttpOptions,
    #[serde(default)]
    pub tls_options: TlsOptions,
    /// Hostname to expect in the origin's certificate (and to send as SNI).
    /// Defaults to the host part of the address.
    pub certificate_host: Option<String>,
}

// =============================================================================
// Network services
// =============================================================================

/// An outbound gateway that dials whatever authority each request URL names,
/// subject to peer allow/deny rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Peer patterns the service may reach: `public`, `private`, `local`,
    /// `network`, or a CIDR block. Empty means `["public"]`.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Peer patterns the service must not reach, checked after `allow`.
    #[serde(default)]
    pub deny: Vec<String>,
    /// When present, `https:` URLs are dialed with this TLS client
    /// configuration; when absent they are refused.
    pub tls_options: Option<TlsOptions>,
}

// =============================================================================
// Disk directory services
// =============================================================================

/// A read (and optionally write) view over one local directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskDirectoryConfig {
    /// Directory to serve. May instead be supplied on the command line with
    /// `--directory-path NAME=PATH`.
    pub path: Option<String>,
    /// Accept PUT requests.
    #[serde(default)]
    pub writable: bool,
    /// Serve names starting with `.` and include them in listings.
    #[serde(default)]
    pub allow_dotfiles: bool,
}

// =============================================================================
// Worker services
// =============================================================================

/// A sandboxed script with named bindings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Snapshot date selecting runtime behavior changes, `YYYY-MM-DD`.
    /// Required.
    pub compatibility_date: Option<String>,
    #[serde(default)]
    pub compatibility_flags: Vec<String>,
    #[serde(default)]
    pub script: ScriptSourceConfig,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    /// Service receiving the script's plain `fetch()` traffic. Defaults to
    /// the implicit `internet` service.
    pub global_outbound: Option<ServiceRef>,
}

/// Where the worker's script comes from and which layout it uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptSourceConfig {
    /// Load the script from a file.
    pub path: Option<PathBuf>,
    /// Inline script text. Mutually exclusive with `path`.
    pub code: Option<String>,
    #[serde(default)]
    pub form: ScriptForm,
}

/// Script layout: ES-module style exports, or the legacy single-file
/// service-worker form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptForm {
    #[default]
    Modules,
    ServiceWorker,
}

/// One named global injected into a worker's script.
///
/// Exactly one of the value fields must be set; which one determines the
/// binding kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    pub name: String,
    /// A plain text value.
    pub text: Option<String>,
    /// Raw bytes, base64-encoded in the config file.
    pub data: Option<String>,
    /// An arbitrary JSON value.
    pub json: Option<serde_json::Value>,
    pub crypto_key: Option<CryptoKeyConfig>,
    /// Another service, exposed as a sub-request channel.
    pub service: Option<ServiceRef>,
    /// A KV-namespace capability backed by another service.
    pub kv_namespace: Option<ServiceRef>,
    /// An R2-bucket capability backed by another service.
    pub r2_bucket: Option<ServiceRef>,
    /// An R2 admin capability backed by another service.
    pub r2_admin: Option<ServiceRef>,
    /// A compiled Wasm module (legacy service-worker scripts only).
    pub wasm_module: Option<PathBuf>,
    /// Deployment parameter (not implemented).
    pub parameter: Option<serde_json::Value>,
    /// Durable-object namespace (not implemented).
    pub durable_object_namespace: Option<String>,
}

/// Declarative key material for a crypto-key binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoKeyConfig {
    /// Raw key bytes given directly as text.
    pub raw: Option<String>,
    /// Raw key bytes, hex-encoded.
    pub hex: Option<String>,
    /// Raw key bytes, base64-encoded.
    pub base64: Option<String>,
    /// A `PRIVATE KEY` PEM block.
    pub pkcs8: Option<String>,
    /// A `PUBLIC KEY` PEM block.
    pub spki: Option<String>,
    /// A JSON Web Key.
    pub jwk: Option<serde_json::Value>,
    pub algorithm: Option<CryptoKeyAlgorithm>,
    #[serde(default)]
    pub extractable: bool,
    #[serde(default)]
    pub usages: Vec<String>,
}

/// Key algorithm: either just its name, or a full JSON algorithm object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CryptoKeyAlgorithm {
    Name(String),
    Json(serde_json::Value),
}

// =============================================================================
// Sockets
// =============================================================================

/// One listening socket, dispatching into one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketConfig {
    pub name: String,
    /// Bind address: `IP:PORT`, `*:PORT`, or `unix:PATH`. May instead be
    /// supplied on the command line with `--socket-addr NAME=ADDR`.
    pub address: Option<String>,
    pub service: ServiceRef,
    /// Plaintext HTTP. Mutually exclusive with `https`; the default when
    /// neither is given.
    pub http: Option<HttpOptions>,
    /// TLS-terminating HTTPS. Mutually exclusive with `http`.
    pub https: Option<HttpsSocketConfig>,
}

/// TLS parameters for an HTTPS socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpsSocketConfig {
    #[serde(default)]
    pub options: HttpOptions,
    #[serde(default)]
    pub tls_options: TlsOptions,
}

/// A reference to a named service, optionally pinning one of a worker's
/// named entrypoints. In TOML either a plain string or a table:
///
/// ```toml
/// service = "api"
/// service = { name = "gateway", entrypoint = "admin" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ServiceRefRepr")]
pub struct ServiceRef {
    pub name: String,
    pub entrypoint: Option<String>,
}

impl ServiceRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entrypoint: None,
        }
    }

    pub fn with_entrypoint(name: impl Into<String>, entrypoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entrypoint: Some(entrypoint.into()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ServiceRefRepr {
    Name(String),
    Full {
        name: String,
        entrypoint: Option<String>,
    },
}

impl From<ServiceRefRepr> for ServiceRef {
    fn from(repr: ServiceRefRepr) -> Self {
        match repr {
            ServiceRefRepr::Name(name) => Self {
                name,
                entrypoint: None,
            },
            ServiceRefRepr::Full { name, entrypoint } => Self { name, entrypoint },
        }
    }
}

// =============================================================================
// HTTP options
// =============================================================================

/// Per-socket / per-origin HTTP transform options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOptions {
    #[serde(default)]
    pub style: HttpStyle,
    /// Headers to set (value present) or strip (value absent) on requests.
    #[serde(default)]
    pub inject_request_headers: Vec<HeaderInjection>,
    /// Headers to set or strip on responses.
    #[serde(default)]
    pub inject_response_headers: Vec<HeaderInjection>,
    /// Header carrying the original URL scheme across a host-style hop.
    pub forwarded_proto_header: Option<String>,
    /// Header carrying the client-identity blob. When configured, inbound
    /// values are consumed (clients cannot spoof the blob) and outbound
    /// requests carry the current blob in this header.
    pub cf_blob_header: Option<String>,
}

/// How URLs appear on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HttpStyle {
    /// Origin-form request targets plus a `Host` header (ordinary HTTP).
    #[default]
    Host,
    /// Absolute-form request targets, left untouched.
    Proxy,
}

/// One header edit: set `name` to `value`, or remove it when `value` is
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: Option<String>,
}

// =============================================================================
// TLS options
// =============================================================================

/// Declarative TLS parameters, usable for both accepting and dialing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    pub keypair: Option<TlsKeypair>,
    /// Require (and verify) client certificates on accepted connections.
    #[serde(default)]
    pub require_client_certs: bool,
    /// Trust the platform certificate store.
    #[serde(default)]
    pub trust_browser_cas: bool,
    /// Additional trusted certificates, PEM text.
    #[serde(default)]
    pub trusted_certificates: Vec<String>,
    /// Minimum protocol version: `goodDefault`, `ssl3`, `tls1.0`, `tls1.1`,
    /// `tls1.2` or `tls1.3`.
    #[serde(default = "default_min_version")]
    pub min_version: String,
    /// Colon-separated cipher suite names to restrict to.
    pub cipher_list: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            keypair: None,
            require_client_certs: false,
            trust_browser_cas: false,
            trusted_certificates: Vec::new(),
            min_version: default_min_version(),
            cipher_list: None,
        }
    }
}

fn default_min_version() -> String {
    "goodDefault".to_string()
}

/// A private key plus its certificate chain, both PEM text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsKeypair {
    pub private_key: String,
    pub certificate_chain: String,
}
