//! The request pipeline: orchestrator, registry, listeners, rewriters, TLS
//! contexts, and the service implementations.
//!
//! [`Server::run`] is the top level. It walks the configuration in phases:
//! start every service's construction and register the futures, add the
//! implicit `internet` service, wire each socket (consuming command-line
//! overrides), complain about overrides that matched nothing, then serve
//! until every background task drains or one of them fails fatally.
//! Configuration errors never abort startup: the broken piece is replaced
//! by the invalid-config service and everything else keeps working.

mod disk;
mod error;
mod external;
mod forward;
mod listener;
mod network;
mod registry;
mod rewriter;
mod service;
mod tls;
mod worker;

pub use disk::DiskDirectoryService;
pub use error::{Error, ErrorReporter, Result};
pub use external::ExternalHttpService;
pub use network::NetworkService;
pub use registry::{ServiceFuture, ServiceRegistry};
pub use rewriter::{HttpRewriter, Rewritten};
pub use service::{
    invalid_config_service, EntrypointLookup, HttpRequest, HttpResponse, InvalidConfigService,
    RequestHandle, RequestMetadata, Service,
};
pub use tls::{make_tls_context, TlsContext};
pub use worker::{WorkerEntrypointService, WorkerService};

use crate::config::{
    Config, DiskDirectoryConfig, ExternalConfig, HttpOptions, ServiceKind, SocketConfig,
};
use crate::script::{ScriptHostFactory, UnsupportedScriptFactory};
use crate::util::TaskSet;
use anyhow::Context as _;
use external::ExternalTls;
use futures::future::{ready, BoxFuture, FutureExt};
use listener::{Acceptor, BoundSocket, HttpListener};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A `--socket-addr` override: either an address string or a socket the
/// embedder already bound (tests use this to grab an ephemeral port).
pub enum SocketOverride {
    Address(String),
    Listener(std::net::TcpListener),
}

/// The orchestrator: owns the services, wires the listeners, runs until a
/// fatal error.
pub struct Server {
    reporter: ErrorReporter,
    script_factory: Arc<dyn ScriptHostFactory>,
    socket_overrides: HashMap<String, SocketOverride>,
    external_overrides: HashMap<String, String>,
    directory_overrides: HashMap<String, String>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            reporter: ErrorReporter::new(),
            script_factory: Arc::new(UnsupportedScriptFactory),
            socket_overrides: HashMap::new(),
            external_overrides: HashMap::new(),
            directory_overrides: HashMap::new(),
        }
    }

    /// Supply the script engine workers run on.
    #[must_use]
    pub fn script_host_factory(mut self, factory: Arc<dyn ScriptHostFactory>) -> Self {
        self.script_factory = factory;
        self
    }

    /// Override a socket's bind address (`--socket-addr NAME=ADDR`).
    #[must_use]
    pub fn override_socket_addr(
        mut self,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        self.socket_overrides
            .insert(name.into(), SocketOverride::Address(address.into()));
        self
    }

    /// Override a socket with a pre-bound listener.
    #[must_use]
    pub fn override_socket_listener(
        mut self,
        name: impl Into<String>,
        listener: std::net::TcpListener,
    ) -> Self {
        self.socket_overrides
            .insert(name.into(), SocketOverride::Listener(listener));
        self
    }

    /// Override an external service's address (`--external-addr NAME=ADDR`).
    #[must_use]
    pub fn override_external_addr(
        mut self,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        self.external_overrides.insert(name.into(), address.into());
        self
    }

    /// Override a disk service's path (`--directory-path NAME=PATH`).
    #[must_use]
    pub fn override_directory_path(
        mut self,
        name: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        self.directory_overrides.insert(name.into(), path.into());
        self
    }

    /// Handle on the configuration-error sink (shared; reports accumulate).
    pub fn error_reporter(&self) -> ErrorReporter {
        self.reporter.clone()
    }

    /// Assemble the service graph and serve until all background tasks
    /// drain or one fails fatally.
    pub async fn run(mut self, config: Config) -> anyhow::Result<()> {
        let (fatal_tx, fatal_rx) = oneshot::channel();
        let tasks = TaskSet::with_fatal(fatal_tx);
        let registry = Arc::new(ServiceRegistry::new(self.reporter.clone()));

        // Start construction of every configured service. Registration is
        // synchronous; the futures themselves resolve later, which is what
        // lets services forward-reference each other.
        for service_conf in &config.services {
            let future = self.make_service(&service_conf.name, &service_conf.kind, &registry);
            if let Some(shared) = registry.register(&service_conf.name, future) {
                // Drive construction even if no socket references it.
                tasks.spawn(shared.map(|_| Ok(())));
            }
        }

        // The implicit "internet" service, unless the config defined one.
        {
            let reporter = self.reporter.clone();
            registry.register_default(
                "internet",
                async move {
                    match NetworkService::internet() {
                        Ok(service) => Arc::new(service) as Arc<dyn Service>,
                        Err(e) => {
                            reporter.report(format!(
                                "failed to build the default \"internet\" service: {e:#}"
                            ));
                            invalid_config_service()
                        },
                    }
                }
                .boxed(),
            );
        }

        for socket in &config.sockets {
            self.start_socket(socket, &registry, &tasks);
        }

        for name in self.socket_overrides.keys() {
            self.reporter.report(format!(
                "Config did not define any socket named \"{name}\" to match the override \
                 provided on the command line."
            ));
        }
        for name in self.external_overrides.keys() {
            self.reporter.report(format!(
                "Config did not define any external service named \"{name}\" to match the \
                 override provided on the command line."
            ));
        }
        for name in self.directory_overrides.keys() {
            self.reporter.report(format!(
                "Config did not define any disk service named \"{name}\" to match the override \
                 provided on the command line."
            ));
        }

        // Every configured header name has been parsed by now; nothing
        // touches configuration strings once requests start flowing.

        tokio::select! {
            () = tasks.on_empty() => Ok(()),
            err = fatal_rx => match err {
                Ok(e) => Err(e),
                Err(_) => Ok(()),
            },
        }
    }

    fn make_service(
        &mut self,
        name: &str,
        kind: &ServiceKind,
        registry: &Arc<ServiceRegistry>,
    ) -> BoxFuture<'static, Arc<dyn Service>> {
        match kind {
            ServiceKind::External(conf) => self.make_external(name, conf),
            ServiceKind::Network(conf) => match NetworkService::new(conf) {
                Ok(service) => {
                    let service: Arc<dyn Service> = Arc::new(service);
                    ready(service).boxed()
                },
                Err(e) => {
                    self.reporter
                        .report(format!("Network service \"{name}\": {e:#}"));
                    ready(invalid_config_service()).boxed()
                },
            },
            ServiceKind::Worker(conf) => {
                let future = worker::make_worker(
                    name.to_string(),
                    conf.clone(),
                    registry.clone(),
                    self.script_factory.clone(),
                    self.reporter.clone(),
                );
                async move { future.await as Arc<dyn Service> }.boxed()
            },
            ServiceKind::DiskDirectory(conf) => self.make_disk(name, conf),
        }
    }

    fn make_external(
        &mut self,
        name: &str,
        conf: &ExternalConfig,
    ) -> BoxFuture<'static, Arc<dyn Service>> {
        let address = match self.external_overrides.remove(name) {
            Some(address) => Some(address),
            None => conf.address.clone(),
        };
        let Some(address) = address else {
            self.reporter.report(format!(
                "External service \"{name}\" has no address in the config, so must be \
                 specified on the command line with `--external-addr`."
            ));
            return ready(invalid_config_service()).boxed();
        };

        if conf.http.is_some() && conf.https.is_some() {
            self.reporter.report(format!(
                "External service \"{name}\" specifies both http and https."
            ));
            return ready(invalid_config_service()).boxed();
        }

        // The rewriter (and any TLS context) must be built synchronously,
        // before address resolution suspends.
        if let Some(https) = &conf.https {
            let rewriter = match HttpRewriter::new(&https.options) {
                Ok(rewriter) => Arc::new(rewriter),
                Err(e) => {
                    self.reporter
                        .report(format!("External service \"{name}\": {e:#}"));
                    return ready(invalid_config_service()).boxed();
                },
            };
            let connector = match make_tls_context(&https.tls_options) {
                Ok(ctx) => ctx.connector(),
                Err(e) => {
                    self.reporter
                        .report(format!("External service \"{name}\": {e:#}"));
                    return ready(invalid_config_service()).boxed();
                },
            };
            let certificate_host = https.certificate_host.clone();
            let reporter = self.reporter.clone();
            let name = name.to_string();
            async move {
                let (host, addr) = match external::resolve_remote_address(&address, 443).await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        reporter.report(format!("External service \"{name}\": {e:#}"));
                        return invalid_config_service();
                    },
                };
                let sni = certificate_host.unwrap_or(host);
                let Ok(server_name) = ServerName::try_from(sni.clone()) else {
                    reporter.report(format!(
                        "External service \"{name}\" has invalid TLS host \"{sni}\"."
                    ));
                    return invalid_config_service();
                };
                Arc::new(ExternalHttpService::new(
                    addr,
                    Some(ExternalTls {
                        connector,
                        server_name,
                    }),
                    rewriter,
                )) as Arc<dyn Service>
            }
            .boxed()
        } else {
            let options = conf.http.clone().unwrap_or_default();
            let rewriter = match HttpRewriter::new(&options) {
                Ok(rewriter) => Arc::new(rewriter),
                Err(e) => {
                    self.reporter
                        .report(format!("External service \"{name}\": {e:#}"));
                    return ready(invalid_config_service()).boxed();
                },
            };
            let reporter = self.reporter.clone();
            let name = name.to_string();
            async move {
                match external::resolve_remote_address(&address, 80).await {
                    Ok((_, addr)) => Arc::new(ExternalHttpService::new(addr, None, rewriter))
                        as Arc<dyn Service>,
                    Err(e) => {
                        reporter.report(format!("External service \"{name}\": {e:#}"));
                        invalid_config_service()
                    },
                }
            }
            .boxed()
        }
    }

    fn make_disk(
        &mut self,
        name: &str,
        conf: &DiskDirectoryConfig,
    ) -> BoxFuture<'static, Arc<dyn Service>> {
        let path = match self.directory_overrides.remove(name) {
            Some(path) => Some(path),
            None => conf.path.clone(),
        };
        let Some(path) = path else {
            self.reporter.report(format!(
                "Directory \"{name}\" has no path in the config, so must be specified on the \
                 command line with `--directory-path`."
            ));
            return ready(invalid_config_service()).boxed();
        };

        let path = PathBuf::from(path);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                let service: Arc<dyn Service> = Arc::new(DiskDirectoryService::new(
                    path,
                    conf.writable,
                    conf.allow_dotfiles,
                ));
                ready(service).boxed()
            },
            _ => {
                self.reporter.report(format!(
                    "Directory named \"{name}\" not found: {}",
                    path.display()
                ));
                ready(invalid_config_service()).boxed()
            },
        }
    }

    fn start_socket(
        &mut self,
        socket: &SocketConfig,
        registry: &Arc<ServiceRegistry>,
        tasks: &TaskSet,
    ) {
        let name = socket.name.clone();

        enum Pending {
            Bound(std::net::TcpListener),
            Address(String),
        }

        let pending = match self.socket_overrides.remove(&name) {
            Some(SocketOverride::Address(address)) => Pending::Address(address),
            Some(SocketOverride::Listener(listener)) => Pending::Bound(listener),
            None => match &socket.address {
                Some(address) => Pending::Address(address.clone()),
                None => {
                    self.reporter.report(format!(
                        "Socket \"{name}\" has no address in the config, so must be specified \
                         on the command line with `--socket-addr`."
                    ));
                    return;
                },
            },
        };

        if socket.http.is_some() && socket.https.is_some() {
            self.reporter
                .report(format!("Socket \"{name}\" specifies both http and https."));
            return;
        }

        let (default_port, physical_protocol, options, tls_acceptor) = match &socket.https {
            Some(https) => {
                let acceptor = match make_tls_context(&https.tls_options) {
                    Ok(ctx) => ctx.acceptor(),
                    Err(e) => {
                        self.reporter.report(format!("Socket \"{name}\": {e:#}"));
                        return;
                    },
                };
                let Some(acceptor) = acceptor else {
                    self.reporter.report(format!(
                        "Socket \"{name}\" is https but its tlsOptions have no keypair."
                    ));
                    return;
                };
                (443, "https", https.options.clone(), Some(acceptor))
            },
            None => (
                80,
                "http",
                socket.http.clone().unwrap_or_else(HttpOptions::default),
                None,
            ),
        };

        if let (Pending::Address(address), Some(_)) = (&pending, &tls_acceptor) {
            if address.starts_with("unix:") {
                self.reporter.report(format!(
                    "Socket \"{name}\": TLS over unix sockets is not supported."
                ));
                return;
            }
        }

        // Build the rewriter now: header names are parsed during startup
        // only, never once requests are flowing.
        let rewriter = match HttpRewriter::new(&options) {
            Ok(rewriter) => Arc::new(rewriter),
            Err(e) => {
                self.reporter.report(format!("Socket \"{name}\": {e:#}"));
                return;
            },
        };

        let service_ref = socket.service.clone();
        let registry = registry.clone();
        tasks.spawn(async move {
            let bound = match pending {
                Pending::Bound(listener) => {
                    listener
                        .set_nonblocking(true)
                        .with_context(|| format!("socket \"{name}\""))?;
                    BoundSocket::Tcp(
                        tokio::net::TcpListener::from_std(listener)
                            .with_context(|| format!("socket \"{name}\""))?,
                    )
                },
                Pending::Address(address) => {
                    listener::bind_socket(&address, default_port)
                        .await
                        .with_context(|| format!("socket \"{name}\""))?
                },
            };

            let service = registry
                .lookup(&service_ref, format!("Socket \"{name}\""))
                .await;

            let acceptor = match (bound, tls_acceptor) {
                (BoundSocket::Tcp(listener), None) => Acceptor::Tcp(listener),
                (BoundSocket::Tcp(listener), Some(tls)) => Acceptor::Tls { listener, tls },
                #[cfg(unix)]
                (BoundSocket::Unix(listener), None) => Acceptor::Unix(listener),
                #[cfg(unix)]
                (BoundSocket::Unix(_), Some(_)) => {
                    anyhow::bail!("socket \"{name}\": TLS over unix sockets is not supported")
                },
            };

            listener::log_listening(&name, &acceptor, physical_protocol);
            HttpListener::new(name, service, physical_protocol, rewriter)
                .run(acceptor)
                .await
        });
    }
}
