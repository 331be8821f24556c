//! The inbound side: accept loops, peer-identity extraction, and the
//! per-connection HTTP server that dispatches into a service.

use crate::server::forward::UpstreamUpgrade;
use crate::server::rewriter::HttpRewriter;
use crate::server::service::{RequestMetadata, Service};
use crate::util::{escape_json_string, TaskSet};
use anyhow::Context as _;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// A bound-but-not-yet-serving socket.
pub(crate) enum BoundSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Parse and bind a socket address: `IP:PORT`, `HOST:PORT`, `*:PORT`, a bare
/// port, or `unix:PATH`.
pub(crate) async fn bind_socket(address: &str, default_port: u16) -> anyhow::Result<BoundSocket> {
    if let Some(path) = address.strip_prefix("unix:") {
        #[cfg(unix)]
        {
            // A leftover socket file from a previous run would make bind fail.
            match std::fs::remove_file(path) {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => {
                    return Err(e).with_context(|| format!("could not replace socket {path}"))
                },
            }
            let listener = tokio::net::UnixListener::bind(path)
                .with_context(|| format!("could not listen on {address}"))?;
            return Ok(BoundSocket::Unix(listener));
        }
        #[cfg(not(unix))]
        anyhow::bail!("unix sockets are not supported on this platform");
    }

    let candidate = if let Some(port) = address.strip_prefix("*:") {
        format!("0.0.0.0:{port}")
    } else if address == "*" {
        format!("0.0.0.0:{default_port}")
    } else if address.parse::<u16>().is_ok() {
        format!("0.0.0.0:{address}")
    } else if let Ok(ip) = address.parse::<std::net::IpAddr>() {
        SocketAddr::new(ip, default_port).to_string()
    } else if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{default_port}")
    };

    let addr = tokio::net::lookup_host(&candidate)
        .await
        .with_context(|| format!("invalid socket address \"{address}\""))?
        .next()
        .with_context(|| format!("\"{address}\" resolved to no addresses"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not listen on {addr}"))?;
    Ok(BoundSocket::Tcp(listener))
}

/// What a listener accepts on: plain TCP, TLS-terminated TCP, or a unix
/// socket.
pub(crate) enum Acceptor {
    Tcp(TcpListener),
    Tls {
        listener: TcpListener,
        tls: tokio_rustls::TlsAcceptor,
    },
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// One socket's accept loop plus its per-connection HTTP servers.
///
/// The listener borrows its service from the registry for its lifetime;
/// each connection borrows it per request.
pub(crate) struct HttpListener {
    name: String,
    service: Arc<dyn Service>,
    physical_protocol: &'static str,
    rewriter: Arc<HttpRewriter>,
    tasks: TaskSet,
}

impl HttpListener {
    pub(crate) fn new(
        name: String,
        service: Arc<dyn Service>,
        physical_protocol: &'static str,
        rewriter: Arc<HttpRewriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            service,
            physical_protocol,
            rewriter,
            tasks: TaskSet::new(),
        })
    }

    /// Run the accept loop until the acceptor fails. Connection handling
    /// errors are logged and never stop the loop; an accept error is fatal
    /// to the whole server.
    pub(crate) async fn run(self: Arc<Self>, acceptor: Acceptor) -> anyhow::Result<()> {
        match acceptor {
            Acceptor::Tcp(listener) => loop {
                let (stream, peer) = listener
                    .accept()
                    .await
                    .with_context(|| format!("socket \"{}\": accept failed", self.name))?;
                let this = self.clone();
                self.tasks.spawn(async move {
                    let cf_blob = this.network_peer_blob(peer);
                    this.serve_connection(stream, cf_blob).await;
                    Ok(())
                });
            },
            Acceptor::Tls { listener, tls } => loop {
                let (stream, peer) = listener
                    .accept()
                    .await
                    .with_context(|| format!("socket \"{}\": accept failed", self.name))?;
                let tls = tls.clone();
                let this = self.clone();
                self.tasks.spawn(async move {
                    match tls.accept(stream).await {
                        Ok(stream) => {
                            // The TLS identity unwraps to the underlying
                            // network identity; client-certificate fields
                            // are deliberately not encoded.
                            let cf_blob = this.network_peer_blob(peer);
                            this.serve_connection(stream, cf_blob).await;
                        },
                        Err(e) => debug!(%peer, "TLS handshake failed: {e}"),
                    }
                    Ok(())
                });
            },
            #[cfg(unix)]
            Acceptor::Unix(listener) => loop {
                let (stream, _) = listener
                    .accept()
                    .await
                    .with_context(|| format!("socket \"{}\": accept failed", self.name))?;
                let this = self.clone();
                self.tasks.spawn(async move {
                    let cf_blob = this.local_peer_blob(&stream);
                    this.serve_connection(stream, cf_blob).await;
                    Ok(())
                });
            },
        }
    }

    /// Identity blob for a network peer, unless the rewriter sources the
    /// blob from a configured header instead.
    fn network_peer_blob(&self, peer: SocketAddr) -> Option<String> {
        if self.rewriter.has_cf_blob_header() {
            return None;
        }
        Some(format!(
            "{{\"clientIp\":\"{}\"}}",
            escape_json_string(&peer.ip().to_string())
        ))
    }

    /// Identity blob for a local (unix-socket) peer: pid/uid when known.
    #[cfg(unix)]
    fn local_peer_blob(&self, stream: &tokio::net::UnixStream) -> Option<String> {
        if self.rewriter.has_cf_blob_header() {
            return None;
        }
        let mut parts = Vec::new();
        if let Ok(cred) = stream.peer_cred() {
            if let Some(pid) = cred.pid() {
                parts.push(format!("\"clientPid\":{pid}"));
            }
            parts.push(format!("\"clientUid\":{}", cred.uid()));
        }
        Some(format!("{{{}}}", parts.join(",")))
    }

    async fn serve_connection<I>(self: Arc<Self>, io: I, cf_blob: Option<String>)
    where
        I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let this = self.clone();
        let service = service_fn(move |req| {
            let this = this.clone();
            let cf_blob = cf_blob.clone();
            async move { Ok::<_, Infallible>(this.handle_request(req, cf_blob).await) }
        });

        let result = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await;
        if let Err(e) = result {
            debug!("connection error: {e}");
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        cf_blob: Option<String>,
    ) -> Response<Full<Bytes>> {
        let (mut parts, body) = req.into_parts();
        let client_upgrade = parts.extensions.remove::<OnUpgrade>();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!("failed to read request body: {e}");
                return plain_response(StatusCode::BAD_REQUEST);
            },
        };

        let mut metadata = RequestMetadata {
            cf_blob_json: cf_blob.clone(),
        };

        if self.rewriter.needs_rewrite_request() || cf_blob.is_some() {
            let rewritten = self.rewriter.rewrite_incoming_request(
                &parts.uri,
                self.physical_protocol,
                &parts.headers,
                &mut metadata.cf_blob_json,
            );
            match rewritten {
                Some(rewritten) => {
                    parts.uri = rewritten.uri;
                    parts.headers = rewritten.headers;
                },
                None => return plain_response(StatusCode::BAD_REQUEST),
            }
        }

        let handle = self.service.clone().start_request(metadata);
        let result = handle.http(Request::from_parts(parts, body)).await;

        match result {
            Ok(mut response) => {
                if self.rewriter.needs_rewrite_response() {
                    self.rewriter.rewrite_response(response.headers_mut());
                }
                if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                    let upstream = response
                        .extensions_mut()
                        .remove::<UpstreamUpgrade>()
                        .and_then(|u| u.take());
                    match (client_upgrade, upstream) {
                        (Some(client), Some(upstream)) => {
                            self.tasks.spawn(tunnel(client, upstream));
                        },
                        _ => {
                            error!("upgrade response without both connection halves");
                            return plain_response(StatusCode::BAD_GATEWAY);
                        },
                    }
                }
                response.map(Full::new)
            },
            Err(e) => {
                error!("Uncaught exception: {e}");
                let status =
                    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                plain_response(status)
            },
        }
    }
}

/// Copy bytes both ways between the client's and the origin's upgraded
/// connections until either side closes.
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade) -> anyhow::Result<()> {
    let (client, upstream) = tokio::try_join!(client, upstream).context("upgrade failed")?;
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        debug!("upgraded connection closed: {e}");
    }
    Ok(())
}

fn plain_response(status: StatusCode) -> Response<Full<Bytes>> {
    let reason = status.canonical_reason().unwrap_or("Error");
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from_static(reason.as_bytes())))
        .expect("static response headers")
}

/// Startup log line for one bound socket.
pub(crate) fn log_listening(name: &str, acceptor: &Acceptor, physical_protocol: &str) {
    match acceptor {
        Acceptor::Tcp(listener) | Acceptor::Tls { listener, .. } => {
            if let Ok(addr) = listener.local_addr() {
                info!("Socket \"{name}\" listening on {physical_protocol}://{addr}");
            }
        },
        #[cfg(unix)]
        Acceptor::Unix(listener) => {
            if let Ok(addr) = listener.local_addr() {
                info!("Socket \"{name}\" listening on unix socket {addr:?}");
            }
        },
    }
}
