//! Reverse-proxy service forwarding to one fixed remote origin.

use crate::server::error::{Error, Result};
use crate::server::forward::{self, OutboundStream};
use crate::server::rewriter::HttpRewriter;
use crate::server::service::{
    HttpRequest, HttpResponse, RequestHandle, RequestMetadata, Service,
};
use anyhow::Context;
use async_trait::async_trait;
use http::Request;
use rustls::pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// TLS dialing parameters for an external origin: the connector plus the
/// name to verify the origin's certificate against (and send as SNI).
pub(crate) struct ExternalTls {
    pub(crate) connector: TlsConnector,
    pub(crate) server_name: ServerName<'static>,
}

/// Forwards requests to a specific remote origin, applying the configured
/// rewriter on the way out and back.
pub struct ExternalHttpService {
    addr: SocketAddr,
    tls: Option<ExternalTls>,
    rewriter: Arc<HttpRewriter>,
}

impl ExternalHttpService {
    pub(crate) fn new(
        addr: SocketAddr,
        tls: Option<ExternalTls>,
        rewriter: Arc<HttpRewriter>,
    ) -> Self {
        Self {
            addr,
            tls,
            rewriter,
        }
    }

    async fn dial(&self) -> Result<OutboundStream> {
        let tcp = TcpStream::connect(self.addr)
            .await
            .map_err(|e| Error::upstream(format!("connecting to {}: {e}", self.addr)))?;
        match &self.tls {
            None => Ok(OutboundStream::Plain(tcp)),
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|e| {
                        Error::upstream(format!("TLS handshake with {}: {e}", self.addr))
                    })?;
                Ok(OutboundStream::Tls(Box::new(stream)))
            },
        }
    }
}

impl Service for ExternalHttpService {
    fn start_request(self: Arc<Self>, metadata: RequestMetadata) -> Box<dyn RequestHandle> {
        Box::new(ExternalHandle {
            service: self,
            metadata,
        })
    }
}

struct ExternalHandle {
    service: Arc<ExternalHttpService>,
    metadata: RequestMetadata,
}

#[async_trait]
impl RequestHandle for ExternalHandle {
    fn describe(&self) -> &'static str {
        "External HTTP servers"
    }

    async fn http(self: Box<Self>, req: HttpRequest) -> Result<HttpResponse> {
        let rewriter = &self.service.rewriter;

        let req = if rewriter.needs_rewrite_request() {
            let (mut parts, body) = req.into_parts();
            let rewritten = rewriter.rewrite_outgoing_request(
                &parts.uri,
                &parts.headers,
                self.metadata.cf_blob_json.as_deref(),
            )?;
            parts.uri = rewritten.uri;
            parts.headers = rewritten.headers;
            Request::from_parts(parts, body)
        } else {
            req
        };

        let stream = self.service.dial().await?;
        let mut response = forward::send_request(stream, req).await?;

        if rewriter.needs_rewrite_response() {
            rewriter.rewrite_response(response.headers_mut());
        }

        Ok(response)
    }
}

/// Resolve a configured `host[:port]` address once, at startup. Returns the
/// host name (for SNI/certificate checks) along with the socket address.
pub(crate) async fn resolve_remote_address(
    address: &str,
    default_port: u16,
) -> anyhow::Result<(String, SocketAddr)> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr));
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok((ip.to_string(), SocketAddr::new(ip, default_port)));
    }

    let (host, port) = split_host_port(address).unwrap_or((address, default_port));
    let resolved = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve \"{address}\""))?
        .next()
        .with_context(|| format!("\"{address}\" resolved to no addresses"))?;
    Ok((host.to_string(), resolved))
}

/// Split `host:port` when the suffix is a valid port and the host is not a
/// bare IPv6 literal.
fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() || host.contains(':') {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}
