//! Outbound network gateway: dials whatever authority each request URL
//! names, subject to peer allow/deny rules.
//!
//! Also provides the implicit `internet` service every configuration gets:
//! public peers only, system trust store, TLS enabled.

use crate::config::{NetworkConfig, TlsOptions};
use crate::server::error::{Error, Result};
use crate::server::forward::{self, OutboundStream};
use crate::server::service::{
    HttpRequest, HttpResponse, RequestHandle, RequestMetadata, Service,
};
use crate::server::tls::make_tls_context;
use anyhow::Context;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

// =============================================================================
// Peer rules
// =============================================================================

/// One peer pattern from the allow/deny lists.
enum PeerPattern {
    /// Globally routable addresses.
    Public,
    /// RFC 1918 / unique-local / link-local addresses.
    Private,
    /// The local host (loopback).
    Local,
    /// Any network peer, public or private, but not loopback.
    Network,
    /// An explicit CIDR block (a bare IP means a full-length prefix).
    Cidr { net: IpAddr, prefix: u8 },
}

impl PeerPattern {
    fn parse(pattern: &str) -> anyhow::Result<Self> {
        match pattern {
            "public" => return Ok(Self::Public),
            "private" => return Ok(Self::Private),
            "local" => return Ok(Self::Local),
            "network" => return Ok(Self::Network),
            _ => {},
        }

        let (addr, prefix) = match pattern.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .with_context(|| format!("invalid prefix length in \"{pattern}\""))?;
                (addr, Some(prefix))
            },
            None => (pattern, None),
        };
        let net: IpAddr = addr
            .parse()
            .with_context(|| format!("unrecognized peer pattern \"{pattern}\""))?;
        let max = if net.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        anyhow::ensure!(
            prefix <= max,
            "prefix length {prefix} is too long in \"{pattern}\""
        );
        Ok(Self::Cidr { net, prefix })
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Public => is_public(ip),
            Self::Private => is_private(ip),
            Self::Local => is_local(ip),
            Self::Network => is_public(ip) || is_private(ip),
            Self::Cidr { net, prefix } => cidr_matches(*net, *prefix, ip),
        }
    }
}

fn is_local(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => is_unique_local_v6(v6) || is_link_local_v6(v6),
    }
}

fn is_public(ip: IpAddr) -> bool {
    if is_local(ip) || is_private(ip) {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_broadcast() && !v4.is_documentation(),
        IpAddr::V6(_) => true,
    }
}

fn is_unique_local_v6(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local_v6(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

fn cidr_matches(net: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix))
            };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        },
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix))
            };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        },
        _ => false,
    }
}

/// Compiled allow/deny peer rules. A peer is reachable when it matches an
/// allow pattern and no deny pattern.
pub(crate) struct PeerRules {
    allow: Vec<PeerPattern>,
    deny: Vec<PeerPattern>,
}

impl PeerRules {
    /// An empty allow list means "public only".
    pub(crate) fn from_config(allow: &[String], deny: &[String]) -> anyhow::Result<Self> {
        let allow = if allow.is_empty() {
            vec![PeerPattern::Public]
        } else {
            allow
                .iter()
                .map(|p| PeerPattern::parse(p))
                .collect::<anyhow::Result<_>>()?
        };
        let deny = deny
            .iter()
            .map(|p| PeerPattern::parse(p))
            .collect::<anyhow::Result<_>>()?;
        Ok(Self { allow, deny })
    }

    pub(crate) fn public_only() -> Self {
        Self {
            allow: vec![PeerPattern::Public],
            deny: Vec::new(),
        }
    }

    pub(crate) fn allows(&self, ip: IpAddr) -> bool {
        self.allow.iter().any(|p| p.matches(ip)) && !self.deny.iter().any(|p| p.matches(ip))
    }
}

// =============================================================================
// The service
// =============================================================================

/// Dials each sub-request's URL authority fresh; one shared stateless
/// handler serves every request.
pub struct NetworkService {
    rules: PeerRules,
    tls: Option<TlsConnector>,
}

impl NetworkService {
    pub(crate) fn new(conf: &NetworkConfig) -> anyhow::Result<Self> {
        let rules = PeerRules::from_config(&conf.allow, &conf.deny)?;
        let tls = conf
            .tls_options
            .as_ref()
            .map(|options| make_tls_context(options).map(|ctx| ctx.connector()))
            .transpose()?;
        Ok(Self { rules, tls })
    }

    /// The implicit `internet` service: public peers, system trust store.
    pub(crate) fn internet() -> anyhow::Result<Self> {
        let options = TlsOptions {
            trust_browser_cas: true,
            ..TlsOptions::default()
        };
        Ok(Self {
            rules: PeerRules::public_only(),
            tls: Some(make_tls_context(&options)?.connector()),
        })
    }

    async fn dial(&self, uri: &http::Uri) -> Result<OutboundStream> {
        let scheme = uri.scheme_str().ok_or_else(|| {
            Error::InvalidRequest("network services require absolute request URLs".into())
        })?;
        let (default_port, use_tls) = match scheme {
            "http" => (80, false),
            "https" => (443, true),
            other => {
                return Err(Error::InvalidRequest(format!(
                    "unsupported URL scheme \"{other}\""
                )))
            },
        };
        if use_tls && self.tls.is_none() {
            return Err(Error::TlsNotConfigured);
        }

        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidRequest("request URL has no host".into()))?;
        let port = uri.port_u16().unwrap_or(default_port);

        let addrs: Vec<SocketAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
            vec![SocketAddr::new(ip, port)]
        } else {
            tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| Error::upstream(format!("resolving {host}: {e}")))?
                .collect()
        };
        let addr = addrs
            .iter()
            .find(|a| self.rules.allows(a.ip()))
            .ok_or_else(|| Error::PeerNotAllowed {
                addr: format!("{host}:{port}"),
            })?;

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::upstream(format!("connecting to {addr}: {e}")))?;

        if use_tls {
            let connector = self.tls.as_ref().ok_or(Error::TlsNotConfigured)?;
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| Error::InvalidRequest(format!("invalid TLS host \"{host}\"")))?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::upstream(format!("TLS handshake with {host}: {e}")))?;
            Ok(OutboundStream::Tls(Box::new(stream)))
        } else {
            Ok(OutboundStream::Plain(tcp))
        }
    }
}

impl Service for NetworkService {
    fn start_request(self: Arc<Self>, _metadata: RequestMetadata) -> Box<dyn RequestHandle> {
        Box::new(NetworkHandle { service: self })
    }
}

struct NetworkHandle {
    service: Arc<NetworkService>,
}

#[async_trait]
impl RequestHandle for NetworkHandle {
    fn describe(&self) -> &'static str {
        "External HTTP servers"
    }

    async fn http(self: Box<Self>, req: HttpRequest) -> Result<HttpResponse> {
        let stream = self.service.dial(req.uri()).await?;
        forward::send_request(stream, req).await
    }
}
