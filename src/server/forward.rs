//! Shared dial-and-forward plumbing for services that speak HTTP/1 to a
//! remote peer.
//!
//! Uses hyper's connection-level client rather than a pooled one: the
//! connection-level client emits the request-target URI verbatim, which the
//! host/proxy URL-style contract depends on (origin-form after a host-style
//! rewrite, absolute-form under proxy style).

use crate::server::error::{Error, Result};
use crate::server::service::{HttpRequest, HttpResponse};
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// An established outbound connection, plaintext or TLS.
pub(crate) enum OutboundStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OutboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Response extension carrying the origin side of a `101 Switching
/// Protocols` exchange. The listener joins it with the client side.
///
/// Extensions must be `Clone`; the slot makes the one-shot handle cloneable
/// (only the taker gets it).
#[derive(Clone)]
pub(crate) struct UpstreamUpgrade(Arc<parking_lot::Mutex<Option<OnUpgrade>>>);

impl UpstreamUpgrade {
    fn new(upgrade: OnUpgrade) -> Self {
        Self(Arc::new(parking_lot::Mutex::new(Some(upgrade))))
    }

    /// Claim the upgrade handle; only the first caller gets it.
    pub(crate) fn take(&self) -> Option<OnUpgrade> {
        self.0.lock().take()
    }
}

/// Send one request over a freshly established connection and collect the
/// response.
///
/// A `101` response is returned with an empty body and an
/// [`UpstreamUpgrade`] extension instead of being collected.
pub(crate) async fn send_request(
    stream: OutboundStream,
    req: HttpRequest,
) -> Result<HttpResponse> {
    let (mut parts, body) = req.into_parts();

    // HTTP/1.1 requires Host even in absolute form; derive it when the
    // rewriter didn't set one.
    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(HOST, value);
            }
        }
    }

    let req = Request::from_parts(parts, Full::new(body));

    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| Error::upstream(format!("HTTP handshake failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("outbound connection ended with error: {e}");
        }
    });

    let mut response = sender
        .send_request(req)
        .await
        .map_err(|e| Error::upstream(e.to_string()))?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let upgrade = hyper::upgrade::on(&mut response);
        let (parts, _body) = response.into_parts();
        let mut response = Response::from_parts(parts, Bytes::new());
        response
            .extensions_mut()
            .insert(UpstreamUpgrade::new(upgrade));
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| Error::upstream(format!("reading response body: {e}")))?
        .to_bytes();
    Ok(Response::from_parts(parts, body))
}
