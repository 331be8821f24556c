//! Request/response rewriting between the wire and the service graph.
//!
//! Each socket and each external origin owns an [`HttpRewriter`] built from
//! its `HttpOptions`. The rewriter translates between "host" style (ordinary
//! origin-form requests plus a `Host` header) and "proxy" style (absolute
//! URLs), carries the original scheme in a configurable forwarded-proto
//! header, moves the client-identity blob in and out of a configurable
//! header, and applies the configured header injections.
//!
//! All header names are parsed once, at construction; nothing here touches
//! configuration strings after the server starts listening.

use crate::config::{HeaderInjection, HttpOptions, HttpStyle};
use crate::server::error::{Error, Result};
use anyhow::Context;
use http::header::HOST;
use http::uri::{PathAndQuery, Uri};
use http::{HeaderMap, HeaderName, HeaderValue};

/// A rewritten request: the headers to forward and the URL form to emit.
pub struct Rewritten {
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Applies one socket's (or origin's) configured HTTP transforms.
pub struct HttpRewriter {
    style: HttpStyle,
    forwarded_proto: Option<HeaderName>,
    cf_blob: Option<HeaderName>,
    request_injector: HeaderInjector,
    response_injector: HeaderInjector,
}

impl HttpRewriter {
    /// Build a rewriter, parsing every configured header name and value.
    pub fn new(options: &HttpOptions) -> anyhow::Result<Self> {
        let forwarded_proto = options
            .forwarded_proto_header
            .as_deref()
            .map(parse_header_name)
            .transpose()
            .context("forwardedProtoHeader")?;
        let cf_blob = options
            .cf_blob_header
            .as_deref()
            .map(parse_header_name)
            .transpose()
            .context("cfBlobHeader")?;
        Ok(Self {
            style: options.style,
            forwarded_proto,
            cf_blob,
            request_injector: HeaderInjector::from_config(&options.inject_request_headers)
                .context("injectRequestHeaders")?,
            response_injector: HeaderInjector::from_config(&options.inject_response_headers)
                .context("injectResponseHeaders")?,
        })
    }

    /// Whether a client-identity header is configured. When it is, the
    /// listener must not synthesize a blob itself - the rewriter sources
    /// (and clears) the value from request headers instead.
    pub fn has_cf_blob_header(&self) -> bool {
        self.cf_blob.is_some()
    }

    pub fn needs_rewrite_request(&self) -> bool {
        self.style == HttpStyle::Host
            || self.cf_blob.is_some()
            || !self.request_injector.is_empty()
    }

    pub fn needs_rewrite_response(&self) -> bool {
        !self.response_injector.is_empty()
    }

    /// Rewrite a request leaving the graph toward the wire.
    ///
    /// Under host style the absolute URL's authority moves into `Host`, the
    /// scheme moves into the forwarded-proto header (when configured), and
    /// the URL is re-emitted in origin form. The identity blob header is set
    /// from `cf_blob_json` or removed. Injections run last so they override
    /// anything derived above.
    pub fn rewrite_outgoing_request(
        &self,
        uri: &Uri,
        headers: &HeaderMap,
        cf_blob_json: Option<&str>,
    ) -> Result<Rewritten> {
        let mut result = Rewritten {
            uri: uri.clone(),
            headers: headers.clone(),
        };

        if self.style == HttpStyle::Host {
            let authority = uri.authority().ok_or_else(|| {
                Error::InvalidRequest("expected an absolute URL for a host-style hop".into())
            })?;
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|_| Error::InvalidRequest("URL authority is not a valid Host".into()))?;
            result.headers.insert(HOST, host);
            if let Some(h) = &self.forwarded_proto {
                let scheme = uri.scheme_str().ok_or_else(|| {
                    Error::InvalidRequest("expected an absolute URL for a host-style hop".into())
                })?;
                result
                    .headers
                    .insert(h.clone(), HeaderValue::from_str(scheme).unwrap_or_else(|_| {
                        HeaderValue::from_static("http")
                    }));
            }
            result.uri = Uri::from(origin_form(uri));
        }

        if let Some(h) = &self.cf_blob {
            match cf_blob_json {
                Some(blob) => {
                    let value = HeaderValue::from_str(blob).map_err(|_| {
                        Error::InvalidRequest("client identity blob is not a valid header".into())
                    })?;
                    result.headers.insert(h.clone(), value);
                },
                None => {
                    result.headers.remove(h);
                },
            }
        }

        self.request_injector.apply(&mut result.headers);

        Ok(result)
    }

    /// Rewrite a request arriving from the wire into the graph.
    ///
    /// The inverse of [`rewrite_outgoing_request`]: under host style the
    /// `Host` header becomes the URL authority and the forwarded-proto
    /// header (or, absent that, the physical protocol) becomes the scheme,
    /// yielding an absolute URL. A configured identity header is consumed
    /// into `cf_blob_json` and stripped so clients can never spoof it.
    ///
    /// Returns `None` when the request cannot be interpreted (no `Host`
    /// header under host style); the caller answers 400.
    ///
    /// [`rewrite_outgoing_request`]: Self::rewrite_outgoing_request
    pub fn rewrite_incoming_request(
        &self,
        uri: &Uri,
        physical_protocol: &str,
        headers: &HeaderMap,
        cf_blob_json: &mut Option<String>,
    ) -> Option<Rewritten> {
        let mut result = Rewritten {
            uri: uri.clone(),
            headers: headers.clone(),
        };

        if self.style == HttpStyle::Host {
            // Host style expects origin-form targets; an absolute target
            // here is as unusable as a missing Host header.
            if uri.authority().is_some() {
                return None;
            }
            let host = headers.get(HOST)?.to_str().ok()?.trim().to_string();

            let mut scheme = None;
            if let Some(h) = &self.forwarded_proto {
                if let Some(value) = result.headers.remove(h) {
                    scheme = Some(value.to_str().ok()?.to_string());
                }
            }
            let scheme = scheme.unwrap_or_else(|| physical_protocol.to_string());

            let path_and_query = uri
                .path_and_query()
                .map_or("/", PathAndQuery::as_str);
            result.uri = Uri::builder()
                .scheme(scheme.as_str())
                .authority(host)
                .path_and_query(path_and_query)
                .build()
                .ok()?;
        }

        if let Some(h) = &self.cf_blob {
            if let Some(value) = result.headers.remove(h) {
                *cf_blob_json = Some(value.to_str().ok()?.to_string());
            }
        }

        self.request_injector.apply(&mut result.headers);

        Some(result)
    }

    /// Apply the configured response injections in place.
    pub fn rewrite_response(&self, headers: &mut HeaderMap) {
        self.response_injector.apply(headers);
    }
}

/// Strip an absolute URI down to its origin-form request target.
fn origin_form(uri: &Uri) -> PathAndQuery {
    match uri.path_and_query() {
        Some(pq) => pq.clone(),
        None => PathAndQuery::from_static("/"),
    }
}

/// A compiled list of header edits; a missing value means "remove".
///
/// Edits apply in configuration order, so a later entry for the same name
/// wins.
struct HeaderInjector {
    entries: Vec<(HeaderName, Option<HeaderValue>)>,
}

impl HeaderInjector {
    fn from_config(config: &[HeaderInjection]) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(config.len());
        for injection in config {
            let name = parse_header_name(&injection.name)?;
            let value = injection
                .value
                .as_deref()
                .map(|v| {
                    HeaderValue::from_str(v)
                        .with_context(|| format!("invalid value for injected header \"{}\"", injection.name))
                })
                .transpose()?;
            entries.push((name, value));
        }
        Ok(Self { entries })
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.entries {
            match value {
                Some(v) => {
                    headers.insert(name.clone(), v.clone());
                },
                None => {
                    headers.remove(name);
                },
            }
        }
    }
}

fn parse_header_name(name: &str) -> anyhow::Result<HeaderName> {
    name.parse::<HeaderName>()
        .with_context(|| format!("invalid header name \"{name}\""))
}
