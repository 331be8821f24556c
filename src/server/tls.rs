//! TLS contexts built from declarative options.
//!
//! One [`TlsContext`] serves both directions: accepting (HTTPS sockets,
//! which need a keypair) and dialing (external origins and network
//! services, which need a trust store). The context owns the rustls
//! configuration; acceptors and connectors handed out from it are cheap
//! clones over shared state, so the context outlives everything derived
//! from it.

use crate::config::TlsOptions;
use anyhow::{bail, Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

/// A built TLS context: a client side always, a server side when the
/// options carried a keypair.
pub struct TlsContext {
    server: Option<TlsAcceptor>,
    client: TlsConnector,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server", &self.server.is_some())
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// An acceptor for terminating inbound TLS. `None` when the options had
    /// no keypair.
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        self.server.clone()
    }

    /// A connector for dialing outbound TLS.
    pub fn connector(&self) -> TlsConnector {
        self.client.clone()
    }
}

/// Build a [`TlsContext`] from declarative options.
pub fn make_tls_context(options: &TlsOptions) -> Result<TlsContext> {
    let provider = crypto_provider(options.cipher_list.as_deref())?;
    let versions = protocol_versions(&options.min_version)?;

    let keypair = options
        .keypair
        .as_ref()
        .map(|kp| -> Result<_> {
            let chain = parse_certificates(&kp.certificate_chain, "certificateChain")?;
            let key = parse_private_key(&kp.private_key)?;
            Ok((chain, key))
        })
        .transpose()?;

    let mut roots = RootCertStore::empty();
    if options.trust_browser_cas {
        let native = rustls_native_certs::load_native_certs();
        if !native.errors.is_empty() {
            warn!(
                errors = native.errors.len(),
                "some system trust store certificates could not be loaded"
            );
        }
        let (_added, ignored) = roots.add_parsable_certificates(native.certs);
        if ignored > 0 {
            warn!(ignored, "ignored unparsable system trust store certificates");
        }
    }
    for pem in &options.trusted_certificates {
        for cert in parse_certificates(pem, "trustedCertificates")? {
            roots
                .add(cert)
                .context("invalid certificate in trustedCertificates")?;
        }
    }

    let client = {
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .context("unsupported protocol version selection")?
            .with_root_certificates(roots.clone());
        let config = match &keypair {
            Some((chain, key)) => builder
                .with_client_auth_cert(chain.clone(), key.clone_key())
                .context("keypair is unusable for client authentication")?,
            None => builder.with_no_client_auth(),
        };
        TlsConnector::from(Arc::new(config))
    };

    let server = keypair
        .map(|(chain, key)| -> Result<TlsAcceptor> {
            let builder = ServerConfig::builder_with_provider(provider.clone())
                .with_protocol_versions(versions)
                .context("unsupported protocol version selection")?;
            let config = if options.require_client_certs {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                        .build()
                        .context("requireClientCerts needs at least one trusted certificate")?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(chain, key)
                    .context("keypair is unusable for serving")?
            } else {
                builder
                    .with_no_client_auth()
                    .with_single_cert(chain, key)
                    .context("keypair is unusable for serving")?
            };
            Ok(TlsAcceptor::from(Arc::new(config)))
        })
        .transpose()?;

    Ok(TlsContext { server, client })
}

/// Map the configured minimum version onto what rustls can provide.
///
/// rustls implements TLS 1.2 and 1.3 only; asking for an older floor just
/// means "no restriction", which is logged rather than refused because the
/// request is satisfiable (every connection will be at least that new).
fn protocol_versions(min_version: &str) -> Result<&'static [&'static SupportedProtocolVersion]> {
    static TLS12_AND_UP: &[&SupportedProtocolVersion] =
        &[&rustls::version::TLS12, &rustls::version::TLS13];
    static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match min_version {
        "goodDefault" => Ok(rustls::ALL_VERSIONS),
        "ssl3" | "tls1.0" | "tls1.1" => {
            warn!(
                min_version,
                "minimum TLS version predates TLS 1.2; connections will use TLS 1.2 or newer"
            );
            Ok(rustls::ALL_VERSIONS)
        },
        "tls1.2" => Ok(TLS12_AND_UP),
        "tls1.3" => Ok(TLS13_ONLY),
        other => bail!(
            "Encountered unknown TlsOptions minVersion setting \"{other}\". \
             Was the config compiled with a newer version of the schema?"
        ),
    }
}

/// The crypto provider, with its cipher suite list restricted when a
/// cipherList is configured. Suite names match rustls' identifiers, e.g.
/// `TLS13_AES_128_GCM_SHA256`.
fn crypto_provider(cipher_list: Option<&str>) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(list) = cipher_list {
        let wanted: Vec<&str> = list.split(':').filter(|s| !s.is_empty()).collect();
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            wanted.iter().any(|w| w.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            bail!("cipherList \"{list}\" matches no supported cipher suites");
        }
    }
    Ok(Arc::new(provider))
}

fn parse_certificates(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("invalid PEM in {what}"))?;
    if certs.is_empty() {
        bail!("no certificates found in {what}");
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .context("invalid PEM in privateKey")?
        .context("no private key found in privateKey")
}
