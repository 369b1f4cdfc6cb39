//! Listener TLS: PEM loading, `rustls` server config, client identity
//!
//! All certificate and key files are expected in PEM format.

use std::{fs, io, sync::Arc};

use axum::{Extension, middleware::AddExtension};
use axum_server::{
    accept::{Accept, DefaultAcceptor},
    tls_rustls::{RustlsAcceptor, RustlsConfig},
};
use futures::future::BoxFuture;
use rustls::{
    RootCertStore, ServerConfig, ServerConnection, SupportedProtocolVersion,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    version::{TLS12, TLS13},
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::{debug, warn};
use x509_parser::{certificate::X509Certificate, prelude::FromDer};

use crate::{Error, Result, config::TlsConfig};

static TLS12_AND_UP: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];

/// Minimum TLS protocol version accepted by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMinVersion {
    /// TLS 1.2 and 1.3
    #[default]
    Tls12,
    /// TLS 1.3 only
    Tls13,
}

impl TlsMinVersion {
    /// Parse a configured version. Anything other than `1.2` or `1.3`
    /// falls back to 1.2 with a warning.
    #[must_use]
    pub fn parse_or_default(value: &str) -> Self {
        match value {
            "1.2" => Self::Tls12,
            "1.3" => Self::Tls13,
            other => {
                warn!(value = %other, "Unknown TLS min version, using TLS 1.2");
                Self::Tls12
            }
        }
    }

    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => TLS12_AND_UP,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

impl std::fmt::Display for TlsMinVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tls12 => f.write_str("1.2"),
            Self::Tls13 => f.write_str("1.3"),
        }
    }
}

/// Whether the handshake demands a verified client certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// No client certificate is requested
    None,
    /// A client certificate chaining to the configured CA is required
    Required,
}

/// Build the listener's `rustls::ServerConfig`.
///
/// The CA bundle is loaded whenever it is configured, but only enforced
/// when `client_auth` is [`ClientAuth::Required`]. ALPN advertises
/// HTTP/1.1 only.
///
/// # Errors
///
/// Returns `Error::Tls` if any file cannot be read or parsed, if client
/// verification is required without a CA, or if the certificate and key
/// do not match.
pub fn build_server_config(
    config: &TlsConfig,
    min_version: TlsMinVersion,
    client_auth: ClientAuth,
) -> Result<ServerConfig> {
    let certs = load_certs(&config.cert)?;
    let key = load_private_key(&config.key)?;

    let roots = if config.ca_cert.is_empty() {
        None
    } else {
        let mut store = RootCertStore::empty();
        for cert in load_certs(&config.ca_cert)? {
            store
                .add(cert)
                .map_err(|e| Error::Tls(format!("Failed to add CA cert to trust store: {e}")))?;
        }
        Some(store)
    };

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(min_version.protocol_versions())
        .map_err(|e| Error::Tls(format!("Unsupported TLS protocol versions: {e}")))?;

    let builder = match (client_auth, roots) {
        (ClientAuth::Required, Some(roots)) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?;
            builder.with_client_cert_verifier(verifier)
        }
        (ClientAuth::Required, None) => {
            return Err(Error::Tls(
                "client certificate verification requires tls.ca_cert".to_string(),
            ));
        }
        (ClientAuth::None, _) => builder.with_no_client_auth(),
    };

    let mut tls = builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?;
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];

    debug!(
        cert = %config.cert,
        ca_cert = %config.ca_cert,
        min_version = %min_version,
        client_auth = ?client_auth,
        "TLS config built"
    );

    Ok(tls)
}

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Tls(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Tls(format!("No private key found in '{path}'")))
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Tls(format!("Failed to read '{path}': {e}")))
}

/// Identity presented by the peer during the TLS handshake.
///
/// Attached to every request on the connection. `common_name` is `None`
/// when no client certificate was presented or its subject has no CN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Subject Common Name of the leaf client certificate
    pub common_name: Option<String>,
}

impl ClientIdentity {
    /// Read the peer's leaf certificate from an established connection
    #[must_use]
    pub fn from_connection(conn: &ServerConnection) -> Self {
        let common_name = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|leaf| common_name(leaf));
        Self { common_name }
    }
}

/// Extract the subject CN from a DER-encoded certificate
#[must_use]
pub fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// TLS acceptor that records the peer's [`ClientIdentity`] as a request
/// extension on every request served over the connection.
#[derive(Clone)]
pub struct PeerIdentityAcceptor {
    inner: RustlsAcceptor<DefaultAcceptor>,
}

impl PeerIdentityAcceptor {
    /// Wrap a `rustls` server config
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(config)),
        }
    }
}

impl<I, S> Accept<I, S> for PeerIdentityAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, ClientIdentity>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let identity = ClientIdentity::from_connection(stream.get_ref().1);
            Ok((stream, Extension(identity).layer(service)))
        })
    }
}
