//! TLS client connector for broker connections.

use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tracing::{debug, warn};

use crate::error::CertificateError;

/// Install the ring crypto provider if not already installed.
pub(crate) fn ensure_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}

/// Where the connector gets its trust anchors and client identity from.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions<'a> {
    /// PEM CA bundle. Mozilla's roots are used when unset.
    pub ca_cert_path: Option<&'a Path>,
    /// PEM client certificate and key for mutual TLS.
    pub client_identity: Option<(&'a Path, &'a Path)>,
    /// Accept any server certificate (INSECURE).
    pub skip_verification: bool,
}

/// TLS connector for outbound connections to Kafka brokers.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TokioTlsConnector,
    verifies_peer: bool,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("verifies_peer", &self.verifies_peer)
            .finish_non_exhaustive()
    }
}

impl TlsConnector {
    /// Load certificates and keys and build a connector.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError::Unreadable`] if a file cannot be read and
    /// [`CertificateError::Malformed`] if it holds no usable PEM item.
    pub fn new(options: &TlsOptions<'_>) -> Result<Self, CertificateError> {
        ensure_crypto_provider();

        let builder = if options.skip_verification {
            warn!("TLS certificate verification is disabled");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier::new()))
        } else {
            ClientConfig::builder().with_root_certificates(build_root_store(options.ca_cert_path)?)
        };

        let client_config = if let Some((cert_path, key_path)) = options.client_identity {
            debug!("loading client certificate for mTLS");
            let certs = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| CertificateError::Malformed {
                    path: key_path.display().to_string(),
                    message: format!("key does not match certificate: {e}"),
                })?
        } else {
            builder.with_no_client_auth()
        };

        Ok(Self {
            inner: TokioTlsConnector::from(Arc::new(client_config)),
            verifies_peer: !options.skip_verification,
        })
    }

    #[must_use]
    pub fn verifies_peer(&self) -> bool {
        self.verifies_peer
    }

    /// Run the TLS handshake over `stream`.
    ///
    /// # Errors
    ///
    /// Returns a message describing why the host name or handshake was rejected.
    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, String> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| format!("invalid server name '{host}': {e}"))?;

        debug!(host, "initiating TLS handshake");

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Build the root certificate store.
fn build_root_store(ca_path: Option<&Path>) -> Result<RootCertStore, CertificateError> {
    let mut root_store = RootCertStore::empty();

    if let Some(ca_path) = ca_path {
        debug!(path = %ca_path.display(), "loading custom CA certificate");
        let certs = load_certificates(ca_path)?;
        let (added, _ignored) = root_store.add_parsable_certificates(certs);
        debug!(added, "added CA certificates to trust store");

        if added == 0 {
            return Err(CertificateError::Malformed {
                path: ca_path.display().to_string(),
                message: "no usable CA certificate".to_string(),
            });
        }
    } else {
        debug!("using webpki root certificates");
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Ok(root_store)
}

/// Load certificates from a PEM file.
pub(crate) fn load_certificates(
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let file = std::fs::File::open(path).map_err(|e| CertificateError::Unreadable {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(CertificateError::Malformed {
            path: path.display().to_string(),
            message: "no PEM certificates found".to_string(),
        });
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load a private key from a PEM file.
pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let file = std::fs::File::open(path).map_err(|e| CertificateError::Unreadable {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(CertificateError::Malformed {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    Err(CertificateError::Malformed {
        path: path.display().to_string(),
        message: "no PEM private key found".to_string(),
    })
}

/// Accepts every server certificate.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
    fn new() -> Self {
        Self {
            schemes: default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}
