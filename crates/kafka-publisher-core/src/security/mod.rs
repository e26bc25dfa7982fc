//! Handshake material derived from a [`BrokerConfig`].
//!
//! Material is rebuilt for every command and dropped with the connection that
//! used it; nothing here is cached or persisted.

pub mod scram;
pub mod tls;

use std::fmt;
use std::path::Path;

use tracing::debug;

use crate::config::{BrokerConfig, SaslMechanism};
use crate::error::CertificateError;

pub use scram::{ScramClient, ScramHash, ScramSha256, ScramSha512};
pub use tls::{TlsConnector, TlsOptions};

/// Everything a connection attempt needs to secure its transport.
#[derive(Debug, Clone, Default)]
pub struct SecurityMaterial {
    /// Present for `SSL` and `SASL_SSL`.
    pub tls: Option<TlsConnector>,
    /// Present for `SASL_PLAINTEXT` and `SASL_SSL`.
    pub sasl: Option<SaslMaterial>,
}

impl SecurityMaterial {
    /// Material for a plaintext connection.
    #[must_use]
    pub fn plaintext() -> Self {
        Self::default()
    }
}

/// Prepared credentials for one SASL mechanism.
#[derive(Clone)]
pub enum SaslMaterial {
    /// `\0username\0password`, sent as-is.
    Plain { username: String, auth_bytes: Vec<u8> },
    ScramSha256(ScramClient<ScramSha256>),
    ScramSha512(ScramClient<ScramSha512>),
}

impl SaslMaterial {
    /// Mechanism name for the SaslHandshake request.
    #[must_use]
    pub fn mechanism(&self) -> &'static str {
        match self {
            Self::Plain { .. } => SaslMechanism::Plain.mechanism_name(),
            Self::ScramSha256(client) => client.mechanism(),
            Self::ScramSha512(client) => client.mechanism(),
        }
    }

    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Plain { username, .. } => username,
            Self::ScramSha256(client) => client.username(),
            Self::ScramSha512(client) => client.username(),
        }
    }
}

impl fmt::Debug for SaslMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslMaterial")
            .field("mechanism", &self.mechanism())
            .field("username", &self.username())
            .finish_non_exhaustive()
    }
}

/// Builds [`SecurityMaterial`] from configuration.
pub struct SecurityContext;

impl SecurityContext {
    /// Load TLS files and prepare SASL credentials for `config`.
    ///
    /// For TLS protocols the CA bundle is loaded (Mozilla roots if none is set)
    /// and, when both client paths are set, the mutual-TLS identity. With
    /// `ssl_skip_verification` no CA is loaded at all.
    ///
    /// # Errors
    ///
    /// Returns [`CertificateError`] if a configured file cannot be read or parsed.
    pub fn build(config: &BrokerConfig) -> Result<SecurityMaterial, CertificateError> {
        let tls = if config.security_protocol.requires_tls() {
            let options = TlsOptions {
                ca_cert_path: non_empty_path(&config.ssl_ca_cert_path)
                    .filter(|_| !config.ssl_skip_verification),
                client_identity: non_empty_path(&config.ssl_client_cert_path)
                    .zip(non_empty_path(&config.ssl_client_key_path)),
                skip_verification: config.ssl_skip_verification,
            };
            Some(TlsConnector::new(&options)?)
        } else {
            None
        };

        let sasl = if config.security_protocol.requires_sasl() {
            let username = config.username();
            let password = config.password();
            debug!(mechanism = config.sasl_mechanism.mechanism_name(), %username, "preparing SASL credentials");
            Some(match config.sasl_mechanism {
                SaslMechanism::Plain => SaslMaterial::Plain {
                    auth_bytes: plain_auth_bytes(&username, &password),
                    username,
                },
                SaslMechanism::ScramSha256 => {
                    SaslMaterial::ScramSha256(ScramClient::new(&username, &password))
                }
                SaslMechanism::ScramSha512 => {
                    SaslMaterial::ScramSha512(ScramClient::new(&username, &password))
                }
            })
        } else {
            None
        };

        Ok(SecurityMaterial { tls, sasl })
    }
}

fn non_empty_path(path: &str) -> Option<&Path> {
    (!path.is_empty()).then(|| Path::new(path))
}

/// SASL/PLAIN message: `[authzid] \0 authcid \0 passwd` with an empty authzid.
fn plain_auth_bytes(username: &str, password: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(username.len() + password.len() + 2);
    bytes.push(0);
    bytes.extend_from_slice(username.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(password.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProtocol;
    use crate::testing::certs::TEST_CERT;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_plaintext_has_no_material() {
        let material = SecurityContext::build(&BrokerConfig::default()).unwrap();
        assert!(material.tls.is_none());
        assert!(material.sasl.is_none());
    }

    #[test]
    fn test_plain_auth_bytes() {
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::SaslPlaintext,
            sasl_username: "alice".to_string(),
            sasl_password: "secret".to_string(),
            ..BrokerConfig::default()
        };
        let material = SecurityContext::build(&config).unwrap();
        assert!(material.tls.is_none());
        match material.sasl {
            Some(SaslMaterial::Plain { auth_bytes, .. }) => {
                assert_eq!(auth_bytes, b"\0alice\0secret");
            }
            other => panic!("unexpected material: {other:?}"),
        }
    }

    #[test]
    fn test_scram_material_prepares_client_first() {
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::SaslPlaintext,
            sasl_mechanism: SaslMechanism::ScramSha512,
            sasl_username: "bob".to_string(),
            sasl_password: "pw".to_string(),
            ..BrokerConfig::default()
        };
        let material = SecurityContext::build(&config).unwrap();
        let sasl = material.sasl.unwrap();
        assert_eq!(sasl.mechanism(), "SCRAM-SHA-512");
        match sasl {
            SaslMaterial::ScramSha512(client) => {
                assert!(client.client_first().starts_with("n,,n=bob,r="));
            }
            other => panic!("unexpected material: {other:?}"),
        }
    }

    #[test]
    fn test_debug_hides_secrets() {
        let material = SaslMaterial::Plain {
            username: "alice".to_string(),
            auth_bytes: plain_auth_bytes("alice", "hunter2"),
        };
        let rendered = format!("{material:?}");
        assert!(rendered.contains("PLAIN"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_tls_with_custom_ca() {
        let mut ca = NamedTempFile::new().unwrap();
        ca.write_all(TEST_CERT.as_bytes()).unwrap();
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::Ssl,
            ssl_ca_cert_path: ca.path().display().to_string(),
            ..BrokerConfig::default()
        };
        let material = SecurityContext::build(&config).unwrap();
        assert!(material.tls.unwrap().verifies_peer());
    }

    #[test]
    fn test_tls_missing_ca_is_unreadable() {
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::SaslSsl,
            sasl_username: "u".to_string(),
            sasl_password: "p".to_string(),
            ssl_ca_cert_path: "/nonexistent/ca.pem".to_string(),
            ..BrokerConfig::default()
        };
        assert!(matches!(
            SecurityContext::build(&config),
            Err(CertificateError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_skip_verification_ignores_ca_path() {
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::Ssl,
            ssl_ca_cert_path: "/nonexistent/ca.pem".to_string(),
            ssl_skip_verification: true,
            ..BrokerConfig::default()
        };
        let material = SecurityContext::build(&config).unwrap();
        assert!(!material.tls.unwrap().verifies_peer());
    }
}
