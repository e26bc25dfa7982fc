//! Broker configuration for the publisher.
//!
//! A single [`BrokerConfig`] document describes where to connect and how to
//! secure the connection. It is persisted as JSON by [`ConfigStore`] and read
//! fresh by every command.

mod store;

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

pub use store::ConfigStore;

/// Connection settings for one Kafka cluster.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Bootstrap address, `host:port`. A comma-separated list is tried in order.
    pub broker: String,

    /// Default topic for send and consume.
    pub topic: String,

    /// Client id sent with every request.
    pub client_id: String,

    pub security_protocol: SecurityProtocol,

    pub sasl_mechanism: SaslMechanism,

    /// Supports environment variable expansion: "${KAFKA_USERNAME}"
    pub sasl_username: String,

    /// Supports environment variable expansion: "${KAFKA_PASSWORD}"
    pub sasl_password: String,

    /// PEM file with the CA certificates that sign the broker certificate.
    pub ssl_ca_cert_path: String,

    /// PEM client certificate for mutual TLS.
    pub ssl_client_cert_path: String,

    /// PEM private key matching `ssl_client_cert_path`.
    pub ssl_client_key_path: String,

    /// Accept any broker certificate (INSECURE - for self-signed test brokers only).
    pub ssl_skip_verification: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            topic: default_topic(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            sasl_mechanism: SaslMechanism::default(),
            sasl_username: String::new(),
            sasl_password: String::new(),
            ssl_ca_cert_path: String::new(),
            ssl_client_cert_path: String::new(),
            ssl_client_key_path: String::new(),
            ssl_skip_verification: false,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("broker", &self.broker)
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("security_protocol", &self.security_protocol)
            .field("sasl_mechanism", &self.sasl_mechanism)
            .field("sasl_username", &self.sasl_username)
            .field("sasl_password", &"<redacted>")
            .field("ssl_ca_cert_path", &self.ssl_ca_cert_path)
            .field("ssl_client_cert_path", &self.ssl_client_cert_path)
            .field("ssl_client_key_path", &self.ssl_client_key_path)
            .field("ssl_skip_verification", &self.ssl_skip_verification)
            .finish()
    }
}

fn default_broker() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "test-topic".to_string()
}

fn default_client_id() -> String {
    "kafka-msg-publisher".to_string()
}

/// Security protocol for Kafka connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityProtocol {
    /// Plain TCP without encryption or authentication.
    #[default]
    Plaintext,
    /// TLS encryption without SASL authentication.
    Ssl,
    /// SASL authentication without TLS encryption.
    SaslPlaintext,
    /// TLS encryption with SASL authentication.
    SaslSsl,
}

impl SecurityProtocol {
    /// Check if TLS is required for this protocol.
    #[must_use]
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Ssl | Self::SaslSsl)
    }

    /// Check if SASL is required for this protocol.
    #[must_use]
    pub fn requires_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum SaslMechanism {
    /// SASL/PLAIN - simple username/password authentication.
    #[default]
    #[serde(rename = "PLAIN")]
    Plain,
    /// SASL/SCRAM-SHA-256 - salted challenge-response authentication.
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    /// SASL/SCRAM-SHA-512 - salted challenge-response authentication.
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    /// Get the Kafka mechanism name as used in the SASL handshake.
    #[must_use]
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

impl BrokerConfig {
    /// Bootstrap addresses in the order they should be tried.
    #[must_use]
    pub fn bootstrap_servers(&self) -> Vec<String> {
        self.broker
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Get the SASL username with environment variables expanded.
    #[must_use]
    pub fn username(&self) -> String {
        expand_env_vars(&self.sasl_username)
    }

    /// Get the SASL password with environment variables expanded.
    #[must_use]
    pub fn password(&self) -> String {
        expand_env_vars(&self.sasl_password)
    }

    /// Validate the configuration.
    ///
    /// Checks run in field order and the first failure is reported. Certificate
    /// paths are checked for readability, so this touches the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        let servers = self.bootstrap_servers();
        if servers.is_empty() {
            return Err(ConfigError::invalid("broker", "must not be empty"));
        }
        for server in &servers {
            parse_host_port(server).map_err(|reason| ConfigError::invalid("broker", reason))?;
        }

        if self.topic.trim().is_empty() {
            return Err(ConfigError::invalid("topic", "must not be empty"));
        }

        // Credentials are checked as they will be sent, so `${VAR}` must be set.
        if self.security_protocol.requires_sasl() {
            if self.username().is_empty() {
                return Err(ConfigError::invalid(
                    "sasl_username",
                    "required when a SASL protocol is selected",
                ));
            }
            if self.password().is_empty() {
                return Err(ConfigError::invalid(
                    "sasl_password",
                    "required when a SASL protocol is selected",
                ));
            }
        }

        if self.security_protocol.requires_tls() {
            if !self.ssl_skip_verification {
                if self.ssl_ca_cert_path.is_empty() {
                    return Err(ConfigError::invalid(
                        "ssl_ca_cert_path",
                        "required for TLS unless certificate verification is skipped",
                    ));
                }
                check_readable("ssl_ca_cert_path", &self.ssl_ca_cert_path)?;
            }

            match (
                self.ssl_client_cert_path.is_empty(),
                self.ssl_client_key_path.is_empty(),
            ) {
                (true, true) => {}
                (false, true) => {
                    return Err(ConfigError::invalid(
                        "ssl_client_key_path",
                        "required when a client certificate is set",
                    ));
                }
                (true, false) => {
                    return Err(ConfigError::invalid(
                        "ssl_client_cert_path",
                        "required when a client key is set",
                    ));
                }
                (false, false) => {
                    check_readable("ssl_client_cert_path", &self.ssl_client_cert_path)?;
                    check_readable("ssl_client_key_path", &self.ssl_client_key_path)?;
                }
            }
        }

        Ok(())
    }
}

/// Split `host:port`, requiring a non-empty host and a numeric port.
pub(crate) fn parse_host_port(address: &str) -> Result<(&str, u16), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("'{address}' is not host:port"))?;
    if host.is_empty() {
        return Err(format!("'{address}' has no host"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("'{address}' has an invalid port"))?;
    Ok((host, port))
}

fn check_readable(field: &'static str, path: &str) -> ConfigResult<()> {
    let path = Path::new(path);
    std::fs::File::open(path)
        .map(drop)
        .map_err(|e| ConfigError::invalid(field, format!("cannot read {}: {e}", path.display())))
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sasl_ssl_config() -> BrokerConfig {
        BrokerConfig {
            security_protocol: SecurityProtocol::SaslSsl,
            sasl_username: "alice".to_string(),
            sasl_password: "secret".to_string(),
            ssl_skip_verification: true,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.broker, "localhost:9092");
        assert_eq!(config.topic, "test-topic");
        assert_eq!(config.client_id, "kafka-msg-publisher");
        assert_eq!(config.security_protocol, SecurityProtocol::Plaintext);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_old_config_file_loads_with_defaults() {
        let json = r#"{"broker":"kafka:9092","topic":"orders","client_id":"ui"}"#;
        let config: BrokerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.broker, "kafka:9092");
        assert_eq!(config.security_protocol, SecurityProtocol::Plaintext);
        assert_eq!(config.sasl_mechanism, SaslMechanism::Plain);
        assert!(!config.ssl_skip_verification);
    }

    #[test]
    fn test_serialized_enum_names() {
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::SaslPlaintext,
            sasl_mechanism: SaslMechanism::ScramSha512,
            ..BrokerConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["security_protocol"], "SASL_PLAINTEXT");
        assert_eq!(json["sasl_mechanism"], "SCRAM-SHA-512");
    }

    #[test]
    fn test_bootstrap_list() {
        let config = BrokerConfig {
            broker: "a:9092, b:9093,,".to_string(),
            ..BrokerConfig::default()
        };
        assert_eq!(config.bootstrap_servers(), vec!["a:9092", "b:9093"]);
    }

    #[test]
    fn test_invalid_broker_address() {
        for broker in ["", "localhost", ":9092", "host:port"] {
            let config = BrokerConfig {
                broker: broker.to_string(),
                ..BrokerConfig::default()
            };
            let err = config.validate().unwrap_err();
            assert_eq!(err.field(), Some("broker"), "broker = {broker:?}");
        }
    }

    #[test]
    fn test_empty_topic_rejected() {
        let config = BrokerConfig {
            topic: "  ".to_string(),
            ..BrokerConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field(), Some("topic"));
    }

    #[test]
    fn test_sasl_requires_credentials() {
        let config = BrokerConfig {
            sasl_username: String::new(),
            ..sasl_ssl_config()
        };
        assert_eq!(config.validate().unwrap_err().field(), Some("sasl_username"));

        let config = BrokerConfig {
            sasl_password: String::new(),
            ..sasl_ssl_config()
        };
        assert_eq!(config.validate().unwrap_err().field(), Some("sasl_password"));
    }

    #[test]
    fn test_tls_requires_ca_unless_skipped() {
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::Ssl,
            ..BrokerConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err().field(),
            Some("ssl_ca_cert_path")
        );

        let config = BrokerConfig {
            ssl_ca_cert_path: "/nonexistent/ca.pem".to_string(),
            ..config
        };
        assert_eq!(
            config.validate().unwrap_err().field(),
            Some("ssl_ca_cert_path")
        );

        let mut ca = NamedTempFile::new().unwrap();
        ca.write_all(b"-----BEGIN CERTIFICATE-----").unwrap();
        let config = BrokerConfig {
            ssl_ca_cert_path: ca.path().display().to_string(),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_cert_and_key_must_pair() {
        let cert = NamedTempFile::new().unwrap();
        let config = BrokerConfig {
            ssl_client_cert_path: cert.path().display().to_string(),
            ..sasl_ssl_config()
        };
        assert_eq!(
            config.validate().unwrap_err().field(),
            Some("ssl_client_key_path")
        );

        let config = BrokerConfig {
            ssl_client_key_path: cert.path().display().to_string(),
            ..sasl_ssl_config()
        };
        assert_eq!(
            config.validate().unwrap_err().field(),
            Some("ssl_client_cert_path")
        );
    }

    #[test]
    fn test_plaintext_ignores_tls_fields() {
        let config = BrokerConfig {
            ssl_ca_cert_path: "/nonexistent/ca.pem".to_string(),
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("KAFKA_PUBLISHER_TEST_USER", "bob");
        let config = BrokerConfig {
            sasl_username: "${KAFKA_PUBLISHER_TEST_USER}".to_string(),
            sasl_password: "${KAFKA_PUBLISHER_TEST_UNSET_VAR}".to_string(),
            ..BrokerConfig::default()
        };
        assert_eq!(config.username(), "bob");
        assert_eq!(config.password(), "");
    }

    #[test]
    fn test_sasl_credentials_validated_after_expansion() {
        let config = BrokerConfig {
            sasl_username: "${KAFKA_PUBLISHER_TEST_NEVER_SET}".to_string(),
            ..sasl_ssl_config()
        };
        assert_eq!(config.validate().unwrap_err().field(), Some("sasl_username"));

        std::env::set_var("KAFKA_PUBLISHER_TEST_PASSWORD", "from-env");
        let config = BrokerConfig {
            sasl_password: "${KAFKA_PUBLISHER_TEST_PASSWORD}".to_string(),
            ..sasl_ssl_config()
        };
        config.validate().unwrap();
        assert_eq!(config.password(), "from-env");
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", sasl_ssl_config());
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_mechanism_names() {
        assert_eq!(SaslMechanism::Plain.mechanism_name(), "PLAIN");
        assert_eq!(SaslMechanism::ScramSha256.mechanism_name(), "SCRAM-SHA-256");
        assert_eq!(SaslMechanism::ScramSha512.mechanism_name(), "SCRAM-SHA-512");
    }

    #[test]
    fn test_security_protocol_requirements() {
        assert!(!SecurityProtocol::Plaintext.requires_tls());
        assert!(!SecurityProtocol::Plaintext.requires_sasl());
        assert!(SecurityProtocol::Ssl.requires_tls());
        assert!(SecurityProtocol::SaslPlaintext.requires_sasl());
        assert!(SecurityProtocol::SaslSsl.requires_tls());
        assert!(SecurityProtocol::SaslSsl.requires_sasl());
    }
}
