//! Security handshake tests against the in-process mock broker.
//!
//! Every test builds its material through `SecurityContext`, the same path the
//! command dispatcher takes, and connects with a short budget.

use std::io::Write;
use std::time::Duration;

use kafka_publisher_core::config::{BrokerConfig, SaslMechanism, SecurityProtocol};
use kafka_publisher_core::testing::certs::TEST_CERT;
use kafka_publisher_core::testing::{api_keys, MockBroker};
use kafka_publisher_core::{ConnectError, Connection, ConnectionManager, SecurityContext};
use tempfile::NamedTempFile;

const BUDGET: Duration = Duration::from_secs(3);

fn config_for(broker: &MockBroker, protocol: SecurityProtocol) -> BrokerConfig {
    BrokerConfig {
        broker: broker.address().to_string(),
        security_protocol: protocol,
        ..BrokerConfig::default()
    }
}

fn with_credentials(
    mut config: BrokerConfig,
    mechanism: SaslMechanism,
    username: &str,
    password: &str,
) -> BrokerConfig {
    config.sasl_mechanism = mechanism;
    config.sasl_username = username.to_string();
    config.sasl_password = password.to_string();
    config
}

async fn connect(config: &BrokerConfig) -> Result<Connection, ConnectError> {
    let security = SecurityContext::build(config)?;
    ConnectionManager::new("security-test")
        .connect(&config.bootstrap_servers(), None, security, BUDGET)
        .await
}

#[tokio::test]
async fn test_sasl_plain_authenticates() {
    let broker = MockBroker::builder()
        .sasl_plain("alice", "secret")
        .start()
        .await
        .unwrap();
    let config = with_credentials(
        config_for(&broker, SecurityProtocol::SaslPlaintext),
        SaslMechanism::Plain,
        "alice",
        "secret",
    );

    let connection = connect(&config).await.unwrap();
    assert_eq!(connection.metadata().brokers.len(), 1);
    connection.close().await;

    assert_eq!(broker.calls_for_api(api_keys::SASL_HANDSHAKE).len(), 1);
    assert_eq!(broker.calls_for_api(api_keys::SASL_AUTHENTICATE).len(), 1);
}

#[tokio::test]
async fn test_sasl_plain_wrong_password() {
    let broker = MockBroker::builder()
        .sasl_plain("alice", "secret")
        .start()
        .await
        .unwrap();
    let config = with_credentials(
        config_for(&broker, SecurityProtocol::SaslPlaintext),
        SaslMechanism::Plain,
        "alice",
        "wrong",
    );

    let result = connect(&config).await;
    assert!(matches!(result, Err(ConnectError::AuthFailed { .. })));
    assert!(broker.calls_for_api(api_keys::METADATA).is_empty());
}

#[tokio::test]
async fn test_scram_sha256_authenticates() {
    let broker = MockBroker::builder()
        .sasl_scram_sha256("bob", "hunter2")
        .start()
        .await
        .unwrap();
    let config = with_credentials(
        config_for(&broker, SecurityProtocol::SaslPlaintext),
        SaslMechanism::ScramSha256,
        "bob",
        "hunter2",
    );

    let connection = connect(&config).await.unwrap();
    connection.close().await;

    // client-first and client-final
    assert_eq!(broker.calls_for_api(api_keys::SASL_AUTHENTICATE).len(), 2);
}

#[tokio::test]
async fn test_scram_sha512_authenticates() {
    let broker = MockBroker::builder()
        .sasl_scram_sha512("bob", "hunter2")
        .start()
        .await
        .unwrap();
    let config = with_credentials(
        config_for(&broker, SecurityProtocol::SaslPlaintext),
        SaslMechanism::ScramSha512,
        "bob",
        "hunter2",
    );

    let connection = connect(&config).await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_scram_wrong_password() {
    let broker = MockBroker::builder()
        .sasl_scram_sha256("bob", "hunter2")
        .start()
        .await
        .unwrap();
    let config = with_credentials(
        config_for(&broker, SecurityProtocol::SaslPlaintext),
        SaslMechanism::ScramSha256,
        "bob",
        "hunter3",
    );

    let result = connect(&config).await;
    assert!(matches!(result, Err(ConnectError::AuthFailed { .. })));
}

#[tokio::test]
async fn test_mechanism_mismatch_is_auth_failure() {
    let broker = MockBroker::builder()
        .sasl_scram_sha512("bob", "hunter2")
        .start()
        .await
        .unwrap();
    let config = with_credentials(
        config_for(&broker, SecurityProtocol::SaslPlaintext),
        SaslMechanism::Plain,
        "bob",
        "hunter2",
    );

    let err = connect(&config).await.err().expect("plain must be refused");
    match err {
        ConnectError::AuthFailed { message, .. } => {
            assert!(message.contains("SCRAM-SHA-512"), "{message}");
        }
        other => panic!("expected AuthFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_plaintext_against_sasl_broker_fails() {
    let broker = MockBroker::builder()
        .sasl_plain("alice", "secret")
        .start()
        .await
        .unwrap();
    let config = config_for(&broker, SecurityProtocol::Plaintext);

    assert!(connect(&config).await.is_err());
}

#[tokio::test]
async fn test_ssl_with_skipped_verification() {
    let broker = MockBroker::builder().tls().start().await.unwrap();
    let mut config = config_for(&broker, SecurityProtocol::Ssl);
    config.ssl_skip_verification = true;

    let connection = connect(&config).await.unwrap();
    assert_eq!(connection.metadata().brokers.len(), 1);
    connection.close().await;
}

#[tokio::test]
async fn test_sasl_ssl_with_scram() {
    let broker = MockBroker::builder()
        .tls()
        .sasl_scram_sha512("carol", "pa55")
        .start()
        .await
        .unwrap();
    let mut config = with_credentials(
        config_for(&broker, SecurityProtocol::SaslSsl),
        SaslMechanism::ScramSha512,
        "carol",
        "pa55",
    );
    config.ssl_skip_verification = true;

    let connection = connect(&config).await.unwrap();
    connection.close().await;
}

#[tokio::test]
async fn test_ssl_rejects_certificate_not_issued_for_host() {
    let broker = MockBroker::builder().tls().start().await.unwrap();

    // The test certificate is self-signed for CN=test, not for 127.0.0.1.
    let mut ca = NamedTempFile::new().unwrap();
    ca.write_all(TEST_CERT.as_bytes()).unwrap();
    let mut config = config_for(&broker, SecurityProtocol::Ssl);
    config.ssl_ca_cert_path = ca.path().display().to_string();

    let result = connect(&config).await;
    assert!(matches!(result, Err(ConnectError::TlsError { .. })));
}

#[tokio::test]
async fn test_ssl_against_plaintext_broker_fails() {
    let broker = MockBroker::builder().start().await.unwrap();
    let mut config = config_for(&broker, SecurityProtocol::Ssl);
    config.ssl_skip_verification = true;

    let result = connect(&config).await;
    assert!(matches!(
        result,
        Err(ConnectError::TlsError { .. } | ConnectError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_missing_ca_file_is_certificate_error() {
    let config = BrokerConfig {
        security_protocol: SecurityProtocol::Ssl,
        ssl_ca_cert_path: "/nonexistent/ca.pem".to_string(),
        ..BrokerConfig::default()
    };

    let result = connect(&config).await;
    assert!(matches!(result, Err(ConnectError::Certificate(_))));
}
