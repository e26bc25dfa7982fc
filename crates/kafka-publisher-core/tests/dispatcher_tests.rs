//! End-to-end command tests: every call goes through `CommandDispatcher`
//! with a config file on disk and a mock broker on localhost.

use std::time::{Duration, Instant};

use kafka_publisher_core::config::{BrokerConfig, ConfigStore, SaslMechanism, SecurityProtocol};
use kafka_publisher_core::testing::{api_keys, MockBroker};
use kafka_publisher_core::{CommandDispatcher, CommandResult, ConnectionTestState};
use tempfile::TempDir;

struct Fixture {
    dispatcher: CommandDispatcher,
    _dir: TempDir,
}

async fn fixture(config: BrokerConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let dispatcher = CommandDispatcher::new(ConfigStore::open(dir.path().join("config.json")));
    assert_eq!(dispatcher.save_config(config).await, CommandResult::Ok(()));
    Fixture {
        dispatcher,
        _dir: dir,
    }
}

fn plaintext(broker: &MockBroker, topic: &str) -> BrokerConfig {
    BrokerConfig {
        broker: broker.address().to_string(),
        topic: topic.to_string(),
        ..BrokerConfig::default()
    }
}

#[tokio::test]
async fn test_fresh_store_returns_defaults() {
    let dir = TempDir::new().unwrap();
    let dispatcher = CommandDispatcher::new(ConfigStore::open(dir.path().join("config.json")));

    let config = dispatcher.get_config().await;
    assert_eq!(config.broker, "localhost:9092");
    assert_eq!(config.topic, "test-topic");
    assert!(!dir.path().join("config.json").exists());
}

#[tokio::test]
async fn test_full_workflow() {
    let broker = MockBroker::builder().start().await.unwrap();
    let f = fixture(plaintext(&broker, "events")).await;

    assert_eq!(f.dispatcher.test_connection(Some(2)).await, CommandResult::Ok(true));

    let created = f
        .dispatcher
        .create_topic("events", Some(3), None)
        .await
        .into_result()
        .unwrap();
    assert!(created.success);
    assert_eq!(broker.partition_count("events"), Some(3));

    for (i, body) in ["first", "second", "third"].iter().enumerate() {
        let sent = f.dispatcher.send_message(body).await.into_result().unwrap();
        assert!(sent.success);
        assert_eq!(sent.message, format!("Message sent to events partition 0 at offset {i}"));
    }

    let messages = f
        .dispatcher
        .consume_messages(None, Some(0), Some(10))
        .await
        .into_result()
        .unwrap();
    let values: Vec<_> = messages.iter().map(|m| m.value.as_deref()).collect();
    assert_eq!(values, vec![Some("first"), Some("second"), Some("third")]);
    assert_eq!(
        messages.iter().map(|m| m.offset).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(messages.iter().all(|m| m.key.is_none()));
}

#[tokio::test]
async fn test_unreachable_broker_fails_within_timeout() {
    let dir = TempDir::new().unwrap();
    let dispatcher = CommandDispatcher::new(ConfigStore::open(dir.path().join("config.json")));
    let config = BrokerConfig {
        broker: "10.255.255.1:9092".to_string(),
        ..BrokerConfig::default()
    };
    assert!(dispatcher.save_config(config).await.is_ok());

    let started = Instant::now();
    let result = dispatcher.test_connection(Some(1)).await;
    assert!(!result.is_ok());
    assert!(started.elapsed() < Duration::from_millis(1_500));
}

#[tokio::test]
async fn test_consume_uses_configured_topic_for_blank_name() {
    let broker = MockBroker::builder().topic("orders", 1).start().await.unwrap();
    let f = fixture(plaintext(&broker, "orders")).await;
    f.dispatcher.send_message("hello").await.into_result().unwrap();

    let messages = f
        .dispatcher
        .consume_messages(Some("  "), None, None)
        .await
        .into_result()
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].value.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_consume_past_end_is_empty() {
    let broker = MockBroker::builder().topic("orders", 1).start().await.unwrap();
    let f = fixture(plaintext(&broker, "orders")).await;
    f.dispatcher.send_message("only").await.into_result().unwrap();

    let messages = f
        .dispatcher
        .consume_messages(Some("orders"), Some(10), Some(5))
        .await
        .into_result()
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_consume_missing_topic_names_it() {
    let broker = MockBroker::builder().start().await.unwrap();
    let f = fixture(plaintext(&broker, "orders")).await;

    let err = f
        .dispatcher
        .consume_messages(Some("ghost"), None, None)
        .await
        .into_result()
        .unwrap_err();
    assert!(err.contains("ghost"), "{err}");
}

#[tokio::test]
async fn test_create_existing_topic_is_err() {
    let broker = MockBroker::builder().topic("orders", 1).start().await.unwrap();
    let f = fixture(plaintext(&broker, "orders")).await;

    let err = f
        .dispatcher
        .create_topic("orders", None, None)
        .await
        .into_result()
        .unwrap_err();
    assert!(err.contains("already exists"), "{err}");
}

#[tokio::test]
async fn test_create_with_too_many_replicas_is_err() {
    let broker = MockBroker::builder().start().await.unwrap();
    let f = fixture(plaintext(&broker, "orders")).await;

    let err = f
        .dispatcher
        .create_topic("wide", Some(3), Some(3))
        .await
        .into_result()
        .unwrap_err();
    assert!(err.contains("replication factor 3"), "{err}");
    assert!(broker.calls_for_api(api_keys::CREATE_TOPICS).is_empty());
}

#[tokio::test]
async fn test_send_over_scram() {
    let broker = MockBroker::builder()
        .topic("secure", 1)
        .sasl_scram_sha256("svc", "s3cret")
        .start()
        .await
        .unwrap();
    let config = BrokerConfig {
        security_protocol: SecurityProtocol::SaslPlaintext,
        sasl_mechanism: SaslMechanism::ScramSha256,
        sasl_username: "svc".to_string(),
        sasl_password: "s3cret".to_string(),
        ..plaintext(&broker, "secure")
    };
    let f = fixture(config).await;

    let sent = f.dispatcher.send_message("over scram").await.into_result().unwrap();
    assert!(sent.success);
    assert_eq!(broker.records("secure", 0).len(), 1);
}

#[tokio::test]
async fn test_send_with_wrong_credentials_is_err() {
    let broker = MockBroker::builder()
        .topic("secure", 1)
        .sasl_plain("svc", "s3cret")
        .start()
        .await
        .unwrap();
    let config = BrokerConfig {
        security_protocol: SecurityProtocol::SaslPlaintext,
        sasl_username: "svc".to_string(),
        sasl_password: "nope".to_string(),
        ..plaintext(&broker, "secure")
    };
    let f = fixture(config).await;

    let err = f
        .dispatcher
        .send_message("denied")
        .await
        .into_result()
        .unwrap_err();
    assert!(err.contains("authentication"), "{err}");
    assert!(broker.records("secure", 0).is_empty());
}

#[tokio::test]
async fn test_background_test_reports_each_state() {
    let broker = MockBroker::builder()
        .response_delay(Duration::from_millis(200))
        .start()
        .await
        .unwrap();
    let f = fixture(plaintext(&broker, "orders")).await;

    let test = f.dispatcher.start_connection_test(Some(5));
    let mut states = test.subscribe();
    assert_eq!(*states.borrow_and_update(), ConnectionTestState::Testing);

    states.changed().await.unwrap();
    assert_eq!(*states.borrow(), ConnectionTestState::Connected);
    assert!(!test.cancel());
    assert_eq!(test.wait().await, ConnectionTestState::Connected);
}

#[tokio::test]
async fn test_commands_reread_saved_config() {
    let first = MockBroker::builder().topic("t", 1).start().await.unwrap();
    let second = MockBroker::builder().topic("t", 1).start().await.unwrap();
    let f = fixture(plaintext(&first, "t")).await;

    f.dispatcher.send_message("to first").await.into_result().unwrap();
    assert!(f.dispatcher.save_config(plaintext(&second, "t")).await.is_ok());
    f.dispatcher.send_message("to second").await.into_result().unwrap();

    assert_eq!(first.records("t", 0).len(), 1);
    assert_eq!(second.records("t", 0).len(), 1);
}
