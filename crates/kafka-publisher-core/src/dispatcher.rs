//! The six boundary commands.
//!
//! Every network command loads the configuration, builds fresh security
//! material, opens a connection, delegates, closes the connection and folds
//! the outcome into a [`CommandResult`]. No error type escapes this module.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::admin::{AdminClient, TopicCreateResult, DEFAULT_PROPAGATION_TIMEOUT};
use crate::config::{BrokerConfig, ConfigStore};
use crate::connection::{Connection, ConnectionManager};
use crate::consumer::{ConsumedMessage, Consumer};
use crate::error::EngineError;
use crate::producer::{ProducedRecord, Producer, SendResult};
use crate::security::SecurityContext;

pub const DEFAULT_TEST_TIMEOUT_SECS: u64 = 5;
pub const MAX_TEST_TIMEOUT_SECS: u64 = 60;

const SEND_CEILING: Duration = Duration::from_secs(10);
const CREATE_TOPIC_CEILING: Duration = Duration::from_secs(10);
const CONSUME_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_PARTITIONS: i32 = 1;
pub const DEFAULT_REPLICATION_FACTOR: i16 = 1;
pub const DEFAULT_MAX_MESSAGES: usize = 50;

/// The only shape returned across the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CommandResult<T> {
    Ok(T),
    Err(String),
}

impl<T> CommandResult<T> {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Err(message) => Err(message),
        }
    }
}

impl<T> From<Result<T, EngineError>> for CommandResult<T> {
    fn from(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::Err(e.to_string()),
        }
    }
}

/// States of a connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum ConnectionTestState {
    Idle,
    Testing,
    Connected,
    Failed(String),
    TimedOut,
    Cancelled,
}

impl ConnectionTestState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Idle | Self::Testing)
    }
}

/// A running connection test that can be cancelled.
///
/// Cancelling stops waiting for the result. The test then reports
/// [`ConnectionTestState::Cancelled`] whatever the network task does next.
pub struct ConnectionTest {
    state: Arc<watch::Sender<ConnectionTestState>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionTest {
    /// Cancel the test. Returns `false` if it had already finished.
    pub fn cancel(&self) -> bool {
        let cancelled = settle(&self.state, ConnectionTestState::Cancelled);
        if cancelled {
            self.token.cancel();
            info!("connection test cancelled");
        }
        cancelled
    }

    #[must_use]
    pub fn state(&self) -> ConnectionTestState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionTestState> {
        self.state.subscribe()
    }

    /// Wait for a terminal state.
    ///
    /// A test whose task panics ends as [`ConnectionTestState::Failed`].
    pub async fn wait(mut self) -> ConnectionTestState {
        let mut receiver = self.state.subscribe();
        tokio::select! {
            _ = receiver.wait_for(ConnectionTestState::is_terminal) => {}
            joined = &mut self.task => {
                if let Err(e) = joined {
                    warn!(error = %e, "connection test task ended abnormally");
                    settle(&self.state, ConnectionTestState::Failed(e.to_string()));
                }
            }
        }

        let state = self.state.borrow().clone();
        if state == ConnectionTestState::Cancelled {
            self.task.abort();
        }
        state
    }

    /// Run `check` in the background and publish its outcome.
    fn spawn<F>(check: F) -> Self
    where
        F: Future<Output = ConnectionTestState> + Send + 'static,
    {
        let (sender, _) = watch::channel(ConnectionTestState::Idle);
        let state = Arc::new(sender);
        let token = CancellationToken::new();

        state.send_replace(ConnectionTestState::Testing);

        let task_state = Arc::clone(&state);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                () = task_token.cancelled() => return,
                outcome = check => outcome,
            };
            settle(&task_state, outcome);
        });

        Self { state, token, task }
    }
}

/// Move a running test to `outcome`. Later outcomes never replace a terminal state.
fn settle(state: &watch::Sender<ConnectionTestState>, outcome: ConnectionTestState) -> bool {
    state.send_if_modified(|state| {
        if *state == ConnectionTestState::Testing {
            *state = outcome;
            true
        } else {
            false
        }
    })
}

/// Entry point for every boundary command.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    store: ConfigStore,
}

impl CommandDispatcher {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// The persisted configuration, or the defaults.
    pub async fn get_config(&self) -> BrokerConfig {
        self.store.load().await
    }

    #[instrument(skip_all)]
    pub async fn save_config(&self, config: BrokerConfig) -> CommandResult<()> {
        let result = self.store.save(&config).await.map_err(EngineError::from);
        if let Err(e) = &result {
            warn!(error = %e, "configuration rejected");
        }
        result.into()
    }

    /// Connect with the saved configuration and report whether it worked.
    ///
    /// `timeout_seconds` defaults to 5 and is clamped to 1..=60.
    #[instrument(skip(self))]
    pub async fn test_connection(&self, timeout_seconds: Option<u64>) -> CommandResult<bool> {
        let result = self
            .run_connection_test(test_timeout(timeout_seconds))
            .await
            .map(|()| true);
        log_outcome("test connection", &result);
        result.into()
    }

    /// Start a connection test in the background.
    #[must_use]
    pub fn start_connection_test(&self, timeout_seconds: Option<u64>) -> ConnectionTest {
        let dispatcher = self.clone();
        let limit = test_timeout(timeout_seconds);
        ConnectionTest::spawn(async move {
            match dispatcher.run_connection_test(limit).await {
                Ok(()) => ConnectionTestState::Connected,
                Err(e) if e.is_timeout() => ConnectionTestState::TimedOut,
                Err(e) => ConnectionTestState::Failed(e.to_string()),
            }
        })
    }

    /// Send `message` to the configured topic.
    #[instrument(skip(self, message), fields(bytes = message.len()))]
    pub async fn send_message(&self, message: &str) -> CommandResult<SendResult> {
        let result = bounded("send message", SEND_CEILING, async {
            let config = self.store.load().await;
            let mut connection = open(&config, Some(&config.topic), SEND_CEILING).await?;
            let sent = Producer::new()
                .send(
                    &mut connection,
                    &config.topic,
                    ProducedRecord::new(message.to_string()),
                )
                .await;
            connection.close().await;
            Ok::<_, EngineError>(sent?)
        })
        .await;
        log_outcome("send message", &result);
        result.into()
    }

    /// Create a topic; partitions and replication factor default to 1.
    #[instrument(skip(self))]
    pub async fn create_topic(
        &self,
        topic_name: &str,
        num_partitions: Option<i32>,
        replication_factor: Option<i16>,
    ) -> CommandResult<TopicCreateResult> {
        let partitions = num_partitions.unwrap_or(DEFAULT_PARTITIONS);
        let replication = replication_factor.unwrap_or(DEFAULT_REPLICATION_FACTOR);
        let ceiling = CREATE_TOPIC_CEILING + DEFAULT_PROPAGATION_TIMEOUT;

        let result = bounded("create topic", ceiling, async {
            let config = self.store.load().await;
            let mut connection = open(&config, None, CREATE_TOPIC_CEILING).await?;
            let created = AdminClient::new()
                .create_topic(&mut connection, topic_name, partitions, replication)
                .await;
            connection.close().await;
            Ok::<_, EngineError>(created?)
        })
        .await;
        log_outcome("create topic", &result);
        result.into()
    }

    /// Read records; the topic falls back to the configured one when empty.
    #[instrument(skip(self))]
    pub async fn consume_messages(
        &self,
        topic: Option<&str>,
        offset: Option<i64>,
        max_messages: Option<usize>,
    ) -> CommandResult<Vec<ConsumedMessage>> {
        let result = async {
            let config = self.store.load().await;
            let topic = topic
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(config.topic.as_str());
            let mut connection = open(&config, Some(topic), CONSUME_CONNECT_TIMEOUT).await?;
            let fetched = Consumer::new()
                .fetch(
                    &mut connection,
                    topic,
                    offset.unwrap_or(0),
                    max_messages.unwrap_or(DEFAULT_MAX_MESSAGES),
                )
                .await;
            connection.close().await;
            Ok::<_, EngineError>(fetched?)
        }
        .await;
        log_outcome("consume messages", &result);
        result.into()
    }

    async fn run_connection_test(&self, limit: Duration) -> Result<(), EngineError> {
        let config = self.store.load().await;
        let connection = open(&config, None, limit).await?;
        info!(
            broker = connection.bootstrap_address(),
            brokers = connection.metadata().brokers.len(),
            "connection test succeeded"
        );
        connection.close().await;
        Ok(())
    }
}

/// Build security material from `config` and open a connection.
async fn open(
    config: &BrokerConfig,
    topic: Option<&str>,
    limit: Duration,
) -> Result<Connection, EngineError> {
    let security = SecurityContext::build(config)?;
    let connection = ConnectionManager::new(config.client_id.clone())
        .connect(&config.bootstrap_servers(), topic, security, limit)
        .await?;
    Ok(connection)
}

/// Run `command` under an outer ceiling. Dropping the future closes its sockets.
async fn bounded<T>(
    command: &'static str,
    ceiling: Duration,
    future: impl std::future::Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    timeout(ceiling, future)
        .await
        .map_err(|_| EngineError::Timeout {
            command,
            after: ceiling,
        })?
}

fn test_timeout(timeout_seconds: Option<u64>) -> Duration {
    let seconds = timeout_seconds
        .unwrap_or(DEFAULT_TEST_TIMEOUT_SECS)
        .clamp(1, MAX_TEST_TIMEOUT_SECS);
    Duration::from_secs(seconds)
}

fn log_outcome<T>(command: &str, result: &Result<T, EngineError>) {
    match result {
        Ok(_) => info!(command, "command succeeded"),
        Err(e) => warn!(command, error = %e, timeout = e.is_timeout(), "command failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProtocol;
    use crate::testing::MockBroker;
    use tempfile::TempDir;

    async fn dispatcher_for(broker: &str, topic: &str) -> (CommandDispatcher, TempDir) {
        let dir = TempDir::new().unwrap();
        let dispatcher = CommandDispatcher::new(ConfigStore::open(dir.path().join("config.json")));
        let config = BrokerConfig {
            broker: broker.to_string(),
            topic: topic.to_string(),
            ..BrokerConfig::default()
        };
        assert!(dispatcher.save_config(config).await.is_ok());
        (dispatcher, dir)
    }

    #[test]
    fn test_command_result_serialization() {
        let ok: CommandResult<bool> = CommandResult::Ok(true);
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"type":"Ok","data":true}"#);

        let err: CommandResult<bool> = CommandResult::Err("boom".to_string());
        assert_eq!(serde_json::to_string(&err).unwrap(), r#"{"type":"Err","data":"boom"}"#);

        let unit: CommandResult<()> = CommandResult::Ok(());
        assert_eq!(serde_json::to_string(&unit).unwrap(), r#"{"type":"Ok","data":null}"#);
    }

    #[test]
    fn test_timeout_clamping() {
        assert_eq!(test_timeout(None), Duration::from_secs(5));
        assert_eq!(test_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(test_timeout(Some(600)), Duration::from_secs(60));
        assert_eq!(test_timeout(Some(7)), Duration::from_secs(7));
    }

    async fn lose_socket() -> ConnectionTestState {
        panic!("lost the socket")
    }

    #[tokio::test]
    async fn test_panicking_test_task_is_failed() {
        let test = ConnectionTest::spawn(lose_socket());

        let state = timeout(Duration::from_secs(2), test.wait()).await.unwrap();
        assert!(matches!(state, ConnectionTestState::Failed(reason) if reason.contains("panicked")));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ConnectionTestState::Idle.is_terminal());
        assert!(!ConnectionTestState::Testing.is_terminal());
        assert!(ConnectionTestState::Connected.is_terminal());
        assert!(ConnectionTestState::Failed("x".into()).is_terminal());
        assert!(ConnectionTestState::TimedOut.is_terminal());
        assert!(ConnectionTestState::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn test_save_config_reports_field() {
        let dir = TempDir::new().unwrap();
        let dispatcher = CommandDispatcher::new(ConfigStore::open(dir.path().join("config.json")));
        let config = BrokerConfig {
            security_protocol: SecurityProtocol::SaslPlaintext,
            sasl_password: "secret".to_string(),
            ..BrokerConfig::default()
        };

        let result = dispatcher.save_config(config).await;
        let message = result.into_result().unwrap_err();
        assert!(message.starts_with("configuration error"));
        assert!(message.contains("sasl_username"));
    }

    #[tokio::test]
    async fn test_connection_to_mock_broker() {
        let broker = MockBroker::builder().start().await.unwrap();
        let (dispatcher, _dir) = dispatcher_for(broker.address(), "orders").await;

        assert_eq!(dispatcher.test_connection(Some(2)).await, CommandResult::Ok(true));
    }

    #[tokio::test]
    async fn test_background_test_connects() {
        let broker = MockBroker::builder().start().await.unwrap();
        let (dispatcher, _dir) = dispatcher_for(broker.address(), "orders").await;

        let test = dispatcher.start_connection_test(Some(2));
        assert_eq!(test.state(), ConnectionTestState::Testing);
        assert_eq!(test.wait().await, ConnectionTestState::Connected);
    }

    #[tokio::test]
    async fn test_background_test_can_be_cancelled() {
        let broker = MockBroker::builder()
            .response_delay(Duration::from_secs(3))
            .start()
            .await
            .unwrap();
        let (dispatcher, _dir) = dispatcher_for(broker.address(), "orders").await;

        let test = dispatcher.start_connection_test(Some(5));
        assert!(test.cancel());
        assert!(!test.cancel());
        assert_eq!(test.state(), ConnectionTestState::Cancelled);
        assert_eq!(test.wait().await, ConnectionTestState::Cancelled);
    }

    #[tokio::test]
    async fn test_background_test_times_out() {
        let broker = MockBroker::builder()
            .response_delay(Duration::from_secs(3))
            .start()
            .await
            .unwrap();
        let (dispatcher, _dir) = dispatcher_for(broker.address(), "orders").await;

        let test = dispatcher.start_connection_test(Some(1));
        assert_eq!(test.wait().await, ConnectionTestState::TimedOut);
    }

    #[tokio::test]
    async fn test_send_then_consume() {
        let broker = MockBroker::builder().topic("orders", 1).start().await.unwrap();
        let (dispatcher, _dir) = dispatcher_for(broker.address(), "orders").await;

        let sent = dispatcher.send_message("hello").await.into_result().unwrap();
        assert!(sent.success);

        let messages = dispatcher
            .consume_messages(None, Some(0), Some(10))
            .await
            .into_result()
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].value.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_to_missing_topic_is_err() {
        let broker = MockBroker::builder().start().await.unwrap();
        let (dispatcher, _dir) = dispatcher_for(broker.address(), "missing").await;

        let message = dispatcher.send_message("x").await.into_result().unwrap_err();
        assert!(message.starts_with("send failed"));
        assert!(message.contains("missing"));
    }

    #[tokio::test]
    async fn test_create_topic_defaults() {
        let broker = MockBroker::builder().start().await.unwrap();
        let (dispatcher, _dir) = dispatcher_for(broker.address(), "orders").await;

        let created = dispatcher
            .create_topic("fresh", None, None)
            .await
            .into_result()
            .unwrap();
        assert_eq!(created.topic, "fresh");
        assert_eq!(broker.partition_count("fresh"), Some(DEFAULT_PARTITIONS));
    }
}
