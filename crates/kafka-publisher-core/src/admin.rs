//! Topic administration.

use std::time::Duration;

use kafka_protocol::messages::create_topics_request::CreatableTopic;
use kafka_protocol::messages::{CreateTopicsRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

use crate::connection::{ClusterMetadata, Connection};
use crate::error::{AdminError, ConnectError};
use crate::protocol::{error_codes, versions};

/// How long the controller may take to create the topic.
const CREATE_TIMEOUT_MS: i32 = 5_000;

/// How long a created topic may take to show up in metadata.
pub const DEFAULT_PROPAGATION_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of a successful topic creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicCreateResult {
    pub success: bool,
    pub message: String,
    pub topic: String,
}

/// Creates topics through the controller.
#[derive(Debug, Clone)]
pub struct AdminClient {
    propagation_timeout: Duration,
}

impl Default for AdminClient {
    fn default() -> Self {
        Self {
            propagation_timeout: DEFAULT_PROPAGATION_TIMEOUT,
        }
    }
}

impl AdminClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_propagation_timeout(mut self, timeout: Duration) -> Self {
        self.propagation_timeout = timeout;
        self
    }

    /// Create `name` and wait until every partition has a leader in metadata.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::AlreadyExists`], [`AdminError::InvalidReplication`]
    /// when the cluster has too few brokers, and [`AdminError::Timeout`] if the
    /// topic is accepted but not visible within the propagation timeout.
    #[instrument(skip(self, connection))]
    pub async fn create_topic(
        &self,
        connection: &mut Connection,
        name: &str,
        partitions: i32,
        replication_factor: i16,
    ) -> Result<TopicCreateResult, AdminError> {
        if name.trim().is_empty() {
            return Err(AdminError::InvalidRequest("topic name must not be empty".to_string()));
        }
        if partitions < 1 {
            return Err(AdminError::InvalidRequest(format!(
                "partition count must be at least 1, got {partitions}"
            )));
        }
        if replication_factor < 1 {
            return Err(AdminError::InvalidRequest(format!(
                "replication factor must be at least 1, got {replication_factor}"
            )));
        }

        let available = connection.metadata().brokers.len();
        if replication_factor as usize > available {
            return Err(AdminError::InvalidReplication {
                requested: replication_factor,
                available,
            });
        }

        let mut topic = CreatableTopic::default();
        topic.name = TopicName(StrBytes::from_string(name.to_string()));
        topic.num_partitions = partitions;
        topic.replication_factor = replication_factor;

        let mut request = CreateTopicsRequest::default();
        request.topics.push(topic);
        request.timeout_ms = CREATE_TIMEOUT_MS;
        request.validate_only = false;

        let controller = connection.controller().await?;
        debug!(controller = %controller.address(), "sending create topics request");
        let response = controller.send(&request, versions::CREATE_TOPICS).await?;

        let result = response
            .topics
            .into_iter()
            .find(|t| t.name.0.as_str() == name)
            .ok_or_else(|| {
                ConnectError::protocol(format!("create topics response is missing '{name}'"))
            })?;

        match result.error_code {
            error_codes::NONE => {}
            error_codes::TOPIC_ALREADY_EXISTS => {
                return Err(AdminError::AlreadyExists(name.to_string()));
            }
            error_codes::INVALID_REPLICATION_FACTOR => {
                return Err(AdminError::InvalidReplication {
                    requested: replication_factor,
                    available,
                });
            }
            code => {
                return Err(AdminError::Rejected {
                    topic: name.to_string(),
                    code,
                    message: result.error_message.map(|m| m.to_string()),
                });
            }
        }

        self.await_propagation(connection, name).await?;

        info!(topic = name, partitions, replication_factor, "topic created");
        Ok(TopicCreateResult {
            success: true,
            message: format!("Topic '{name}' created successfully"),
            topic: name.to_string(),
        })
    }

    /// Poll metadata until `name` is visible with a leader for every partition.
    async fn await_propagation(&self, connection: &mut Connection, name: &str) -> Result<(), AdminError> {
        let started = Instant::now();
        let deadline = started + self.propagation_timeout;
        let timed_out = || AdminError::Timeout {
            topic: name.to_string(),
            after: started.elapsed(),
        };

        connection.set_deadline(Some(deadline));
        let result = loop {
            match connection.load_metadata(Some(vec![name])).await {
                Ok(metadata) if is_visible(&metadata, name) => break Ok(()),
                Ok(_) => {}
                Err(ConnectError::Timeout { .. }) => break Err(timed_out()),
                Err(e) => break Err(e.into()),
            }

            // Halving the pause near the end leaves time for one more poll.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(timed_out());
            }
            debug!(topic = name, "topic not visible yet");
            sleep(POLL_INTERVAL.min(remaining / 2)).await;
        };
        connection.set_deadline(None);
        result
    }
}

fn is_visible(metadata: &ClusterMetadata, name: &str) -> bool {
    metadata.topic(name).is_some_and(|topic| {
        topic.error_code == error_codes::NONE
            && !topic.partitions.is_empty()
            && topic.partitions.iter().all(|p| p.leader_id >= 0)
    })
}
