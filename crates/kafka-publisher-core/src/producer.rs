//! Single-record producer.
//!
//! Each send is one synchronous Produce request to the partition leader with
//! `acks = 1`. Stale leadership is retried once after a metadata refresh.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::{ProduceRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::error::ProduceError;
use crate::protocol::records::{encode_batch, Record};
use crate::protocol::{error_codes, partitioner, versions};

/// Leader acknowledgement only.
const ACKS_LEADER: i16 = 1;

/// How long the broker may wait for the write before answering.
const PRODUCE_TIMEOUT_MS: i32 = 5_000;

/// A record to send. The timestamp is taken at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl ProducedRecord {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    pub success: bool,
    pub message: String,
    /// Broker log-append time when reported, otherwise the send time (epoch ms).
    pub timestamp: i64,
}

/// Sends records over a [`Connection`].
#[derive(Debug, Clone, Default)]
pub struct Producer;

impl Producer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Send `record` to `topic` and wait for the leader to write it.
    ///
    /// # Errors
    ///
    /// Returns [`ProduceError::TopicNotFound`] for an unknown topic,
    /// [`ProduceError::LeaderNotAvailable`] if leadership is still stale after
    /// one refresh, and [`ProduceError::Rejected`] for any other broker error.
    #[instrument(skip(self, connection, record), fields(keyed = record.key.is_some(), bytes = record.value.len()))]
    pub async fn send(
        &self,
        connection: &mut Connection,
        topic: &str,
        record: ProducedRecord,
    ) -> Result<SendResult, ProduceError> {
        match self.send_once(connection, topic, &record).await {
            Err(ProduceError::LeaderNotAvailable { partition, .. }) => {
                warn!(topic, partition, "leader not available, refreshing metadata and retrying");
                connection.refresh_metadata().await?;
                self.send_once(connection, topic, &record).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        connection: &mut Connection,
        topic: &str,
        record: &ProducedRecord,
    ) -> Result<SendResult, ProduceError> {
        let metadata = connection.metadata();
        let topic_metadata = metadata
            .topic(topic)
            .filter(|t| t.exists())
            .ok_or_else(|| ProduceError::TopicNotFound(topic.to_string()))?;

        let partition =
            partitioner::partition_for(record.key.as_deref(), topic_metadata.partitions.len());
        let leader = metadata
            .leader(topic, partition)
            .map(|b| b.node_id)
            .ok_or_else(|| ProduceError::LeaderNotAvailable {
                topic: topic.to_string(),
                partition,
            })?;

        let sent_at = now_millis();
        let batch = encode_batch(
            0,
            &[Record::new(record.key.clone(), record.value.clone(), sent_at)],
        );

        let mut partition_data = PartitionProduceData::default();
        partition_data.index = partition;
        partition_data.records = Some(batch);

        let mut topic_data = TopicProduceData::default();
        topic_data.name = TopicName(StrBytes::from_string(topic.to_string()));
        topic_data.partition_data.push(partition_data);

        let mut request = ProduceRequest::default();
        request.acks = ACKS_LEADER;
        request.timeout_ms = PRODUCE_TIMEOUT_MS;
        request.topic_data.push(topic_data);

        debug!(topic, partition, leader, "sending produce request");
        let response = connection
            .broker(leader)
            .await?
            .send(&request, versions::PRODUCE)
            .await?;

        let partition_response = response
            .responses
            .iter()
            .filter(|t| t.name.0.as_str() == topic)
            .flat_map(|t| t.partition_responses.iter())
            .find(|p| p.index == partition)
            .ok_or_else(|| ProduceError::Rejected {
                topic: topic.to_string(),
                partition,
                code: error_codes::NONE,
                message: Some("response did not include the partition".to_string()),
            })?;

        match partition_response.error_code {
            error_codes::NONE => {}
            code if error_codes::is_stale_leader(code) => {
                return Err(ProduceError::LeaderNotAvailable {
                    topic: topic.to_string(),
                    partition,
                });
            }
            error_codes::UNKNOWN_TOPIC_OR_PARTITION => {
                return Err(ProduceError::TopicNotFound(topic.to_string()));
            }
            code => {
                return Err(ProduceError::Rejected {
                    topic: topic.to_string(),
                    partition,
                    code,
                    message: partition_response.error_message.as_ref().map(|m| m.to_string()),
                });
            }
        }

        let offset = partition_response.base_offset;
        let timestamp = if partition_response.log_append_time_ms >= 0 {
            partition_response.log_append_time_ms
        } else {
            sent_at
        };

        info!(topic, partition, offset, "record produced");
        Ok(SendResult {
            success: true,
            message: format!("Message sent to {topic} partition {partition} at offset {offset}"),
            timestamp,
        })
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
