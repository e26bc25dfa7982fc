//! Bounded, group-less consumption.
//!
//! A fetch classifies the start offset against each partition's earliest and
//! latest offsets, then reads partitions in index order until `max_messages`
//! records are collected, every partition is drained up to its latest offset,
//! or the fetch ceiling elapses.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::{BrokerId, FetchRequest, ListOffsetsRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::connection::Connection;
use crate::error::{ConnectError, ConsumeError};
use crate::protocol::records::{decode_batches, Record};
use crate::protocol::{error_codes, versions};

/// Ceiling for one whole `fetch` call.
pub const DEFAULT_FETCH_CEILING: Duration = Duration::from_secs(15);

const FETCH_MAX_WAIT_MS: i32 = 500;
const PARTITION_MAX_BYTES: i32 = 1024 * 1024;
const FETCH_MAX_BYTES: i32 = 50 * 1024 * 1024;

const EARLIEST_TIMESTAMP: i64 = -2;
const LATEST_TIMESTAMP: i64 = -1;

/// One record as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedMessage {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

impl ConsumedMessage {
    fn from_record(partition: i32, record: Record) -> Self {
        Self {
            partition,
            offset: record.offset,
            key: record.key.map(|k| String::from_utf8_lossy(&k).into_owned()),
            value: record.value.map(|v| String::from_utf8_lossy(&v).into_owned()),
            timestamp: record.timestamp,
        }
    }
}

/// Where one partition is read from and up to.
#[derive(Debug, Clone, Copy)]
struct PartitionRange {
    leader: i32,
    next_offset: i64,
    end_offset: i64,
}

/// Reads records over a [`Connection`].
#[derive(Debug, Clone)]
pub struct Consumer {
    ceiling: Duration,
}

impl Default for Consumer {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_FETCH_CEILING,
        }
    }
}

impl Consumer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different ceiling for the whole fetch.
    #[must_use]
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Read up to `max_messages` records of `topic` starting at `start_offset`
    /// in every partition.
    ///
    /// Results are ordered by `(partition, offset)`. A start offset at or past
    /// the end of the log gives an empty result. If the ceiling elapses after
    /// some records were read, those records are returned.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::TopicNotFound`] for an unknown topic,
    /// [`ConsumeError::OffsetOutOfRange`] if `start_offset` precedes a
    /// partition's log start, and [`ConsumeError::Timeout`] if the ceiling
    /// elapses before any fetch completed.
    #[instrument(skip(self, connection))]
    pub async fn fetch(
        &self,
        connection: &mut Connection,
        topic: &str,
        start_offset: i64,
        max_messages: usize,
    ) -> Result<Vec<ConsumedMessage>, ConsumeError> {
        let deadline = Instant::now() + self.ceiling;
        connection.set_deadline(Some(deadline));
        let result = self
            .fetch_until(connection, topic, start_offset, max_messages)
            .await;
        connection.set_deadline(None);
        result
    }

    async fn fetch_until(
        &self,
        connection: &mut Connection,
        topic: &str,
        start_offset: i64,
        max_messages: usize,
    ) -> Result<Vec<ConsumedMessage>, ConsumeError> {
        let leaders = partition_leaders(connection, topic)?;
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let earliest = self
            .list_offsets(connection, topic, &leaders, EARLIEST_TIMESTAMP)
            .await?;
        let latest = self
            .list_offsets(connection, topic, &leaders, LATEST_TIMESTAMP)
            .await?;

        let mut ranges = BTreeMap::new();
        for (&partition, &leader) in &leaders {
            let log_start = earliest.get(&partition).copied().unwrap_or(0);
            let log_end = latest.get(&partition).copied().unwrap_or(0);

            if start_offset < log_start {
                return Err(ConsumeError::OffsetOutOfRange {
                    partition,
                    offset: start_offset,
                    log_start_offset: log_start,
                });
            }
            if start_offset >= log_end {
                debug!(partition, log_end, "start offset at or past log end, nothing to read");
                continue;
            }
            ranges.insert(
                partition,
                PartitionRange {
                    leader,
                    next_offset: start_offset,
                    end_offset: log_end,
                },
            );
        }

        let mut messages = Vec::new();
        let mut fetched_any = false;

        'partitions: for (partition, mut range) in ranges {
            while range.next_offset < range.end_offset && messages.len() < max_messages {
                let records = match self.fetch_partition(connection, topic, partition, &range).await {
                    Ok(records) => records,
                    Err(ConsumeError::Connect(ConnectError::Timeout { .. })) if fetched_any => {
                        warn!(
                            collected = messages.len(),
                            "fetch ceiling reached, returning partial result"
                        );
                        break 'partitions;
                    }
                    Err(ConsumeError::Connect(ConnectError::Timeout { .. })) => {
                        return Err(ConsumeError::Timeout(self.ceiling));
                    }
                    Err(e) => return Err(e),
                };
                fetched_any = true;

                let before = range.next_offset;
                for record in records {
                    if record.offset >= range.end_offset || messages.len() >= max_messages {
                        break;
                    }
                    range.next_offset = record.offset + 1;
                    messages.push(ConsumedMessage::from_record(partition, record));
                }
                if range.next_offset == before {
                    debug!(partition, offset = before, "no readable records below the log end");
                    break;
                }
            }
        }

        messages.sort_by_key(|m| (m.partition, m.offset));
        messages.truncate(max_messages);
        info!(topic, count = messages.len(), "fetch completed");
        Ok(messages)
    }

    /// One Fetch round trip for one partition, decoded from `range.next_offset`.
    async fn fetch_partition(
        &self,
        connection: &mut Connection,
        topic: &str,
        partition: i32,
        range: &PartitionRange,
    ) -> Result<Vec<Record>, ConsumeError> {
        let mut fetch_partition = FetchPartition::default();
        fetch_partition.partition = partition;
        fetch_partition.current_leader_epoch = -1;
        fetch_partition.fetch_offset = range.next_offset;
        fetch_partition.last_fetched_epoch = -1;
        fetch_partition.log_start_offset = -1;
        fetch_partition.partition_max_bytes = PARTITION_MAX_BYTES;

        let mut fetch_topic = FetchTopic::default();
        fetch_topic.topic = topic_name(topic);
        fetch_topic.partitions.push(fetch_partition);

        let mut request = FetchRequest::default();
        request.replica_id = BrokerId(-1);
        request.max_wait_ms = FETCH_MAX_WAIT_MS;
        request.min_bytes = 1;
        request.max_bytes = FETCH_MAX_BYTES;
        request.isolation_level = 0;
        request.session_id = 0;
        request.session_epoch = -1;
        request.topics.push(fetch_topic);

        debug!(partition, offset = range.next_offset, leader = range.leader, "fetching");
        let response = connection
            .broker(range.leader)
            .await?
            .send(&request, versions::FETCH)
            .await?;

        if response.error_code != error_codes::NONE {
            return Err(ConsumeError::Rejected {
                partition,
                code: response.error_code,
            });
        }

        let data = response
            .responses
            .into_iter()
            .filter(|t| t.topic.0.as_str() == topic)
            .flat_map(|t| t.partitions)
            .find(|p| p.partition_index == partition)
            .ok_or_else(|| {
                ConnectError::protocol(format!("fetch response is missing partition {partition}"))
            })?;

        match data.error_code {
            error_codes::NONE => {}
            error_codes::OFFSET_OUT_OF_RANGE => {
                return Err(ConsumeError::OffsetOutOfRange {
                    partition,
                    offset: range.next_offset,
                    log_start_offset: data.log_start_offset,
                });
            }
            error_codes::UNKNOWN_TOPIC_OR_PARTITION => {
                return Err(ConsumeError::TopicNotFound(topic.to_string()));
            }
            code => return Err(ConsumeError::Rejected { partition, code }),
        }

        let records = match data.records {
            Some(bytes) => decode_batches(&bytes, range.next_offset)?,
            None => Vec::new(),
        };
        debug!(
            partition,
            records = records.len(),
            high_watermark = data.high_watermark,
            "fetch response decoded"
        );
        Ok(records)
    }

    /// Offsets at `timestamp` (earliest or latest) for every partition, asked of each leader.
    async fn list_offsets(
        &self,
        connection: &mut Connection,
        topic: &str,
        leaders: &BTreeMap<i32, i32>,
        timestamp: i64,
    ) -> Result<HashMap<i32, i64>, ConsumeError> {
        let mut by_leader: BTreeMap<i32, Vec<i32>> = BTreeMap::new();
        for (&partition, &leader) in leaders {
            by_leader.entry(leader).or_default().push(partition);
        }

        let mut offsets = HashMap::new();
        for (leader, partitions) in by_leader {
            let mut list_topic = ListOffsetsTopic::default();
            list_topic.name = topic_name(topic);
            for &partition in &partitions {
                let mut list_partition = ListOffsetsPartition::default();
                list_partition.partition_index = partition;
                list_partition.current_leader_epoch = -1;
                list_partition.timestamp = timestamp;
                list_topic.partitions.push(list_partition);
            }

            let mut request = ListOffsetsRequest::default();
            request.replica_id = BrokerId(-1);
            request.isolation_level = 0;
            request.topics.push(list_topic);

            let response = match connection
                .broker(leader)
                .await?
                .send(&request, versions::LIST_OFFSETS)
                .await
            {
                Ok(response) => response,
                Err(ConnectError::Timeout { .. }) => return Err(ConsumeError::Timeout(self.ceiling)),
                Err(e) => return Err(e.into()),
            };

            for partition in response
                .topics
                .into_iter()
                .filter(|t| t.name.0.as_str() == topic)
                .flat_map(|t| t.partitions)
            {
                match partition.error_code {
                    error_codes::NONE => {
                        offsets.insert(partition.partition_index, partition.offset);
                    }
                    error_codes::UNKNOWN_TOPIC_OR_PARTITION => {
                        return Err(ConsumeError::TopicNotFound(topic.to_string()));
                    }
                    code => {
                        return Err(ConsumeError::Rejected {
                            partition: partition.partition_index,
                            code,
                        })
                    }
                }
            }
        }
        Ok(offsets)
    }
}

/// Partition index to leader node id, for every partition of `topic`.
fn partition_leaders(
    connection: &Connection,
    topic: &str,
) -> Result<BTreeMap<i32, i32>, ConsumeError> {
    let metadata = connection.metadata();
    let topic_metadata = metadata
        .topic(topic)
        .filter(|t| t.exists())
        .ok_or_else(|| ConsumeError::TopicNotFound(topic.to_string()))?;

    topic_metadata
        .partitions
        .iter()
        .map(|p| {
            metadata
                .leader(topic, p.partition_index)
                .map(|leader| (p.partition_index, leader.node_id))
                .ok_or(ConsumeError::Rejected {
                    partition: p.partition_index,
                    code: error_codes::LEADER_NOT_AVAILABLE,
                })
        })
        .collect()
}

fn topic_name(topic: &str) -> TopicName {
    TopicName(StrBytes::from_string(topic.to_string()))
}
