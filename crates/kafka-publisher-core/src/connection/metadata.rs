//! Cluster metadata as seen by one command.

use kafka_protocol::messages::MetadataResponse;

use crate::protocol::error_codes;

/// Metadata container for the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClusterMetadata {
    pub brokers: Vec<BrokerMetadata>,

    /// The ID of the controller broker, if the cluster reported one.
    pub controller_id: Option<i32>,

    pub topics: Vec<TopicMetadata>,
}

/// Metadata for a certain broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    /// `host:port` for connecting.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Metadata for a certain topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    /// Topic-level error code; `0` when the topic is usable.
    pub error_code: i16,
    pub partitions: Vec<PartitionMetadata>,
}

impl TopicMetadata {
    /// Whether the topic exists on the cluster.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.error_code != error_codes::UNKNOWN_TOPIC_OR_PARTITION
    }

    #[must_use]
    pub fn partition(&self, index: i32) -> Option<&PartitionMetadata> {
        self.partitions.iter().find(|p| p.partition_index == index)
    }
}

/// Metadata for a certain partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub partition_index: i32,
    pub error_code: i16,
    /// The ID of the leader broker, `-1` while no leader is elected.
    pub leader_id: i32,
}

impl From<MetadataResponse> for ClusterMetadata {
    fn from(response: MetadataResponse) -> Self {
        let brokers = response
            .brokers
            .into_iter()
            .map(|b| BrokerMetadata {
                node_id: b.node_id.0,
                host: b.host.to_string(),
                port: b.port,
            })
            .collect();

        let topics = response
            .topics
            .into_iter()
            .filter_map(|t| {
                let name = t.name?.0.to_string();
                let mut partitions: Vec<PartitionMetadata> = t
                    .partitions
                    .into_iter()
                    .map(|p| PartitionMetadata {
                        partition_index: p.partition_index,
                        error_code: p.error_code,
                        leader_id: p.leader_id.0,
                    })
                    .collect();
                partitions.sort_by_key(|p| p.partition_index);
                Some(TopicMetadata {
                    name,
                    error_code: t.error_code,
                    partitions,
                })
            })
            .collect();

        let controller_id = Some(response.controller_id.0).filter(|id| *id >= 0);

        Self {
            brokers,
            controller_id,
            topics,
        }
    }
}

impl ClusterMetadata {
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics.iter().find(|t| t.name == name)
    }

    #[must_use]
    pub fn broker(&self, node_id: i32) -> Option<&BrokerMetadata> {
        self.brokers.iter().find(|b| b.node_id == node_id)
    }

    #[must_use]
    pub fn controller(&self) -> Option<&BrokerMetadata> {
        self.controller_id.and_then(|id| self.broker(id))
    }

    /// The broker leading `partition` of `topic`, if one is elected and known.
    #[must_use]
    pub fn leader(&self, topic: &str, partition: i32) -> Option<&BrokerMetadata> {
        let partition = self.topic(topic)?.partition(partition)?;
        if partition.leader_id < 0 {
            return None;
        }
        self.broker(partition.leader_id)
    }
}
