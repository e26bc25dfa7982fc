//! Connection establishment and cluster metadata.

mod manager;
pub mod metadata;

pub use manager::{Connection, ConnectionManager};
pub use metadata::{BrokerMetadata, ClusterMetadata, PartitionMetadata, TopicMetadata};
