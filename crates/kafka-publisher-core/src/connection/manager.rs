//! Single-use, authenticated connections with metadata.
//!
//! [`ConnectionManager::connect`] tries the bootstrap brokers in order within
//! one timeout budget, authenticates, and fetches metadata. The resulting
//! [`Connection`] belongs to one command and is closed when it finishes; any
//! extra sockets it opens to partition leaders or the controller close with it.

use std::collections::HashMap;
use std::time::Duration;

use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{MetadataRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::broker::BrokerConnection;
use crate::error::{ConnectError, ConnectResult};
use crate::protocol::versions;
use crate::security::SecurityMaterial;

use super::metadata::ClusterMetadata;

/// Opens [`Connection`]s.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    client_id: String,
}

impl ConnectionManager {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// Connect to the first reachable bootstrap broker and load metadata for `topic`.
    ///
    /// Without a topic only broker and controller metadata is requested. The
    /// whole sequence, including every bootstrap attempt, shares `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the error of the last failed attempt, or [`ConnectError::Timeout`]
    /// once the budget is spent.
    #[instrument(skip(self, security), fields(client_id = %self.client_id))]
    pub async fn connect(
        &self,
        brokers: &[String],
        topic: Option<&str>,
        security: SecurityMaterial,
        timeout: Duration,
    ) -> ConnectResult<Connection> {
        let started = Instant::now();
        let deadline = started + timeout;

        let mut last_error = None;
        for address in brokers {
            match BrokerConnection::open(address, &security, &self.client_id, deadline).await {
                Ok(bootstrap) => {
                    let mut connection = Connection {
                        bootstrap,
                        others: HashMap::new(),
                        security,
                        client_id: self.client_id.clone(),
                        connect_timeout: timeout,
                        topic: topic.map(str::to_string),
                        metadata: ClusterMetadata::default(),
                        deadline: None,
                    };

                    connection.bootstrap.set_deadline(Some(deadline));
                    let loaded = connection.load_metadata(topic.map(|t| vec![t])).await;
                    connection.bootstrap.set_deadline(None);

                    return match loaded {
                        Ok(metadata) => {
                            info!(
                                broker = %address,
                                brokers = metadata.brokers.len(),
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "connected"
                            );
                            connection.metadata = metadata;
                            Ok(connection)
                        }
                        Err(e) => {
                            connection.close().await;
                            Err(e)
                        }
                    };
                }
                Err(e @ (ConnectError::Timeout { .. } | ConnectError::AuthFailed { .. })) => {
                    warn!(broker = %address, error = %e, "bootstrap broker failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(broker = %address, error = %e, "bootstrap broker failed, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectError::Refused {
            broker: String::new(),
            message: "no bootstrap servers configured".to_string(),
        }))
    }
}

/// An open connection plus the metadata it discovered.
pub struct Connection {
    bootstrap: BrokerConnection,
    others: HashMap<i32, BrokerConnection>,
    security: SecurityMaterial,
    client_id: String,
    connect_timeout: Duration,
    topic: Option<String>,
    metadata: ClusterMetadata,
    deadline: Option<Instant>,
}

impl Connection {
    #[must_use]
    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    /// Address of the bootstrap broker this connection reached.
    #[must_use]
    pub fn bootstrap_address(&self) -> &str {
        self.bootstrap.address()
    }

    /// Bound requests on every socket of this connection by `deadline`.
    ///
    /// Sockets opened later by [`Connection::broker`] inherit it.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
        self.bootstrap.set_deadline(deadline);
        for connection in self.others.values_mut() {
            connection.set_deadline(deadline);
        }
    }

    /// Re-request metadata for the connection's topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata round trip fails.
    pub async fn refresh_metadata(&mut self) -> ConnectResult<&ClusterMetadata> {
        let topic = self.topic.clone();
        let metadata = self.load_metadata(topic.as_deref().map(|t| vec![t])).await?;
        self.metadata = metadata;
        Ok(&self.metadata)
    }

    /// Request metadata for `topics` from the bootstrap broker without storing it.
    ///
    /// `None` requests no topics at all, only the broker list.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata round trip fails.
    pub async fn load_metadata(&mut self, topics: Option<Vec<&str>>) -> ConnectResult<ClusterMetadata> {
        let mut request = MetadataRequest::default();
        request.topics = Some(
            topics
                .unwrap_or_default()
                .into_iter()
                .map(|name| {
                    let mut topic = MetadataRequestTopic::default();
                    topic.name = Some(TopicName(StrBytes::from_string(name.to_string())));
                    topic
                })
                .collect(),
        );
        request.allow_auto_topic_creation = false;

        let response = self.bootstrap.send(&request, versions::METADATA).await?;
        let metadata = ClusterMetadata::from(response);
        debug!(
            brokers = metadata.brokers.len(),
            topics = metadata.topics.len(),
            controller = ?metadata.controller_id,
            "metadata loaded"
        );
        Ok(metadata)
    }

    /// The bootstrap socket.
    pub fn bootstrap(&mut self) -> &mut BrokerConnection {
        &mut self.bootstrap
    }

    /// A socket to broker `node_id`, opened on first use.
    ///
    /// The bootstrap socket is reused when it already points at that broker.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Protocol`] for a broker missing from metadata, or
    /// the error of opening the new socket.
    pub async fn broker(&mut self, node_id: i32) -> ConnectResult<&mut BrokerConnection> {
        let address = self
            .metadata
            .broker(node_id)
            .map(|b| b.address())
            .ok_or_else(|| {
                ConnectError::protocol(format!("broker {node_id} is not in cluster metadata"))
            })?;

        if address == self.bootstrap.address() {
            return Ok(&mut self.bootstrap);
        }

        if !self.others.contains_key(&node_id) {
            debug!(node_id, broker = %address, "opening connection to broker");
            let connect_by = Instant::now() + self.connect_timeout;
            let connect_by = self.deadline.map_or(connect_by, |d| d.min(connect_by));
            let mut connection =
                BrokerConnection::open(&address, &self.security, &self.client_id, connect_by)
                    .await?;
            connection.set_deadline(self.deadline);
            self.others.insert(node_id, connection);
        }

        self.others
            .get_mut(&node_id)
            .ok_or_else(|| ConnectError::protocol(format!("lost connection to broker {node_id}")))
    }

    /// A socket to the controller, or the bootstrap broker when none is reported.
    ///
    /// # Errors
    ///
    /// Returns the error of opening the controller socket.
    pub async fn controller(&mut self) -> ConnectResult<&mut BrokerConnection> {
        match self.metadata.controller().map(|b| b.node_id) {
            Some(node_id) => self.broker(node_id).await,
            None => Ok(&mut self.bootstrap),
        }
    }

    /// Close every socket.
    pub async fn close(self) {
        for (_, connection) in self.others {
            connection.shutdown().await;
        }
        self.bootstrap.shutdown().await;
    }
}
