//! Mock Kafka broker for integration testing.
//!
//! A lightweight in-process broker that:
//! - Accepts Kafka protocol connections, optionally over TLS
//! - Records every request it receives
//! - Keeps topic logs in memory and answers Metadata, Produce, Fetch,
//!   ListOffsets and CreateTopics from them
//! - Runs the server side of SASL/PLAIN and SASL/SCRAM
//!
//! A simulated cluster of several brokers shares one listener: every node id
//! advertises the same address.

use std::collections::BTreeMap;
use std::io::{self, BufReader};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::create_topics_response::CreatableTopicResult;
use kafka_protocol::messages::fetch_response::{FetchableTopicResponse, PartitionData};
use kafka_protocol::messages::list_offsets_response::{
    ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::produce_response::{PartitionProduceResponse, TopicProduceResponse};
use kafka_protocol::messages::{
    BrokerId, CreateTopicsRequest, CreateTopicsResponse, FetchRequest, FetchResponse,
    ListOffsetsRequest, ListOffsetsResponse, MetadataRequest, MetadataResponse, ProduceRequest,
    ProduceResponse, RequestHeader, ResponseHeader, SaslAuthenticateRequest,
    SaslAuthenticateResponse, SaslHandshakeRequest, SaslHandshakeResponse, TopicName,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, Request, StrBytes};
use rand::Rng;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tokio_rustls::TlsAcceptor;

use crate::config::SaslMechanism;
use crate::protocol::error_codes;
use crate::protocol::records::{decode_batches, encode_batch, Record};
use crate::security::scram::{ScramHash, ScramKeys, ScramSha256, ScramSha512, MIN_ITERATIONS};

use super::certs::{TEST_CERT, TEST_KEY};

/// Larger frames are treated as garbage, e.g. a TLS hello on a plaintext port.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// API keys for Kafka protocol
pub mod api_keys {
    pub const PRODUCE: i16 = 0;
    pub const FETCH: i16 = 1;
    pub const LIST_OFFSETS: i16 = 2;
    pub const METADATA: i16 = 3;
    pub const SASL_HANDSHAKE: i16 = 17;
    pub const CREATE_TOPICS: i16 = 19;
    pub const SASL_AUTHENTICATE: i16 = 36;
}

/// A recorded broker call.
#[derive(Debug, Clone)]
pub struct BrokerCall {
    /// The API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
    /// The correlation ID.
    pub correlation_id: i32,
}

#[derive(Debug, Clone)]
struct SaslUser {
    mechanism: SaslMechanism,
    username: String,
    password: String,
}

/// Configures and starts a [`MockBroker`].
#[derive(Debug, Default)]
pub struct MockBrokerBuilder {
    topics: Vec<(String, i32)>,
    broker_count: i32,
    sasl: Option<SaslUser>,
    tls: bool,
    log_start_offset: i64,
    propagation_delay: Duration,
    response_delay: Duration,
    fetch_delay: Duration,
    produce_failure: Option<(i16, usize)>,
}

impl MockBrokerBuilder {
    /// Pre-create `name` with `partitions` empty partitions.
    #[must_use]
    pub fn topic(mut self, name: &str, partitions: i32) -> Self {
        self.topics.push((name.to_string(), partitions));
        self
    }

    /// Number of brokers reported in metadata. Defaults to 1.
    #[must_use]
    pub fn broker_count(mut self, count: i32) -> Self {
        self.broker_count = count;
        self
    }

    #[must_use]
    pub fn sasl_plain(self, username: &str, password: &str) -> Self {
        self.sasl(SaslMechanism::Plain, username, password)
    }

    #[must_use]
    pub fn sasl_scram_sha256(self, username: &str, password: &str) -> Self {
        self.sasl(SaslMechanism::ScramSha256, username, password)
    }

    #[must_use]
    pub fn sasl_scram_sha512(self, username: &str, password: &str) -> Self {
        self.sasl(SaslMechanism::ScramSha512, username, password)
    }

    fn sasl(mut self, mechanism: SaslMechanism, username: &str, password: &str) -> Self {
        self.sasl = Some(SaslUser {
            mechanism,
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Accept TLS with the self-signed test certificate.
    #[must_use]
    pub fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// First offset of every pre-created partition.
    #[must_use]
    pub fn log_start_offset(mut self, offset: i64) -> Self {
        self.log_start_offset = offset;
        self
    }

    /// How long a created topic stays invisible in metadata.
    #[must_use]
    pub fn propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Delay before answering any request.
    #[must_use]
    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Extra delay before answering Fetch and ListOffsets.
    #[must_use]
    pub fn fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Answer the next `times` produce requests with `code` without writing.
    #[must_use]
    pub fn fail_produce_with(mut self, code: i16, times: usize) -> Self {
        self.produce_failure = Some((code, times));
        self
    }

    /// Bind to an ephemeral localhost port and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the TLS acceptor cannot be built.
    pub async fn start(self) -> io::Result<MockBroker> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local = listener.local_addr()?;
        let acceptor = if self.tls { Some(tls_acceptor()?) } else { None };

        let now = Instant::now();
        let log_start = self.log_start_offset;
        let topics = self
            .topics
            .into_iter()
            .map(|(name, partitions)| (name, TopicState::new(partitions, log_start, now)))
            .collect();

        let shared = Arc::new(Shared {
            settings: Settings {
                host: local.ip().to_string(),
                port: i32::from(local.port()),
                broker_count: self.broker_count.max(1),
                sasl: self.sasl,
                propagation_delay: self.propagation_delay,
                response_delay: self.response_delay,
                fetch_delay: self.fetch_delay,
            },
            state: Mutex::new(ClusterState {
                topics,
                produce_failure: self.produce_failure,
            }),
            calls: Mutex::new(Vec::new()),
        });

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let accept_shared = Arc::clone(&shared);
        let accept_shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => {
                        let Ok((stream, _addr)) = result else { break };
                        let _ = stream.set_nodelay(true);
                        let shared = Arc::clone(&accept_shared);
                        let shutdown_rx = accept_shutdown.subscribe();
                        let acceptor = acceptor.clone();

                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => {
                                    if let Ok(stream) = acceptor.accept(stream).await {
                                        serve(stream, shared, shutdown_rx).await;
                                    }
                                }
                                None => serve(stream, shared, shutdown_rx).await,
                            }
                        });
                    }
                }
            }
        });

        Ok(MockBroker {
            address: local.to_string(),
            shutdown_tx,
            shared,
        })
    }
}

/// Mock Kafka broker for testing.
pub struct MockBroker {
    address: String,
    shutdown_tx: broadcast::Sender<()>,
    shared: Arc<Shared>,
}

impl MockBroker {
    #[must_use]
    pub fn builder() -> MockBrokerBuilder {
        MockBrokerBuilder::default()
    }

    /// Get the broker address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop accepting and close every open connection.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Records stored in one partition, in offset order.
    #[must_use]
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        self.shared
            .state()
            .partition(topic, partition)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Partition count of `topic`, if it exists (visible or not).
    #[must_use]
    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.shared
            .state()
            .topics
            .get(topic)
            .map(|t| t.partitions.len() as i32)
    }

    /// Get all recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<BrokerCall> {
        lock(&self.shared.calls).clone()
    }

    /// Get calls filtered by API key.
    #[must_use]
    pub fn calls_for_api(&self, api_key: i16) -> Vec<BrokerCall> {
        lock(&self.shared.calls)
            .iter()
            .filter(|c| c.api_key == api_key)
            .cloned()
            .collect()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Settings {
    host: String,
    port: i32,
    broker_count: i32,
    sasl: Option<SaslUser>,
    propagation_delay: Duration,
    response_delay: Duration,
    fetch_delay: Duration,
}

struct ClusterState {
    topics: BTreeMap<String, TopicState>,
    produce_failure: Option<(i16, usize)>,
}

impl ClusterState {
    fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionLog> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get(topic)?.partitions.get(index)
    }

    fn partition_mut(&mut self, topic: &str, partition: i32) -> Option<&mut PartitionLog> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get_mut(topic)?.partitions.get_mut(index)
    }

    fn take_produce_failure(&mut self) -> Option<i16> {
        let (code, remaining) = self.produce_failure.as_mut()?;
        let code = *code;
        *remaining -= 1;
        if *remaining == 0 {
            self.produce_failure = None;
        }
        Some(code)
    }
}

struct TopicState {
    visible_at: Instant,
    partitions: Vec<PartitionLog>,
}

impl TopicState {
    fn new(partitions: i32, log_start: i64, visible_at: Instant) -> Self {
        Self {
            visible_at,
            partitions: (0..partitions)
                .map(|_| PartitionLog {
                    log_start,
                    records: Vec::new(),
                })
                .collect(),
        }
    }
}

struct PartitionLog {
    log_start: i64,
    records: Vec<Record>,
}

impl PartitionLog {
    fn log_end(&self) -> i64 {
        self.log_start + self.records.len() as i64
    }

    /// Assign offsets to `records`, store them and return the first offset.
    fn append(&mut self, records: Vec<Record>) -> i64 {
        let base_offset = self.log_end();
        for mut record in records {
            record.offset = self.log_end();
            self.records.push(record);
        }
        base_offset
    }
}

/// Per-connection SASL progress.
#[derive(Default)]
enum SaslState {
    #[default]
    Pending,
    Handshaked,
    ScramStarted {
        client_first_bare: String,
        server_first: String,
        nonce: String,
        salt: Vec<u8>,
    },
    Authenticated,
}

struct Shared {
    settings: Settings,
    state: Mutex<ClusterState>,
    calls: Mutex<Vec<BrokerCall>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ClusterState> {
        lock(&self.state)
    }

    /// Answer one request frame; `None` closes the connection.
    async fn handle(&self, session: &mut SaslState, mut frame: Bytes) -> Option<Bytes> {
        if frame.len() < 8 {
            return None;
        }

        let api_key = i16::from_be_bytes([frame[0], frame[1]]);
        let api_version = i16::from_be_bytes([frame[2], frame[3]]);
        let correlation_id = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

        lock(&self.calls).push(BrokerCall {
            api_key,
            api_version,
            correlation_id,
        });

        let sasl_step = matches!(api_key, api_keys::SASL_HANDSHAKE | api_keys::SASL_AUTHENTICATE);
        let authenticated = self.settings.sasl.is_none() || matches!(session, SaslState::Authenticated);
        if !authenticated && !sasl_step {
            return None;
        }

        let mut delay = self.settings.response_delay;
        if matches!(api_key, api_keys::FETCH | api_keys::LIST_OFFSETS) {
            delay += self.settings.fetch_delay;
        }
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let frame = &mut frame;
        match api_key {
            api_keys::METADATA => respond::<MetadataRequest>(frame, api_version, |r| self.metadata(r)),
            api_keys::PRODUCE => respond::<ProduceRequest>(frame, api_version, |r| self.produce(r)),
            api_keys::FETCH => respond::<FetchRequest>(frame, api_version, |r| self.fetch(r)),
            api_keys::LIST_OFFSETS => {
                respond::<ListOffsetsRequest>(frame, api_version, |r| self.list_offsets(r))
            }
            api_keys::CREATE_TOPICS => {
                respond::<CreateTopicsRequest>(frame, api_version, |r| self.create_topics(r))
            }
            api_keys::SASL_HANDSHAKE => respond::<SaslHandshakeRequest>(frame, api_version, |r| {
                self.sasl_handshake(session, r)
            }),
            api_keys::SASL_AUTHENTICATE => {
                respond::<SaslAuthenticateRequest>(frame, api_version, |r| {
                    self.sasl_authenticate(session, r)
                })
            }
            _ => None,
        }
    }

    fn metadata(&self, request: MetadataRequest) -> MetadataResponse {
        let settings = &self.settings;
        let state = self.state();

        let mut response = MetadataResponse::default();
        for node_id in 0..settings.broker_count {
            let mut broker = MetadataResponseBroker::default();
            broker.node_id = BrokerId(node_id);
            broker.host = StrBytes::from_string(settings.host.clone());
            broker.port = settings.port;
            response.brokers.push(broker);
        }
        response.controller_id = BrokerId(0);

        let names: Vec<String> = match request.topics {
            None => state.topics.keys().cloned().collect(),
            Some(topics) => topics
                .into_iter()
                .filter_map(|t| t.name)
                .map(|name| name.0.to_string())
                .collect(),
        };

        let now = Instant::now();
        for name in names {
            let mut topic = MetadataResponseTopic::default();
            topic.name = Some(topic_name(&name));
            match state.topics.get(&name) {
                None => topic.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION,
                Some(t) if now < t.visible_at => topic.error_code = error_codes::LEADER_NOT_AVAILABLE,
                Some(t) => {
                    for index in 0..t.partitions.len() as i32 {
                        let leader = index % settings.broker_count;
                        let mut partition = MetadataResponsePartition::default();
                        partition.partition_index = index;
                        partition.leader_id = BrokerId(leader);
                        partition.replica_nodes = vec![BrokerId(leader)];
                        partition.isr_nodes = vec![BrokerId(leader)];
                        topic.partitions.push(partition);
                    }
                }
            }
            response.topics.push(topic);
        }
        response
    }

    fn produce(&self, request: ProduceRequest) -> ProduceResponse {
        let mut state = self.state();
        let mut response = ProduceResponse::default();

        for topic_data in request.topic_data {
            let name = topic_data.name.0.to_string();
            let mut topic_response = TopicProduceResponse::default();
            topic_response.name = topic_data.name.clone();

            for partition_data in topic_data.partition_data {
                let mut partition_response = PartitionProduceResponse::default();
                partition_response.index = partition_data.index;
                partition_response.base_offset = -1;
                partition_response.log_append_time_ms = -1;

                if let Some(code) = state.take_produce_failure() {
                    partition_response.error_code = code;
                } else if let Some(log) = state.partition_mut(&name, partition_data.index) {
                    let bytes = partition_data.records.unwrap_or_default();
                    match decode_batches(&bytes, 0) {
                        Ok(records) => {
                            partition_response.base_offset = log.append(records);
                            partition_response.log_start_offset = log.log_start;
                        }
                        Err(_) => partition_response.error_code = error_codes::CORRUPT_MESSAGE,
                    }
                } else {
                    partition_response.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION;
                }
                topic_response.partition_responses.push(partition_response);
            }
            response.responses.push(topic_response);
        }
        response
    }

    fn fetch(&self, request: FetchRequest) -> FetchResponse {
        let state = self.state();
        let mut response = FetchResponse::default();

        for topic in request.topics {
            let name = topic.topic.0.to_string();
            let mut topic_response = FetchableTopicResponse::default();
            topic_response.topic = topic.topic.clone();

            for fetch_partition in topic.partitions {
                let mut data = PartitionData::default();
                data.partition_index = fetch_partition.partition;

                match state.partition(&name, fetch_partition.partition) {
                    None => data.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION,
                    Some(log) => {
                        let offset = fetch_partition.fetch_offset;
                        data.high_watermark = log.log_end();
                        data.last_stable_offset = log.log_end();
                        data.log_start_offset = log.log_start;

                        if offset < log.log_start || offset > log.log_end() {
                            data.error_code = error_codes::OFFSET_OUT_OF_RANGE;
                        } else {
                            let from = (offset - log.log_start) as usize;
                            let pending = &log.records[from..];
                            if let Some(first) = pending.first() {
                                data.records = Some(encode_batch(first.offset, pending));
                            }
                        }
                    }
                }
                topic_response.partitions.push(data);
            }
            response.responses.push(topic_response);
        }
        response
    }

    fn list_offsets(&self, request: ListOffsetsRequest) -> ListOffsetsResponse {
        let state = self.state();
        let mut response = ListOffsetsResponse::default();

        for topic in request.topics {
            let name = topic.name.0.to_string();
            let mut topic_response = ListOffsetsTopicResponse::default();
            topic_response.name = topic.name.clone();

            for partition in topic.partitions {
                let mut partition_response = ListOffsetsPartitionResponse::default();
                partition_response.partition_index = partition.partition_index;
                match state.partition(&name, partition.partition_index) {
                    None => partition_response.error_code = error_codes::UNKNOWN_TOPIC_OR_PARTITION,
                    Some(log) => {
                        partition_response.timestamp = -1;
                        partition_response.offset = if partition.timestamp == -2 {
                            log.log_start
                        } else {
                            log.log_end()
                        };
                    }
                }
                topic_response.partitions.push(partition_response);
            }
            response.topics.push(topic_response);
        }
        response
    }

    fn create_topics(&self, request: CreateTopicsRequest) -> CreateTopicsResponse {
        let settings = &self.settings;
        let mut state = self.state();
        let mut response = CreateTopicsResponse::default();

        for topic in request.topics {
            let name = topic.name.0.to_string();
            let mut result = CreatableTopicResult::default();
            result.name = topic.name.clone();

            if state.topics.contains_key(&name) {
                result.error_code = error_codes::TOPIC_ALREADY_EXISTS;
                result.error_message =
                    Some(StrBytes::from_string(format!("Topic '{name}' already exists.")));
            } else if i32::from(topic.replication_factor) > settings.broker_count {
                result.error_code = error_codes::INVALID_REPLICATION_FACTOR;
            } else if topic.num_partitions < 1 {
                result.error_code = error_codes::INVALID_PARTITIONS;
            } else if !request.validate_only {
                let visible_at = Instant::now() + settings.propagation_delay;
                state
                    .topics
                    .insert(name, TopicState::new(topic.num_partitions, 0, visible_at));
            }
            response.topics.push(result);
        }
        response
    }

    fn sasl_handshake(
        &self,
        session: &mut SaslState,
        request: SaslHandshakeRequest,
    ) -> SaslHandshakeResponse {
        let mut response = SaslHandshakeResponse::default();
        let Some(user) = &self.settings.sasl else {
            response.error_code = error_codes::UNSUPPORTED_SASL_MECHANISM;
            return response;
        };

        let mechanism = user.mechanism.mechanism_name();
        response.mechanisms = vec![StrBytes::from_static_str(mechanism)];
        if request.mechanism.as_str() == mechanism {
            *session = SaslState::Handshaked;
        } else {
            response.error_code = error_codes::UNSUPPORTED_SASL_MECHANISM;
        }
        response
    }

    fn sasl_authenticate(
        &self,
        session: &mut SaslState,
        request: SaslAuthenticateRequest,
    ) -> SaslAuthenticateResponse {
        let mut response = SaslAuthenticateResponse::default();
        let Some(user) = &self.settings.sasl else {
            response.error_code = error_codes::ILLEGAL_SASL_STATE;
            return response;
        };

        let outcome = match user.mechanism {
            SaslMechanism::Plain => plain_exchange(user, session, &request.auth_bytes),
            SaslMechanism::ScramSha256 => {
                scram_exchange::<ScramSha256>(user, session, &request.auth_bytes)
            }
            SaslMechanism::ScramSha512 => {
                scram_exchange::<ScramSha512>(user, session, &request.auth_bytes)
            }
        };

        match outcome {
            Ok(auth_bytes) => response.auth_bytes = auth_bytes,
            Err(message) => {
                *session = SaslState::Pending;
                response.error_code = error_codes::SASL_AUTHENTICATION_FAILED;
                response.error_message = Some(StrBytes::from_string(message));
            }
        }
        response
    }
}

/// `[authzid] \0 username \0 password`
fn plain_exchange(user: &SaslUser, session: &mut SaslState, auth_bytes: &[u8]) -> Result<Bytes, String> {
    if !matches!(session, SaslState::Handshaked) {
        return Err("unexpected SASL/PLAIN message".to_string());
    }
    let mut parts = auth_bytes.split(|b| *b == 0).skip(1);
    let username = parts.next().unwrap_or_default();
    let password = parts.next().unwrap_or_default();
    if username == user.username.as_bytes() && password == user.password.as_bytes() {
        *session = SaslState::Authenticated;
        Ok(Bytes::new())
    } else {
        Err("Invalid username or password".to_string())
    }
}

fn scram_exchange<H: ScramHash>(
    user: &SaslUser,
    session: &mut SaslState,
    auth_bytes: &[u8],
) -> Result<Bytes, String> {
    let message = std::str::from_utf8(auth_bytes).map_err(|_| "invalid UTF-8".to_string())?;

    match std::mem::take(session) {
        SaslState::Handshaked => {
            let client_first_bare = message
                .strip_prefix("n,,")
                .ok_or_else(|| "unsupported GS2 header".to_string())?;
            let username = attribute(client_first_bare, "n=").unwrap_or_default();
            let client_nonce = attribute(client_first_bare, "r=").unwrap_or_default();
            if username != user.username || client_nonce.is_empty() {
                return Err("Authentication failed".to_string());
            }

            let server_nonce: [u8; 18] = rand::thread_rng().gen();
            let nonce = format!("{client_nonce}{}", BASE64.encode(server_nonce));
            let salt: [u8; 16] = rand::thread_rng().gen();
            let server_first = format!("r={nonce},s={},i={MIN_ITERATIONS}", BASE64.encode(salt));

            *session = SaslState::ScramStarted {
                client_first_bare: client_first_bare.to_string(),
                server_first: server_first.clone(),
                nonce,
                salt: salt.to_vec(),
            };
            Ok(Bytes::from(server_first))
        }
        SaslState::ScramStarted {
            client_first_bare,
            server_first,
            nonce,
            salt,
        } => {
            let (without_proof, proof) = message
                .rsplit_once(",p=")
                .ok_or_else(|| "missing client proof".to_string())?;
            if attribute(without_proof, "r=") != Some(nonce.as_str()) {
                return Err("nonce mismatch".to_string());
            }
            let proof = BASE64.decode(proof).map_err(|_| "invalid proof".to_string())?;

            let keys = ScramKeys::derive::<H>(&user.password, &salt, MIN_ITERATIONS);
            let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
            let client_signature = H::hmac(&keys.stored_key, auth_message.as_bytes());
            let client_key: Vec<u8> = proof
                .iter()
                .zip(client_signature.iter())
                .map(|(a, b)| a ^ b)
                .collect();
            if H::hash(&client_key) != keys.stored_key {
                return Err("Authentication failed during authentication due to invalid credentials".to_string());
            }

            let server_signature = H::hmac(&keys.server_key, auth_message.as_bytes());
            *session = SaslState::Authenticated;
            Ok(Bytes::from(format!("v={}", BASE64.encode(server_signature))))
        }
        _ => Err("unexpected SCRAM message".to_string()),
    }
}

fn attribute<'a>(message: &'a str, prefix: &str) -> Option<&'a str> {
    message.split(',').find_map(|part| part.strip_prefix(prefix))
}

/// Decode a request of type `R`, run `handler` and encode its response.
fn respond<R: Request>(
    frame: &mut Bytes,
    api_version: i16,
    handler: impl FnOnce(R) -> R::Response,
) -> Option<Bytes> {
    let header = RequestHeader::decode(frame, R::header_version(api_version)).ok()?;
    let request = R::decode(frame, api_version).ok()?;
    let response = handler(request);

    let mut response_header = ResponseHeader::default();
    response_header.correlation_id = header.correlation_id;

    let mut buf = BytesMut::new();
    response_header
        .encode(&mut buf, R::Response::header_version(api_version))
        .ok()?;
    response.encode(&mut buf, api_version).ok()?;
    Some(buf.freeze())
}

/// Handle a single client connection.
async fn serve<S>(mut stream: S, shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = SaslState::default();
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = read_frame(&mut stream) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) | Err(_) => break,
            },
        };

        let Some(response) = shared.handle(&mut session, frame).await else {
            break;
        };
        if write_frame(&mut stream, &response).await.is_err() {
            break;
        }
    }
}

/// Read a Kafka frame (4-byte length prefix + body).
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes is too large"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Write a Kafka frame (4-byte length prefix + body).
async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(4 + data.len());
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
    stream.write_all(&buf).await?;
    stream.flush().await
}

fn tls_acceptor() -> io::Result<TlsAcceptor> {
    crate::security::tls::ensure_crypto_provider();

    let certs = rustls_pemfile::certs(&mut BufReader::new(TEST_CERT.as_bytes()))
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(TEST_KEY.as_bytes()))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(io::Error::other)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn topic_name(name: &str) -> TopicName {
    TopicName(StrBytes::from_string(name.to_string()))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
