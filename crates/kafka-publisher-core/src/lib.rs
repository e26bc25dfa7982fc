//! Kafka Message Publisher Core Library
//!
//! The engine behind a small Kafka publishing tool: it persists a broker
//! configuration, opens short-lived authenticated connections, and runs the
//! six boundary commands (get/save config, test connection, send, consume,
//! create topic) as bounded protocol exchanges.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Broker configuration, validation and atomic persistence
//! - [`security`] - TLS connectors and SASL/PLAIN and SASL/SCRAM material
//! - [`broker`] - Single broker sockets, request framing and SASL exchange
//! - [`connection`] - Bootstrap, metadata discovery and leader sockets
//! - [`protocol`] - Record batch codec, partitioner, API versions, error codes
//! - [`producer`], [`consumer`], [`admin`] - The data and admin operations
//! - [`dispatcher`] - The command entry point returning [`CommandResult`]
//! - [`error`] - Domain-specific error types
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_publisher_core::{CommandDispatcher, ConfigStore};
//!
//! let dispatcher = CommandDispatcher::new(ConfigStore::default_location()?);
//! let sent = dispatcher.send_message("hello").await;
//! println!("{}", serde_json::to_string(&sent)?);
//! ```

#![forbid(unsafe_code)]

pub mod admin;
pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod producer;
pub mod protocol;
pub mod security;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use admin::{AdminClient, TopicCreateResult};
pub use config::{BrokerConfig, ConfigStore, SaslMechanism, SecurityProtocol};
pub use connection::{Connection, ConnectionManager};
pub use consumer::{ConsumedMessage, Consumer};
pub use dispatcher::{CommandDispatcher, CommandResult, ConnectionTest, ConnectionTestState};
pub use error::{
    AdminError, CertificateError, ConfigError, ConnectError, ConsumeError, EngineError,
    ProduceError,
};
pub use producer::{ProducedRecord, Producer, SendResult};
pub use security::{SecurityContext, SecurityMaterial};
