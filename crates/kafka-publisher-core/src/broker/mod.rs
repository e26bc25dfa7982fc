//! Broker sockets.
//!
//! This module provides:
//! - Plain TCP and TLS transports behind one stream type
//! - Request framing and correlation id checks
//! - SASL/PLAIN and SASL/SCRAM authentication

pub mod connection;
pub mod stream;

pub use connection::BrokerConnection;
pub use stream::BrokerStream;
