//! Test utilities for the publisher engine.
//!
//! - [`MockBroker`] - an in-process Kafka broker with in-memory topic logs
//! - [`certs`] - a self-signed certificate and key for TLS tests
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_publisher_core::testing::MockBroker;
//!
//! #[tokio::test]
//! async fn test_produce() {
//!     let broker = MockBroker::builder().topic("orders", 3).start().await.unwrap();
//!     // point a BrokerConfig at broker.address() ...
//!     assert_eq!(broker.records("orders", 0).len(), 1);
//! }
//! ```

pub mod certs;
pub mod mock_broker;

pub use mock_broker::{api_keys, BrokerCall, MockBroker, MockBrokerBuilder};
