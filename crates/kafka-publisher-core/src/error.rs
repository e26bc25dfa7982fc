//! Domain error types for the publisher engine.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Every component has its own error enum; [`EngineError`] gathers them so the
//! command dispatcher can turn any failure into a human-readable message.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::error_codes;
use crate::protocol::records::RecordError;

/// Errors related to loading, validating and persisting configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field failed validation. Nothing was written to disk.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The platform has no configuration directory.
    #[error("could not find a configuration directory for this platform")]
    NoConfigDir,

    /// Reading or writing the configuration file failed.
    #[error("failed to access config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Name of the offending field for validation failures.
    #[must_use]
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::Invalid { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Errors raised while loading TLS material.
#[derive(Error, Debug)]
pub enum CertificateError {
    /// The file could not be opened or read.
    #[error("cannot read '{path}': {message}")]
    Unreadable { path: String, message: String },

    /// The file was read but holds no usable certificate or key.
    #[error("malformed '{path}': {message}")]
    Malformed { path: String, message: String },
}

/// Errors raised while opening or using a broker connection.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// A step did not finish within the remaining budget.
    #[error("timed out after {}ms while {step}", .after.as_millis())]
    Timeout { step: &'static str, after: Duration },

    /// The broker refused the connection or could not be reached.
    #[error("broker {broker} unreachable: {message}")]
    Refused { broker: String, message: String },

    /// The SASL handshake or credentials were rejected.
    #[error("authentication with {broker} failed: {message}")]
    AuthFailed { broker: String, message: String },

    /// The TLS handshake or certificate validation failed.
    #[error("TLS handshake with {broker} failed: {message}")]
    TlsError { broker: String, message: String },

    /// Security material could not be built for this attempt.
    #[error(transparent)]
    Certificate(#[from] CertificateError),

    /// The connection broke after it was established.
    #[error("connection to {broker} lost: {source}")]
    Io {
        broker: String,
        #[source]
        source: std::io::Error,
    },

    /// The broker sent something we could not understand.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The caller stopped waiting for the result.
    #[error("operation cancelled")]
    Cancelled,
}

impl ConnectError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether this failure is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised while producing a record.
#[derive(Error, Debug)]
pub enum ProduceError {
    /// The partition has no leader, or the leader moved; metadata was stale.
    #[error("no leader available for {topic}-{partition}")]
    LeaderNotAvailable { topic: String, partition: i32 },

    /// The topic does not exist on the cluster.
    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    /// The broker refused the record.
    #[error("broker rejected record for {topic}-{partition}: {}", describe(*.code, .message))]
    Rejected {
        topic: String,
        partition: i32,
        code: i16,
        message: Option<String>,
    },

    /// The underlying connection failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Errors raised while fetching records.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// Metadata has no entry for the topic.
    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    /// The requested offset precedes the log's retained start.
    #[error("offset {offset} is before the log start {log_start_offset} of partition {partition}")]
    OffsetOutOfRange {
        partition: i32,
        offset: i64,
        log_start_offset: i64,
    },

    /// The fetch ceiling elapsed before any data arrived.
    #[error("no fetch response within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The broker answered a fetch or offset lookup with an error.
    #[error("broker rejected fetch for partition {partition}: {}", describe(*.code, &None))]
    Rejected { partition: i32, code: i16 },

    /// A returned record batch could not be decoded.
    #[error("corrupt record batch: {0}")]
    Corrupt(#[from] RecordError),

    /// The underlying connection failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Errors raised by topic administration.
#[derive(Error, Debug)]
pub enum AdminError {
    /// A topic with this name already exists.
    #[error("topic '{0}' already exists")]
    AlreadyExists(String),

    /// The replication factor exceeds the number of brokers.
    #[error("replication factor {requested} exceeds the {available} available broker(s)")]
    InvalidReplication { requested: i16, available: usize },

    /// The request arguments are unusable.
    #[error("invalid topic request: {0}")]
    InvalidRequest(String),

    /// The topic did not appear in metadata in time.
    #[error("topic '{topic}' not visible after {}ms", .after.as_millis())]
    Timeout { topic: String, after: Duration },

    /// The controller refused the request for another reason.
    #[error("controller rejected topic '{topic}': {}", describe(*.code, .message))]
    Rejected {
        topic: String,
        code: i16,
        message: Option<String>,
    },

    /// The underlying connection failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Any failure a boundary command can run into.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("send failed: {0}")]
    Produce(#[from] ProduceError),

    #[error("consume failed: {0}")]
    Consume(#[from] ConsumeError),

    #[error("topic creation failed: {0}")]
    Admin(#[from] AdminError),

    /// The outer ceiling of a command elapsed.
    #[error("{command} timed out after {} seconds", .after.as_secs())]
    Timeout {
        command: &'static str,
        after: Duration,
    },
}

impl EngineError {
    /// Whether the failure was caused by a timeout at any layer.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Connect(e)
            | Self::Produce(ProduceError::Connect(e))
            | Self::Consume(ConsumeError::Connect(e))
            | Self::Admin(AdminError::Connect(e)) => e.is_timeout(),
            Self::Consume(ConsumeError::Timeout(_)) | Self::Admin(AdminError::Timeout { .. }) => {
                true
            }
            _ => false,
        }
    }
}

fn describe(code: i16, message: &Option<String>) -> String {
    match message {
        Some(message) if !message.is_empty() => {
            format!("{} ({code}): {message}", error_codes::name(code))
        }
        _ => format!("{} ({code})", error_codes::name(code)),
    }
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for connection operations.
pub type ConnectResult<T> = std::result::Result<T, ConnectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_field() {
        let err = ConfigError::invalid("sasl_username", "required for SASL_SSL");
        assert_eq!(err.field(), Some("sasl_username"));
        assert!(err.to_string().contains("sasl_username"));
    }

    #[test]
    fn test_rejected_produce_describes_code() {
        let err = ProduceError::Rejected {
            topic: "orders".to_string(),
            partition: 0,
            code: 10,
            message: None,
        };
        let text = err.to_string();
        assert!(text.contains("MESSAGE_TOO_LARGE"));
        assert!(text.contains("orders-0"));
    }

    #[test]
    fn test_engine_error_categories() {
        let err: EngineError = ConnectError::Timeout {
            step: "connecting",
            after: Duration::from_secs(3),
        }
        .into();
        assert!(err.is_timeout());
        assert!(err.to_string().starts_with("connection failed"));

        let err: EngineError = ConfigError::invalid("broker", "must not be empty").into();
        assert!(!err.is_timeout());
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn test_nested_timeout_detection() {
        let err: EngineError = ProduceError::Connect(ConnectError::Timeout {
            step: "reading response",
            after: Duration::from_millis(10),
        })
        .into();
        assert!(err.is_timeout());
    }
}
