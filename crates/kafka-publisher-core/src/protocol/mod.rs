//! Kafka wire protocol pieces shared by the client components.
//!
//! Message structs come from `kafka-protocol`; this module pins the API versions
//! we speak, names the error codes we react to, and provides the record batch
//! codec and key partitioner.

pub mod partitioner;
pub mod records;

/// API versions used for every request we send.
pub mod versions {
    pub const SASL_HANDSHAKE: i16 = 1;
    pub const SASL_AUTHENTICATE: i16 = 2;
    pub const METADATA: i16 = 8;
    pub const PRODUCE: i16 = 8;
    pub const FETCH: i16 = 11;
    pub const LIST_OFFSETS: i16 = 5;
    pub const CREATE_TOPICS: i16 = 4;
}

/// Broker error codes the client handles explicitly.
pub mod error_codes {
    pub const NONE: i16 = 0;
    pub const OFFSET_OUT_OF_RANGE: i16 = 1;
    pub const CORRUPT_MESSAGE: i16 = 2;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const MESSAGE_TOO_LARGE: i16 = 10;
    pub const TOPIC_AUTHORIZATION_FAILED: i16 = 29;
    pub const UNSUPPORTED_SASL_MECHANISM: i16 = 33;
    pub const ILLEGAL_SASL_STATE: i16 = 34;
    pub const TOPIC_ALREADY_EXISTS: i16 = 36;
    pub const INVALID_PARTITIONS: i16 = 37;
    pub const INVALID_REPLICATION_FACTOR: i16 = 38;
    pub const NOT_CONTROLLER: i16 = 41;
    pub const SASL_AUTHENTICATION_FAILED: i16 = 58;

    /// Kafka's name for an error code, for log lines and messages.
    #[must_use]
    pub fn name(code: i16) -> &'static str {
        match code {
            NONE => "NONE",
            OFFSET_OUT_OF_RANGE => "OFFSET_OUT_OF_RANGE",
            CORRUPT_MESSAGE => "CORRUPT_MESSAGE",
            UNKNOWN_TOPIC_OR_PARTITION => "UNKNOWN_TOPIC_OR_PARTITION",
            LEADER_NOT_AVAILABLE => "LEADER_NOT_AVAILABLE",
            NOT_LEADER_OR_FOLLOWER => "NOT_LEADER_OR_FOLLOWER",
            REQUEST_TIMED_OUT => "REQUEST_TIMED_OUT",
            MESSAGE_TOO_LARGE => "MESSAGE_TOO_LARGE",
            TOPIC_AUTHORIZATION_FAILED => "TOPIC_AUTHORIZATION_FAILED",
            UNSUPPORTED_SASL_MECHANISM => "UNSUPPORTED_SASL_MECHANISM",
            ILLEGAL_SASL_STATE => "ILLEGAL_SASL_STATE",
            TOPIC_ALREADY_EXISTS => "TOPIC_ALREADY_EXISTS",
            INVALID_PARTITIONS => "INVALID_PARTITIONS",
            INVALID_REPLICATION_FACTOR => "INVALID_REPLICATION_FACTOR",
            NOT_CONTROLLER => "NOT_CONTROLLER",
            SASL_AUTHENTICATION_FAILED => "SASL_AUTHENTICATION_FAILED",
            _ => "UNKNOWN_SERVER_ERROR",
        }
    }

    /// Codes that mean the partition leader moved or is being elected.
    #[must_use]
    pub fn is_stale_leader(code: i16) -> bool {
        matches!(code, LEADER_NOT_AVAILABLE | NOT_LEADER_OR_FOLLOWER)
    }
}

#[cfg(test)]
mod tests {
    use super::error_codes;

    #[test]
    fn test_error_code_names() {
        assert_eq!(error_codes::name(36), "TOPIC_ALREADY_EXISTS");
        assert_eq!(error_codes::name(58), "SASL_AUTHENTICATION_FAILED");
        assert_eq!(error_codes::name(-1), "UNKNOWN_SERVER_ERROR");
    }

    #[test]
    fn test_stale_leader_codes() {
        assert!(error_codes::is_stale_leader(5));
        assert!(error_codes::is_stale_leader(6));
        assert!(!error_codes::is_stale_leader(3));
    }
}
