//! Runtime error types.
//!
//! Errors are `Clone` on purpose: broker-side failures are injected into the
//! worker that owns the affected partition queue and surfaced on its next
//! user-visible call, which may happen more than once. I/O failures are
//! flattened to their message at the boundary; the structured variants carry
//! what a caller can act on.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("topic {0} not present in cluster metadata")]
    UnknownTopic(String),

    #[error("partition {partition} of topic {topic} not present in cluster metadata")]
    Metadata { topic: String, partition: i32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Crc { stored: u32, computed: u32 },

    #[error("leader election for {topic}/{partition} timed out")]
    LeaderElectionTimeout { topic: String, partition: i32 },

    #[error("offset out of range for {topic}/{partition}")]
    OffsetOutOfRange { topic: String, partition: i32 },

    #[error("message set of {size} bytes exceeds the {max} byte buffer limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("a {role} for {topic}/{partition} is already registered on this client")]
    DuplicateWorker {
        role: &'static str,
        topic: String,
        partition: i32,
    },

    #[error("worker detached from its client")]
    Detached,

    #[error("client shut down")]
    Shutdown,
}

impl From<kafka_mux_wire::WireError> for Error {
    fn from(err: kafka_mux_wire::WireError) -> Self {
        use kafka_mux_wire::WireError;
        match err {
            WireError::Io(e) => Error::Connection(e.to_string()),
            WireError::Crc { stored, computed } => Error::Crc { stored, computed },
            WireError::Malformed(msg) => Error::Protocol(msg),
            WireError::Overrun { needed, remaining } => Error::Protocol(format!(
                "frame overrun: needed {needed} bytes, {remaining} left"
            )),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(err.to_string())
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
