//! Protocol constants: API keys, broker error codes, compression attributes.

/// Request kinds of the v0 protocol surface this codec speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKey {
    Produce,
    Fetch,
    Offsets,
    Metadata,
}

impl ApiKey {
    pub fn as_i16(self) -> i16 {
        match self {
            ApiKey::Produce => 0,
            ApiKey::Fetch => 1,
            ApiKey::Offsets => 2,
            ApiKey::Metadata => 3,
        }
    }

    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            0 => Some(ApiKey::Produce),
            1 => Some(ApiKey::Fetch),
            2 => Some(ApiKey::Offsets),
            3 => Some(ApiKey::Metadata),
            _ => None,
        }
    }
}

/// Numeric error codes reported by the broker per partition.
///
/// See the Kafka protocol error table. Codes the runtime does not have a
/// dedicated reaction for are preserved in `Other` rather than dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KafkaCode {
    None,
    /// The server experienced an unexpected error when processing the request.
    Unknown,
    /// The requested offset is outside the range maintained by the broker
    /// for the given topic/partition.
    OffsetOutOfRange,
    /// A message's contents does not match its CRC.
    CorruptMessage,
    /// The topic or partition does not exist on this broker.
    UnknownTopicOrPartition,
    /// A leadership election is in progress and the partition has no leader.
    LeaderNotAvailable,
    /// The request was sent to a broker that is no longer the leader.
    NotLeaderForPartition,
    /// The request exceeded the user-specified time limit.
    RequestTimedOut,
    /// The server rejected a message larger than its configured maximum.
    MessageSizeTooLarge,
    Other(i16),
}

impl KafkaCode {
    pub fn from_i16(raw: i16) -> Self {
        match raw {
            0 => KafkaCode::None,
            -1 => KafkaCode::Unknown,
            1 => KafkaCode::OffsetOutOfRange,
            2 => KafkaCode::CorruptMessage,
            3 => KafkaCode::UnknownTopicOrPartition,
            5 => KafkaCode::LeaderNotAvailable,
            6 => KafkaCode::NotLeaderForPartition,
            7 => KafkaCode::RequestTimedOut,
            10 => KafkaCode::MessageSizeTooLarge,
            other => KafkaCode::Other(other),
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            KafkaCode::None => 0,
            KafkaCode::Unknown => -1,
            KafkaCode::OffsetOutOfRange => 1,
            KafkaCode::CorruptMessage => 2,
            KafkaCode::UnknownTopicOrPartition => 3,
            KafkaCode::LeaderNotAvailable => 5,
            KafkaCode::NotLeaderForPartition => 6,
            KafkaCode::RequestTimedOut => 7,
            KafkaCode::MessageSizeTooLarge => 10,
            KafkaCode::Other(raw) => raw,
        }
    }

    /// True for the codes that mean the partition moved to another broker
    /// and the request should be retried after a metadata refresh.
    pub fn is_leader_change(self) -> bool {
        matches!(
            self,
            KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
        )
    }
}

/// Compression codec carried in the low bits of a message's attributes byte.
///
/// The codec payloads themselves are produced and consumed by external
/// compressors; this crate only stamps and reads the attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Snappy,
}

impl Compression {
    pub fn attribute_bits(self) -> i8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
        }
    }
}
