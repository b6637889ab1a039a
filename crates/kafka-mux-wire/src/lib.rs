//! Kafka v0 wire protocol codec for `kafka-mux`.
//!
//! Speaks the four request/response pairs the runtime needs (Metadata,
//! Fetch, Produce, Offsets) over the standard
//! `{size: i32, correlation_id: i32, body}` framing, plus the v0 message-set
//! format with per-record CRC32 checks.
//!
//! Features:
//!
//! - Single-write request serialization: frames are staged in memory and
//!   pushed with one `write_all` per RPC
//! - Streaming fetch decode: partition headers are read incrementally and
//!   message-set bytes land directly in caller-provided buffers
//! - Both directions of every message, so an in-process broker can be built
//!   from the same types the client uses

pub mod codes;
pub mod error;
pub mod frame;
pub mod message;
pub mod request;
pub mod response;

pub use codes::{ApiKey, Compression, KafkaCode};
pub use error::{Result, WireError};
pub use frame::{FrameReader, FrameWriter, RequestHeader};
pub use message::{MessageSetParser, MessageSetWriter, RawRecord};
pub use request::{
    FetchPartition, FetchRequest, FetchTopic, MetadataRequest, OffsetPartition, OffsetRequest,
    OffsetTopic, ProducePartition, ProduceRequest, ProduceTopic, OFFSET_EARLIEST, OFFSET_LATEST,
};
pub use response::{
    BrokerMeta, FetchPartitionHeader, FetchResponse, FetchResponsePartition, FetchResponseTopic,
    MetadataResponse, OffsetPartitionResponse, OffsetResponse, OffsetTopicResponse, PartitionMeta,
    ProducePartitionAck, ProduceResponse, ProduceTopicResponse, TopicMeta,
};
