//! Client configuration.

use std::time::Duration;

use kafka_mux_wire::Compression;

use crate::error::{Error, Result};

/// Configuration for a [`Client`](crate::Client) and the workers created
/// from it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size in bytes of each queue buffer, and therefore the largest message
    /// set one fetch response partition may carry.
    pub consumer_max_bytes: usize,

    /// Buffers preallocated per partition queue. Must be at least 2 so one
    /// buffer can be parsed while another is being filled.
    pub consumer_queue_buffers: usize,

    /// Compression codec stamped into produced message attributes.
    ///
    /// Must be set explicitly before creating a producer; the payload is
    /// expected to already be encoded by the matching codec. Consumers do
    /// not use this.
    pub producer_compression: Option<Compression>,

    /// Ready partitions the fetcher waits for before sending a bundled
    /// fetch request.
    pub fetcher_bundle_min_requests: usize,

    /// Longest the fetcher delays a bundle that has at least one ready
    /// partition but fewer than `fetcher_bundle_min_requests`.
    pub fetcher_bundle_max_wait: Duration,

    /// Ready partitions the pusher waits for before sending a bundled
    /// produce request.
    pub pusher_bundle_min_requests: usize,

    /// Longest the pusher delays an under-filled produce bundle.
    pub pusher_bundle_max_wait: Duration,

    /// Sweeps over the bootstrap brokers before a metadata refresh fails.
    /// 0 retries forever.
    pub metadata_refresh_retry_count: u32,

    /// Pause between metadata refresh sweeps.
    pub metadata_refresh_retry_timeout: Duration,

    /// Metadata refreshes waited on a partition with no elected leader
    /// before the worker is failed. 0 retries forever.
    pub leader_election_retry_count: u32,

    /// Pause between leader election checks.
    pub leader_election_retry_timeout: Duration,

    /// Initial capacity of the per-connection request staging buffer.
    pub serializer_chunk_size: usize,

    /// Capacity of the per-connection read buffer.
    pub deserializer_chunk_size: usize,

    /// Broker-side long-poll budget stamped into fetch requests; the broker
    /// parks an empty fetch this long waiting for data.
    pub fetch_max_wait: Duration,

    /// Minimum response bytes the broker accumulates before answering a
    /// fetch early.
    pub fetch_min_bytes: usize,

    /// Acknowledgement level for produce requests (1 = leader ack).
    pub required_acks: i16,

    /// Broker-side timeout stamped into produce requests.
    pub produce_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consumer_max_bytes: 1 << 20,
            consumer_queue_buffers: 4,
            producer_compression: None,
            fetcher_bundle_min_requests: 4,
            fetcher_bundle_max_wait: Duration::from_millis(100),
            pusher_bundle_min_requests: 4,
            pusher_bundle_max_wait: Duration::from_millis(100),
            metadata_refresh_retry_count: 3,
            metadata_refresh_retry_timeout: Duration::from_secs(1),
            leader_election_retry_count: 10,
            leader_election_retry_timeout: Duration::from_millis(500),
            serializer_chunk_size: 16 * 1024,
            deserializer_chunk_size: 64 * 1024,
            fetch_max_wait: Duration::from_millis(250),
            fetch_min_bytes: 1,
            required_acks: 1,
            produce_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Checked at client construction; producer-only fields are checked
    /// when a producer is created.
    pub fn validate(&self) -> Result<()> {
        if self.consumer_queue_buffers < 2 {
            return Err(Error::InvalidConfig(format!(
                "consumer_queue_buffers must be at least 2, got {}",
                self.consumer_queue_buffers
            )));
        }
        if self.consumer_max_bytes < kafka_mux_wire::message::RECORD_HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "consumer_max_bytes of {} cannot hold a record header",
                self.consumer_max_bytes
            )));
        }
        if self.fetcher_bundle_min_requests == 0 || self.pusher_bundle_min_requests == 0 {
            return Err(Error::InvalidConfig(
                "bundle_min_requests must be at least 1".into(),
            ));
        }
        if self.serializer_chunk_size == 0 || self.deserializer_chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk sizes must be non-zero".into()));
        }
        if self.required_acks == 0 {
            // acks=0 elicits no broker response, which would desync the
            // in-flight request log
            return Err(Error::InvalidConfig(
                "required_acks of 0 is not supported".into(),
            ));
        }
        Ok(())
    }
}
