//! v0 request bodies: encode on the client side, decode on the broker side
//! (the decode half exists for test brokers and protocol tooling).

use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codes::ApiKey;
use crate::error::Result;
use crate::frame::{FrameReader, FrameWriter};

/// Follower id stamped into fetch/offset requests sent by ordinary clients.
pub const CONSUMER_REPLICA_ID: i32 = -1;

/// Offset sentinel meaning "the next offset the broker would assign".
pub const OFFSET_LATEST: i64 = -1;
/// Offset sentinel meaning "the oldest offset still retained".
pub const OFFSET_EARLIEST: i64 = -2;

#[derive(Debug, Clone, Default)]
pub struct MetadataRequest {
    /// Empty means "all topics".
    pub topics: Vec<String>,
}

impl MetadataRequest {
    pub fn encode<W: AsyncWrite + Unpin>(
        &self,
        w: &mut FrameWriter<W>,
        correlation_id: i32,
        client_id: &str,
    ) {
        w.begin_request(ApiKey::Metadata, correlation_id, client_id);
        w.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            w.put_string(topic);
        }
    }

    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        let count = r.read_i32().await?;
        let mut topics = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            topics.push(r.read_string().await?);
        }
        Ok(Self { topics })
    }
}

#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition: i32,
    pub offset: i64,
    pub max_bytes: i32,
}

#[derive(Debug, Clone)]
pub struct FetchTopic {
    pub name: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub topics: Vec<FetchTopic>,
}

impl FetchRequest {
    pub fn encode<W: AsyncWrite + Unpin>(
        &self,
        w: &mut FrameWriter<W>,
        correlation_id: i32,
        client_id: &str,
    ) {
        w.begin_request(ApiKey::Fetch, correlation_id, client_id);
        w.put_i32(CONSUMER_REPLICA_ID);
        w.put_i32(self.max_wait_ms);
        w.put_i32(self.min_bytes);
        w.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            w.put_string(&topic.name);
            w.put_i32(topic.partitions.len() as i32);
            for p in &topic.partitions {
                w.put_i32(p.partition);
                w.put_i64(p.offset);
                w.put_i32(p.max_bytes);
            }
        }
    }

    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        let _replica_id = r.read_i32().await?;
        let max_wait_ms = r.read_i32().await?;
        let min_bytes = r.read_i32().await?;
        let topic_count = r.read_i32().await?;
        let mut topics = Vec::with_capacity(topic_count.max(0) as usize);
        for _ in 0..topic_count {
            let name = r.read_string().await?;
            let partition_count = r.read_i32().await?;
            let mut partitions = Vec::with_capacity(partition_count.max(0) as usize);
            for _ in 0..partition_count {
                partitions.push(FetchPartition {
                    partition: r.read_i32().await?,
                    offset: r.read_i64().await?,
                    max_bytes: r.read_i32().await?,
                });
            }
            topics.push(FetchTopic { name, partitions });
        }
        Ok(Self {
            max_wait_ms,
            min_bytes,
            topics,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OffsetPartition {
    pub partition: i32,
    /// `OFFSET_LATEST`, `OFFSET_EARLIEST`, or a timestamp in milliseconds.
    pub time: i64,
    pub max_offsets: i32,
}

#[derive(Debug, Clone)]
pub struct OffsetTopic {
    pub name: String,
    pub partitions: Vec<OffsetPartition>,
}

#[derive(Debug, Clone)]
pub struct OffsetRequest {
    pub topics: Vec<OffsetTopic>,
}

impl OffsetRequest {
    pub fn encode<W: AsyncWrite + Unpin>(
        &self,
        w: &mut FrameWriter<W>,
        correlation_id: i32,
        client_id: &str,
    ) {
        w.begin_request(ApiKey::Offsets, correlation_id, client_id);
        w.put_i32(CONSUMER_REPLICA_ID);
        w.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            w.put_string(&topic.name);
            w.put_i32(topic.partitions.len() as i32);
            for p in &topic.partitions {
                w.put_i32(p.partition);
                w.put_i64(p.time);
                w.put_i32(p.max_offsets);
            }
        }
    }

    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        let _replica_id = r.read_i32().await?;
        let topic_count = r.read_i32().await?;
        let mut topics = Vec::with_capacity(topic_count.max(0) as usize);
        for _ in 0..topic_count {
            let name = r.read_string().await?;
            let partition_count = r.read_i32().await?;
            let mut partitions = Vec::with_capacity(partition_count.max(0) as usize);
            for _ in 0..partition_count {
                partitions.push(OffsetPartition {
                    partition: r.read_i32().await?,
                    time: r.read_i64().await?,
                    max_offsets: r.read_i32().await?,
                });
            }
            topics.push(OffsetTopic { name, partitions });
        }
        Ok(Self { topics })
    }
}

#[derive(Debug, Clone)]
pub struct ProducePartition<'a> {
    pub partition: i32,
    pub message_set: Cow<'a, [u8]>,
}

#[derive(Debug, Clone)]
pub struct ProduceTopic<'a> {
    pub name: Cow<'a, str>,
    pub partitions: Vec<ProducePartition<'a>>,
}

#[derive(Debug, Clone)]
pub struct ProduceRequest<'a> {
    pub required_acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopic<'a>>,
}

impl<'a> ProduceRequest<'a> {
    pub fn encode<W: AsyncWrite + Unpin>(
        &self,
        w: &mut FrameWriter<W>,
        correlation_id: i32,
        client_id: &str,
    ) {
        w.begin_request(ApiKey::Produce, correlation_id, client_id);
        w.put_i16(self.required_acks);
        w.put_i32(self.timeout_ms);
        w.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            w.put_string(&topic.name);
            w.put_i32(topic.partitions.len() as i32);
            for p in &topic.partitions {
                w.put_i32(p.partition);
                w.put_i32(p.message_set.len() as i32);
                w.put_raw(&p.message_set);
            }
        }
    }
}

impl ProduceRequest<'static> {
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        let required_acks = r.read_i16().await?;
        let timeout_ms = r.read_i32().await?;
        let topic_count = r.read_i32().await?;
        let mut topics = Vec::with_capacity(topic_count.max(0) as usize);
        for _ in 0..topic_count {
            let name = r.read_string().await?;
            let partition_count = r.read_i32().await?;
            let mut partitions = Vec::with_capacity(partition_count.max(0) as usize);
            for _ in 0..partition_count {
                let partition = r.read_i32().await?;
                let set_size = r.read_i32().await?;
                let mut message_set = vec![0u8; set_size.max(0) as usize];
                r.read_exact_into(&mut message_set).await?;
                partitions.push(ProducePartition {
                    partition,
                    message_set: Cow::Owned(message_set),
                });
            }
            topics.push(ProduceTopic {
                name: Cow::Owned(name),
                partitions,
            });
        }
        Ok(Self {
            required_acks,
            timeout_ms,
            topics,
        })
    }
}
