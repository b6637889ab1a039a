//! v0 response bodies: decode on the client side, encode on the broker side.
//!
//! Metadata, offset and produce responses are small and decoded wholesale.
//! Fetch responses are the exception: their payload dwarfs everything else,
//! so the client walks them header by header with [`FetchPartitionHeader`]
//! and copies each message set straight into a preallocated buffer.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codes::KafkaCode;
use crate::error::Result;
use crate::frame::{FrameReader, FrameWriter};

#[derive(Debug, Clone)]
pub struct BrokerMeta {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone)]
pub struct PartitionMeta {
    pub error: KafkaCode,
    pub partition: i32,
    /// -1 while a leader election is in progress.
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct TopicMeta {
    pub error: KafkaCode,
    pub name: String,
    pub partitions: Vec<PartitionMeta>,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMeta>,
    pub topics: Vec<TopicMeta>,
}

impl MetadataResponse {
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        let broker_count = r.read_i32().await?;
        let mut brokers = Vec::with_capacity(broker_count.max(0) as usize);
        for _ in 0..broker_count {
            brokers.push(BrokerMeta {
                node_id: r.read_i32().await?,
                host: r.read_string().await?,
                port: r.read_i32().await?,
            });
        }
        let topic_count = r.read_i32().await?;
        let mut topics = Vec::with_capacity(topic_count.max(0) as usize);
        for _ in 0..topic_count {
            let error = KafkaCode::from_i16(r.read_i16().await?);
            let name = r.read_string().await?;
            let partition_count = r.read_i32().await?;
            let mut partitions = Vec::with_capacity(partition_count.max(0) as usize);
            for _ in 0..partition_count {
                let error = KafkaCode::from_i16(r.read_i16().await?);
                let partition = r.read_i32().await?;
                let leader = r.read_i32().await?;
                partitions.push(PartitionMeta {
                    error,
                    partition,
                    leader,
                    replicas: read_i32_array(r).await?,
                    isr: read_i32_array(r).await?,
                });
            }
            topics.push(TopicMeta {
                error,
                name,
                partitions,
            });
        }
        Ok(Self { brokers, topics })
    }

    pub fn encode<W: AsyncWrite + Unpin>(&self, w: &mut FrameWriter<W>, correlation_id: i32) {
        w.begin_response(correlation_id);
        w.put_i32(self.brokers.len() as i32);
        for b in &self.brokers {
            w.put_i32(b.node_id);
            w.put_string(&b.host);
            w.put_i32(b.port);
        }
        w.put_i32(self.topics.len() as i32);
        for t in &self.topics {
            w.put_i16(t.error.as_i16());
            w.put_string(&t.name);
            w.put_i32(t.partitions.len() as i32);
            for p in &t.partitions {
                w.put_i16(p.error.as_i16());
                w.put_i32(p.partition);
                w.put_i32(p.leader);
                write_i32_array(w, &p.replicas);
                write_i32_array(w, &p.isr);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OffsetPartitionResponse {
    pub partition: i32,
    pub error: KafkaCode,
    /// The broker may return several offsets; clients asking for one
    /// sentinel resolution get a single entry.
    pub offsets: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct OffsetTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetPartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetResponse {
    pub topics: Vec<OffsetTopicResponse>,
}

impl OffsetResponse {
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        let topic_count = r.read_i32().await?;
        let mut topics = Vec::with_capacity(topic_count.max(0) as usize);
        for _ in 0..topic_count {
            let name = r.read_string().await?;
            let partition_count = r.read_i32().await?;
            let mut partitions = Vec::with_capacity(partition_count.max(0) as usize);
            for _ in 0..partition_count {
                let partition = r.read_i32().await?;
                let error = KafkaCode::from_i16(r.read_i16().await?);
                let offset_count = r.read_i32().await?;
                let mut offsets = Vec::with_capacity(offset_count.max(0) as usize);
                for _ in 0..offset_count {
                    offsets.push(r.read_i64().await?);
                }
                partitions.push(OffsetPartitionResponse {
                    partition,
                    error,
                    offsets,
                });
            }
            topics.push(OffsetTopicResponse { name, partitions });
        }
        Ok(Self { topics })
    }

    pub fn encode<W: AsyncWrite + Unpin>(&self, w: &mut FrameWriter<W>, correlation_id: i32) {
        w.begin_response(correlation_id);
        w.put_i32(self.topics.len() as i32);
        for t in &self.topics {
            w.put_string(&t.name);
            w.put_i32(t.partitions.len() as i32);
            for p in &t.partitions {
                w.put_i32(p.partition);
                w.put_i16(p.error.as_i16());
                w.put_i32(p.offsets.len() as i32);
                for o in &p.offsets {
                    w.put_i64(*o);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducePartitionAck {
    pub partition: i32,
    pub error: KafkaCode,
    /// Offset assigned to the first message of the appended set.
    pub base_offset: i64,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionAck>,
}

#[derive(Debug, Clone, Default)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
}

impl ProduceResponse {
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        let topic_count = r.read_i32().await?;
        let mut topics = Vec::with_capacity(topic_count.max(0) as usize);
        for _ in 0..topic_count {
            let name = r.read_string().await?;
            let partition_count = r.read_i32().await?;
            let mut partitions = Vec::with_capacity(partition_count.max(0) as usize);
            for _ in 0..partition_count {
                partitions.push(ProducePartitionAck {
                    partition: r.read_i32().await?,
                    error: KafkaCode::from_i16(r.read_i16().await?),
                    base_offset: r.read_i64().await?,
                });
            }
            topics.push(ProduceTopicResponse { name, partitions });
        }
        Ok(Self { topics })
    }

    pub fn encode<W: AsyncWrite + Unpin>(&self, w: &mut FrameWriter<W>, correlation_id: i32) {
        w.begin_response(correlation_id);
        w.put_i32(self.topics.len() as i32);
        for t in &self.topics {
            w.put_string(&t.name);
            w.put_i32(t.partitions.len() as i32);
            for p in &t.partitions {
                w.put_i32(p.partition);
                w.put_i16(p.error.as_i16());
                w.put_i64(p.base_offset);
            }
        }
    }
}

/// Per-partition header of a streamed fetch response. The `message_set_size`
/// bytes that follow are the caller's to read (or skip).
#[derive(Debug, Clone)]
pub struct FetchPartitionHeader {
    pub partition: i32,
    pub error: KafkaCode,
    pub high_watermark: i64,
    pub message_set_size: i32,
}

impl FetchPartitionHeader {
    pub async fn decode<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Self> {
        Ok(Self {
            partition: r.read_i32().await?,
            error: KafkaCode::from_i16(r.read_i16().await?),
            high_watermark: r.read_i64().await?,
            message_set_size: r.read_i32().await?,
        })
    }
}

/// Owned fetch response, used by the broker side to serialize one.
#[derive(Debug, Clone)]
pub struct FetchResponsePartition {
    pub partition: i32,
    pub error: KafkaCode,
    pub high_watermark: i64,
    pub message_set: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchResponseTopic {
    pub name: String,
    pub partitions: Vec<FetchResponsePartition>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub topics: Vec<FetchResponseTopic>,
}

impl FetchResponse {
    pub fn encode<W: AsyncWrite + Unpin>(&self, w: &mut FrameWriter<W>, correlation_id: i32) {
        w.begin_response(correlation_id);
        w.put_i32(self.topics.len() as i32);
        for t in &self.topics {
            w.put_string(&t.name);
            w.put_i32(t.partitions.len() as i32);
            for p in &t.partitions {
                w.put_i32(p.partition);
                w.put_i16(p.error.as_i16());
                w.put_i64(p.high_watermark);
                w.put_i32(p.message_set.len() as i32);
                w.put_raw(&p.message_set);
            }
        }
    }
}

async fn read_i32_array<R: AsyncRead + Unpin>(r: &mut FrameReader<R>) -> Result<Vec<i32>> {
    let count = r.read_i32().await?;
    let mut v = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        v.push(r.read_i32().await?);
    }
    Ok(v)
}

fn write_i32_array<W: AsyncWrite + Unpin>(w: &mut FrameWriter<W>, values: &[i32]) {
    w.put_i32(values.len() as i32);
    for v in values {
        w.put_i32(*v);
    }
}
