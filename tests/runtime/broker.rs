//! In-process mock Kafka cluster.
//!
//! Speaks the v0 protocol over real TCP sockets using the wire crate's
//! broker-side codecs. Partition state (leadership, logs, injected faults)
//! is shared across all brokers of a cluster, so leader migrations are just
//! a state flip: the old leader starts answering `NotLeaderForPartition`
//! and fresh metadata points at the new one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kafka_mux_wire::{
    ApiKey, Compression, FetchRequest, FetchResponse, FetchResponsePartition, FetchResponseTopic,
    FrameReader, FrameWriter, KafkaCode, MessageSetParser, MessageSetWriter, MetadataRequest,
    MetadataResponse, BrokerMeta, OffsetPartitionResponse, OffsetRequest, OffsetResponse,
    OffsetTopicResponse, PartitionMeta, ProducePartitionAck, ProduceRequest, ProduceResponse,
    ProduceTopicResponse, TopicMeta, OFFSET_EARLIEST,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

struct PartitionState {
    leader: i32,
    earliest: i64,
    log: Vec<StoredRecord>,
    /// Error codes served to the next fetches instead of data.
    pending_fetch_errors: VecDeque<KafkaCode>,
    /// Raw message-set bytes served by the next fetch, for corruption tests.
    corrupt_set: Option<Vec<u8>>,
}

impl PartitionState {
    fn next_offset(&self) -> i64 {
        self.earliest + self.log.len() as i64
    }

    /// Message set starting at `from`, capped at `max_bytes`.
    fn build_set(&self, from: i64, max_bytes: usize) -> Vec<u8> {
        let mut buf = vec![0u8; max_bytes];
        let mut writer = MessageSetWriter::new(&mut buf);
        let start = (from - self.earliest).max(0) as usize;
        for (i, record) in self.log.iter().enumerate().skip(start) {
            let offset = self.earliest + i as i64;
            if !writer.append_with_offset(
                offset,
                record.key.as_deref(),
                record.value.as_deref(),
                Compression::None,
            ) {
                break;
            }
        }
        let len = writer.len();
        buf.truncate(len);
        buf
    }
}

struct ClusterState {
    brokers: Vec<BrokerMeta>,
    partitions: HashMap<(String, i32), PartitionState>,
}

struct BrokerHandle {
    node_id: i32,
    addr: String,
    accept_task: JoinHandle<()>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
    offline: Arc<AtomicBool>,
    /// Partition count of each fetch request this broker served.
    fetch_log: Arc<Mutex<Vec<usize>>>,
}

pub struct Cluster {
    state: Arc<Mutex<ClusterState>>,
    brokers: Vec<BrokerHandle>,
}

impl Cluster {
    pub async fn start(broker_count: usize) -> anyhow::Result<Self> {
        let state = Arc::new(Mutex::new(ClusterState {
            brokers: Vec::new(),
            partitions: HashMap::new(),
        }));
        let mut brokers = Vec::new();
        for node_id in 0..broker_count as i32 {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port() as i32;
            state.lock().unwrap().brokers.push(BrokerMeta {
                node_id,
                host: "127.0.0.1".into(),
                port,
            });
            let offline = Arc::new(AtomicBool::new(false));
            let conns = Arc::new(Mutex::new(Vec::new()));
            let fetch_log = Arc::new(Mutex::new(Vec::new()));
            let accept_task = tokio::spawn(accept_loop(
                node_id,
                listener,
                Arc::clone(&state),
                Arc::clone(&offline),
                Arc::clone(&conns),
                Arc::clone(&fetch_log),
            ));
            brokers.push(BrokerHandle {
                node_id,
                addr: format!("127.0.0.1:{port}"),
                accept_task,
                conns,
                offline,
                fetch_log,
            });
        }
        Ok(Self { state, brokers })
    }

    pub fn bootstrap(&self) -> Vec<String> {
        self.brokers.iter().map(|b| b.addr.clone()).collect()
    }

    pub fn create_topic(&self, topic: &str, partitions: &[i32], leader: i32, earliest: i64) {
        let mut st = self.state.lock().unwrap();
        for partition in partitions {
            st.partitions.insert(
                (topic.to_string(), *partition),
                PartitionState {
                    leader,
                    earliest,
                    log: Vec::new(),
                    pending_fetch_errors: VecDeque::new(),
                    corrupt_set: None,
                },
            );
        }
    }

    /// Append one record, returning its assigned offset.
    pub fn append(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: &[u8]) -> i64 {
        let mut st = self.state.lock().unwrap();
        let ps = st
            .partitions
            .get_mut(&(topic.to_string(), partition))
            .expect("unknown partition");
        let offset = ps.next_offset();
        ps.log.push(StoredRecord {
            key: key.map(<[u8]>::to_vec),
            value: Some(value.to_vec()),
        });
        offset
    }

    pub fn set_leader(&self, topic: &str, partition: i32, leader: i32) {
        let mut st = self.state.lock().unwrap();
        st.partitions
            .get_mut(&(topic.to_string(), partition))
            .expect("unknown partition")
            .leader = leader;
    }

    pub fn fail_next_fetch(&self, topic: &str, partition: i32, code: KafkaCode, times: usize) {
        let mut st = self.state.lock().unwrap();
        let ps = st
            .partitions
            .get_mut(&(topic.to_string(), partition))
            .expect("unknown partition");
        for _ in 0..times {
            ps.pending_fetch_errors.push_back(code);
        }
    }

    /// Serve a message set with a flipped checksum byte on the next fetch.
    pub fn serve_corrupt_fetch(&self, topic: &str, partition: i32) {
        let mut st = self.state.lock().unwrap();
        let ps = st
            .partitions
            .get_mut(&(topic.to_string(), partition))
            .expect("unknown partition");
        let mut buf = vec![0u8; 256];
        let mut writer = MessageSetWriter::new(&mut buf);
        writer.append_with_offset(
            ps.next_offset(),
            None,
            Some(b"corrupted-record"),
            Compression::None,
        );
        let len = writer.len();
        buf.truncate(len);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        ps.corrupt_set = Some(buf);
    }

    /// Drop every open connection of a broker and refuse new ones while
    /// offline.
    pub fn set_offline(&self, node_id: i32, offline: bool) {
        let broker = self.broker(node_id);
        broker.offline.store(offline, Ordering::SeqCst);
        if offline {
            for conn in broker.conns.lock().unwrap().drain(..) {
                conn.abort();
            }
        }
    }

    /// Partition count of each fetch request served, in order.
    pub fn fetch_partition_counts(&self, node_id: i32) -> Vec<usize> {
        self.broker(node_id).fetch_log.lock().unwrap().clone()
    }

    pub fn records(&self, topic: &str, partition: i32) -> Vec<StoredRecord> {
        let st = self.state.lock().unwrap();
        st.partitions
            .get(&(topic.to_string(), partition))
            .map(|ps| ps.log.clone())
            .unwrap_or_default()
    }

    fn broker(&self, node_id: i32) -> &BrokerHandle {
        self.brokers
            .iter()
            .find(|b| b.node_id == node_id)
            .expect("unknown broker")
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for broker in &self.brokers {
            broker.accept_task.abort();
            for conn in broker.conns.lock().unwrap().drain(..) {
                conn.abort();
            }
        }
    }
}

async fn accept_loop(
    node_id: i32,
    listener: TcpListener,
    state: Arc<Mutex<ClusterState>>,
    offline: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<JoinHandle<()>>>>,
    fetch_log: Arc<Mutex<Vec<usize>>>,
) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        if offline.load(Ordering::SeqCst) {
            drop(socket);
            continue;
        }
        let state = Arc::clone(&state);
        let fetch_log = Arc::clone(&fetch_log);
        let handle = tokio::spawn(async move {
            let _ = serve_connection(node_id, socket, state, fetch_log).await;
        });
        conns.lock().unwrap().push(handle);
    }
}

async fn serve_connection(
    node_id: i32,
    socket: TcpStream,
    state: Arc<Mutex<ClusterState>>,
    fetch_log: Arc<Mutex<Vec<usize>>>,
) -> kafka_mux_wire::Result<()> {
    let (read_half, write_half) = socket.into_split();
    let mut reader = FrameReader::new(read_half, 64 * 1024);
    let mut writer = FrameWriter::new(write_half, 16 * 1024);
    loop {
        let header = reader.read_request_header().await?;
        match header.api_key {
            ApiKey::Metadata => {
                let _request = MetadataRequest::decode(&mut reader).await?;
                reader.end_frame().await?;
                let response = build_metadata(&state);
                response.encode(&mut writer, header.correlation_id);
                writer.flush().await?;
            }
            ApiKey::Offsets => {
                let request = OffsetRequest::decode(&mut reader).await?;
                reader.end_frame().await?;
                let response = build_offsets(&state, &request);
                response.encode(&mut writer, header.correlation_id);
                writer.flush().await?;
            }
            ApiKey::Fetch => {
                let request = FetchRequest::decode(&mut reader).await?;
                reader.end_frame().await?;
                fetch_log
                    .lock()
                    .unwrap()
                    .push(request.topics.iter().map(|t| t.partitions.len()).sum());
                let response = serve_fetch(node_id, &state, &request).await;
                response.encode(&mut writer, header.correlation_id);
                writer.flush().await?;
            }
            ApiKey::Produce => {
                let request = ProduceRequest::decode(&mut reader).await?;
                reader.end_frame().await?;
                let response = apply_produce(node_id, &state, &request);
                response.encode(&mut writer, header.correlation_id);
                writer.flush().await?;
            }
        }
    }
}

fn build_metadata(state: &Mutex<ClusterState>) -> MetadataResponse {
    let st = state.lock().unwrap();
    let mut topics: HashMap<String, Vec<PartitionMeta>> = HashMap::new();
    for ((topic, partition), ps) in &st.partitions {
        topics.entry(topic.clone()).or_default().push(PartitionMeta {
            error: KafkaCode::None,
            partition: *partition,
            leader: ps.leader,
            replicas: vec![ps.leader],
            isr: vec![ps.leader],
        });
    }
    MetadataResponse {
        brokers: st.brokers.clone(),
        topics: topics
            .into_iter()
            .map(|(name, mut partitions)| {
                partitions.sort_by_key(|p| p.partition);
                TopicMeta {
                    error: KafkaCode::None,
                    name,
                    partitions,
                }
            })
            .collect(),
    }
}

fn build_offsets(state: &Mutex<ClusterState>, request: &OffsetRequest) -> OffsetResponse {
    let st = state.lock().unwrap();
    let topics = request
        .topics
        .iter()
        .map(|t| OffsetTopicResponse {
            name: t.name.clone(),
            partitions: t
                .partitions
                .iter()
                .map(|p| match st.partitions.get(&(t.name.clone(), p.partition)) {
                    None => OffsetPartitionResponse {
                        partition: p.partition,
                        error: KafkaCode::UnknownTopicOrPartition,
                        offsets: vec![],
                    },
                    Some(ps) => {
                        let offset = if p.time == OFFSET_EARLIEST {
                            ps.earliest
                        } else {
                            ps.next_offset()
                        };
                        OffsetPartitionResponse {
                            partition: p.partition,
                            error: KafkaCode::None,
                            offsets: vec![offset],
                        }
                    }
                })
                .collect(),
        })
        .collect();
    OffsetResponse { topics }
}

/// Serve one fetch, emulating broker-side long-polling: an all-empty
/// response is held back until data appears or `max_wait_ms` expires.
async fn serve_fetch(
    node_id: i32,
    state: &Mutex<ClusterState>,
    request: &FetchRequest,
) -> FetchResponse {
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(request.max_wait_ms.max(0) as u64);
    loop {
        let (response, observable) = build_fetch(node_id, state, request);
        if observable || tokio::time::Instant::now() >= deadline {
            return response;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn build_fetch(
    node_id: i32,
    state: &Mutex<ClusterState>,
    request: &FetchRequest,
) -> (FetchResponse, bool) {
    let mut st = state.lock().unwrap();
    let mut observable = false;
    let mut topics = Vec::new();
    for t in &request.topics {
        let mut partitions = Vec::new();
        for p in &t.partitions {
            let ack = match st.partitions.get_mut(&(t.name.clone(), p.partition)) {
                None => {
                    observable = true;
                    error_partition(p.partition, KafkaCode::UnknownTopicOrPartition)
                }
                Some(ps) => {
                    if let Some(code) = ps.pending_fetch_errors.pop_front() {
                        observable = true;
                        error_partition(p.partition, code)
                    } else if ps.leader != node_id {
                        observable = true;
                        error_partition(p.partition, KafkaCode::NotLeaderForPartition)
                    } else if let Some(raw) = ps.corrupt_set.take() {
                        observable = true;
                        FetchResponsePartition {
                            partition: p.partition,
                            error: KafkaCode::None,
                            high_watermark: ps.next_offset(),
                            message_set: raw,
                        }
                    } else if p.offset < ps.earliest || p.offset > ps.next_offset() {
                        observable = true;
                        error_partition(p.partition, KafkaCode::OffsetOutOfRange)
                    } else {
                        let set = ps.build_set(p.offset, p.max_bytes.max(0) as usize);
                        if !set.is_empty() {
                            observable = true;
                        }
                        FetchResponsePartition {
                            partition: p.partition,
                            error: KafkaCode::None,
                            high_watermark: ps.next_offset(),
                            message_set: set,
                        }
                    }
                }
            };
            partitions.push(ack);
        }
        topics.push(FetchResponseTopic {
            name: t.name.clone(),
            partitions,
        });
    }
    (FetchResponse { topics }, observable)
}

fn error_partition(partition: i32, error: KafkaCode) -> FetchResponsePartition {
    FetchResponsePartition {
        partition,
        error,
        high_watermark: 0,
        message_set: Vec::new(),
    }
}

fn apply_produce(
    node_id: i32,
    state: &Mutex<ClusterState>,
    request: &ProduceRequest<'_>,
) -> ProduceResponse {
    let mut st = state.lock().unwrap();
    let mut topics = Vec::new();
    for t in &request.topics {
        let mut partitions = Vec::new();
        for p in &t.partitions {
            let ack = match st.partitions.get_mut(&(t.name.to_string(), p.partition)) {
                None => ProducePartitionAck {
                    partition: p.partition,
                    error: KafkaCode::UnknownTopicOrPartition,
                    base_offset: -1,
                },
                Some(ps) if ps.leader != node_id => ProducePartitionAck {
                    partition: p.partition,
                    error: KafkaCode::NotLeaderForPartition,
                    base_offset: -1,
                },
                Some(ps) => {
                    let base_offset = ps.next_offset();
                    let mut parser = MessageSetParser::new(&p.message_set);
                    let mut error = KafkaCode::None;
                    loop {
                        match parser.next_record() {
                            Ok(Some(record)) => ps.log.push(StoredRecord {
                                key: record.key.clone().map(|r| p.message_set[r].to_vec()),
                                value: record.value.clone().map(|r| p.message_set[r].to_vec()),
                            }),
                            Ok(None) => break,
                            Err(_) => {
                                error = KafkaCode::CorruptMessage;
                                break;
                            }
                        }
                    }
                    ProducePartitionAck {
                        partition: p.partition,
                        error,
                        base_offset,
                    }
                }
            };
            partitions.push(ack);
        }
        topics.push(ProduceTopicResponse {
            name: t.name.to_string(),
            partitions,
        });
    }
    ProduceResponse { topics }
}
