//! One TCP pipe to one broker.
//!
//! Three cooperative tasks share the connection: the fetcher bundles
//! fetch-ready consumer queues into fetch requests, the pusher bundles
//! produce-ready producer queues into produce requests, and the receiver
//! decodes responses and routes them back. Synchronous RPCs (metadata,
//! offsets) ride the same pipe.
//!
//! Ordering is the whole game: every writer serializes, flushes and appends
//! its in-flight entry while holding the write mutex, so the in-flight FIFO
//! matches the wire byte order exactly and the receiver can classify each
//! response by popping one entry, with no correlation-id bookkeeping.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use kafka_mux_wire::message;
use kafka_mux_wire::{
    FetchPartition, FetchPartitionHeader, FetchRequest, FetchTopic, FrameReader, FrameWriter,
    KafkaCode, MetadataRequest, MetadataResponse, OffsetPartition, OffsetRequest, OffsetTopic,
    ProducePartition, ProduceRequest, ProduceResponse, ProduceTopic,
};

use crate::buffer::QueueBuffer;
use crate::bundler::RequestBundler;
use crate::client::ClientInner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::{BufferKind, PartitionQueue};

/// A produce payload awaiting its ack, checked out of its queue.
struct ProduceEntry {
    queue: Arc<PartitionQueue>,
    buffer: Box<QueueBuffer>,
}

/// One entry of the in-flight request log. Pushed in wire order, popped in
/// the same order by the receiver.
enum InFlight {
    Metadata {
        reply: oneshot::Sender<MetadataResponse>,
    },
    Offset {
        reply: oneshot::Sender<kafka_mux_wire::OffsetResponse>,
    },
    Fetch,
    Produce {
        entries: Vec<ProduceEntry>,
    },
}

pub(crate) struct BrokerConnection {
    broker_id: i32,
    addr: String,
    client_id: String,
    config: Config,
    client: Weak<ClientInner>,
    pub consumer_bundler: Arc<RequestBundler>,
    pub producer_bundler: Arc<RequestBundler>,
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
    in_flight_tx: mpsc::UnboundedSender<InFlight>,
    next_correlation: AtomicI32,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerConnection {
    pub async fn connect(
        client: &Arc<ClientInner>,
        broker_id: i32,
        addr: String,
    ) -> Result<Arc<Self>> {
        debug!(broker_id, %addr, "opening broker connection");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Connection(format!("connect to {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let config = client.config().clone();
        let (in_flight_tx, in_flight_rx) = mpsc::unbounded_channel();
        let reader = FrameReader::new(read_half, config.deserializer_chunk_size);
        let writer = FrameWriter::new(write_half, config.serializer_chunk_size);

        let conn = Arc::new(Self {
            broker_id,
            addr,
            client_id: client.client_id().to_string(),
            config,
            client: Arc::downgrade(client),
            consumer_bundler: Arc::new(RequestBundler::new(BufferKind::Free)),
            producer_bundler: Arc::new(RequestBundler::new(BufferKind::Filled)),
            writer: Mutex::new(writer),
            in_flight_tx,
            next_correlation: AtomicI32::new(1),
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = conn.tasks.lock().unwrap();
        tasks.push(tokio::spawn(fetcher_loop(Arc::clone(&conn))));
        tasks.push(tokio::spawn(pusher_loop(Arc::clone(&conn))));
        tasks.push(tokio::spawn(receiver_loop(
            Arc::clone(&conn),
            reader,
            in_flight_rx,
        )));
        drop(tasks);

        Ok(conn)
    }

    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    fn next_correlation(&self) -> i32 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Stop all three tasks. Idempotent; also reached through
    /// [`ClientInner::connection_lost`].
    pub fn abort_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Funnel for any task hitting a fatal stream error: tear the
    /// connection down exactly once and hand every worker back to the
    /// client for re-homing.
    fn report_lost(self: &Arc<Self>, error: Error) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(broker = self.broker_id, addr = %self.addr, %error, "broker connection lost");
        match self.client.upgrade() {
            Some(client) => client.connection_lost(self),
            None => self.abort_tasks(),
        }
    }

    fn rehome(&self, queue: Arc<PartitionQueue>) {
        if let Some(client) = self.client.upgrade() {
            client.enqueue_brokerless(queue);
        }
    }

    /// Serialize one bundled fetch covering every collected queue at its
    /// current offset.
    async fn send_fetch(&self, batch: &[Arc<PartitionQueue>]) -> Result<()> {
        let mut topics: Vec<FetchTopic> = Vec::new();
        for queue in batch {
            let partition = FetchPartition {
                partition: queue.partition(),
                offset: queue.next_offset(),
                max_bytes: self.config.consumer_max_bytes as i32,
            };
            match topics.last_mut() {
                Some(topic) if topic.name == queue.topic() => topic.partitions.push(partition),
                _ => topics.push(FetchTopic {
                    name: queue.topic().to_string(),
                    partitions: vec![partition],
                }),
            }
        }
        let request = FetchRequest {
            max_wait_ms: self.config.fetch_max_wait.as_millis() as i32,
            min_bytes: self.config.fetch_min_bytes as i32,
            topics,
        };

        let mut writer = self.writer.lock().await;
        request.encode(&mut writer, self.next_correlation(), &self.client_id);
        writer.flush().await?;
        self.in_flight_tx
            .send(InFlight::Fetch)
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }

    /// Serialize one bundled produce from the checked-out payloads. The
    /// buffers travel in the in-flight entry so the receiver can free or
    /// requeue them when the ack lands.
    async fn send_produce(&self, entries: Vec<ProduceEntry>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        {
            let mut topics: Vec<ProduceTopic<'_>> = Vec::new();
            for entry in &entries {
                let partition = ProducePartition {
                    partition: entry.queue.partition(),
                    message_set: Cow::Borrowed(entry.buffer.payload()),
                };
                match topics.last_mut() {
                    Some(topic) if topic.name == entry.queue.topic() => {
                        topic.partitions.push(partition)
                    }
                    _ => topics.push(ProduceTopic {
                        name: Cow::Borrowed(entry.queue.topic()),
                        partitions: vec![partition],
                    }),
                }
            }
            let request = ProduceRequest {
                required_acks: self.config.required_acks,
                timeout_ms: self.config.produce_timeout.as_millis() as i32,
                topics,
            };
            request.encode(&mut writer, self.next_correlation(), &self.client_id);
        }
        writer.flush().await?;
        self.in_flight_tx
            .send(InFlight::Produce { entries })
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }

    /// Metadata RPC over this connection.
    pub async fn get_metadata(&self, topics: Vec<String>) -> Result<MetadataResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            let request = MetadataRequest { topics };
            request.encode(&mut writer, self.next_correlation(), &self.client_id);
            writer.flush().await?;
            self.in_flight_tx
                .send(InFlight::Metadata { reply: reply_tx })
                .map_err(|_| Error::Shutdown)?;
        }
        reply_rx
            .await
            .map_err(|_| Error::Connection("connection closed before the metadata reply".into()))
    }

    /// Resolve an offset sentinel (-1 latest, -2 earliest) against the
    /// broker.
    pub async fn get_starting_offset(
        &self,
        topic: &str,
        partition: i32,
        time: i64,
    ) -> Result<i64> {
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut writer = self.writer.lock().await;
            let request = OffsetRequest {
                topics: vec![OffsetTopic {
                    name: topic.to_string(),
                    partitions: vec![OffsetPartition {
                        partition,
                        time,
                        max_offsets: 1,
                    }],
                }],
            };
            request.encode(&mut writer, self.next_correlation(), &self.client_id);
            writer.flush().await?;
            self.in_flight_tx
                .send(InFlight::Offset { reply: reply_tx })
                .map_err(|_| Error::Shutdown)?;
        }
        let response = reply_rx
            .await
            .map_err(|_| Error::Connection("connection closed before the offset reply".into()))?;

        let ack = response
            .topics
            .iter()
            .find(|t| t.name == topic)
            .and_then(|t| t.partitions.iter().find(|p| p.partition == partition))
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "offset response missing {topic}/{partition}"
                ))
            })?;
        match ack.error {
            KafkaCode::None => ack.offsets.first().copied().ok_or_else(|| {
                Error::Protocol(format!("empty offset list for {topic}/{partition}"))
            }),
            KafkaCode::OffsetOutOfRange => Err(Error::OffsetOutOfRange {
                topic: topic.to_string(),
                partition,
            }),
            code => Err(Error::Protocol(format!(
                "offset request for {topic}/{partition} failed with {code:?}"
            ))),
        }
    }

    /// Walk one fetch response, routing each partition's message set into
    /// its queue.
    async fn handle_fetch(&self, reader: &mut FrameReader<OwnedReadHalf>) -> Result<()> {
        let topic_count = reader.read_i32().await?;
        for _ in 0..topic_count {
            let topic = reader.read_string().await?;
            let partition_count = reader.read_i32().await?;
            for _ in 0..partition_count {
                let header = FetchPartitionHeader::decode(reader).await?;
                let set_size = header.message_set_size.max(0) as usize;

                let Some(queue) = self.consumer_bundler.find(&topic, header.partition) else {
                    // worker detached while the request was in flight
                    reader.skip(set_size).await?;
                    continue;
                };

                match header.error {
                    KafkaCode::None => {
                        self.fill_queue(reader, &topic, &queue, set_size).await?;
                    }
                    code if code.is_leader_change() => {
                        debug!(
                            %topic,
                            partition = header.partition,
                            ?code,
                            "partition moved, re-homing its consumer"
                        );
                        reader.skip(set_size).await?;
                        if let Some(queue) =
                            self.consumer_bundler.remove_queue(&topic, header.partition)
                        {
                            self.rehome(queue);
                        }
                    }
                    KafkaCode::OffsetOutOfRange => {
                        reader.skip(set_size).await?;
                        self.consumer_bundler.remove_queue(&topic, header.partition);
                        queue.inject_error(Error::OffsetOutOfRange {
                            topic: topic.clone(),
                            partition: header.partition,
                        });
                    }
                    code => {
                        return Err(Error::Protocol(format!(
                            "unexpected fetch error code {code:?} for {topic}/{}",
                            header.partition
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn fill_queue(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        topic: &str,
        queue: &Arc<PartitionQueue>,
        set_size: usize,
    ) -> Result<()> {
        if set_size > self.config.consumer_max_bytes {
            reader.skip(set_size).await?;
            self.consumer_bundler.remove_queue(topic, queue.partition());
            queue.inject_error(Error::MessageTooLarge {
                size: set_size,
                max: self.config.consumer_max_bytes,
            });
            return Ok(());
        }
        let Some(mut buffer) = queue.acquire_free() else {
            // a fetch was in flight without a reserved buffer; the queue's
            // request accounting is broken, fail the worker not the pipe
            reader.skip(set_size).await?;
            self.consumer_bundler.remove_queue(topic, queue.partition());
            queue.inject_error(Error::Protocol(
                "fetch response arrived with no free buffer".into(),
            ));
            return Ok(());
        };

        reader
            .read_exact_into(&mut buffer.storage_mut()[..set_size])
            .await?;
        buffer.set_len(set_size);

        if let Some(last) = message::last_offset(buffer.payload()) {
            queue.set_next_offset(last + 1);
        }
        trace!(
            %topic,
            partition = queue.partition(),
            bytes = set_size,
            next_offset = queue.next_offset(),
            "message set delivered"
        );
        queue.release_filled(buffer);
        self.consumer_bundler.response_done(topic, queue.partition());
        Ok(())
    }

    /// Settle one produce response against its checked-out payloads.
    async fn handle_produce(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        entries: Vec<ProduceEntry>,
    ) -> Result<()> {
        let response = ProduceResponse::decode(reader).await?;
        let mut entries: Vec<Option<ProduceEntry>> = entries.into_iter().map(Some).collect();

        for topic in &response.topics {
            for ack in &topic.partitions {
                let entry = entries
                    .iter_mut()
                    .find(|slot| {
                        slot.as_ref().is_some_and(|e| {
                            e.queue.topic() == topic.name && e.queue.partition() == ack.partition
                        })
                    })
                    .and_then(Option::take);
                let Some(ProduceEntry { queue, buffer }) = entry else {
                    return Err(Error::Protocol(format!(
                        "produce ack for {}/{} without a matching in-flight payload",
                        topic.name, ack.partition
                    )));
                };

                match ack.error {
                    KafkaCode::None => {
                        trace!(
                            topic = %topic.name,
                            partition = ack.partition,
                            base_offset = ack.base_offset,
                            "produce acked"
                        );
                        queue.release_free(buffer);
                        self.producer_bundler.response_done(&topic.name, ack.partition);
                    }
                    code if code.is_leader_change() => {
                        debug!(
                            topic = %topic.name,
                            partition = ack.partition,
                            ?code,
                            "partition moved, re-homing its producer"
                        );
                        // unacked payload goes back first in line
                        queue.requeue_filled(buffer);
                        if let Some(queue) =
                            self.producer_bundler.remove_queue(&topic.name, ack.partition)
                        {
                            self.rehome(queue);
                        }
                    }
                    KafkaCode::Other(raw) => {
                        return Err(Error::Protocol(format!(
                            "unexpected produce error code {raw} for {}/{}",
                            topic.name, ack.partition
                        )));
                    }
                    code => {
                        queue.requeue_filled(buffer);
                        self.producer_bundler.remove_queue(&topic.name, ack.partition);
                        queue.inject_error(Error::Protocol(format!(
                            "broker rejected produce for {}/{} with {code:?}",
                            topic.name, ack.partition
                        )));
                    }
                }
            }
        }

        // payloads the response never mentioned stay queued for retry
        for ProduceEntry { queue, buffer } in entries.into_iter().flatten() {
            queue.requeue_filled(buffer);
        }
        Ok(())
    }
}

async fn fetcher_loop(conn: Arc<BrokerConnection>) {
    loop {
        let batch = conn
            .consumer_bundler
            .collect(
                conn.config.fetcher_bundle_min_requests,
                conn.config.fetcher_bundle_max_wait,
            )
            .await;
        trace!(
            broker = conn.broker_id,
            partitions = batch.len(),
            "sending bundled fetch"
        );
        if let Err(error) = conn.send_fetch(&batch).await {
            conn.report_lost(error);
            return;
        }
    }
}

async fn pusher_loop(conn: Arc<BrokerConnection>) {
    loop {
        let batch = conn
            .producer_bundler
            .collect(
                conn.config.pusher_bundle_min_requests,
                conn.config.pusher_bundle_max_wait,
            )
            .await;
        let mut entries = Vec::with_capacity(batch.len());
        for queue in batch {
            match queue.acquire_filled() {
                Some(buffer) => entries.push(ProduceEntry { queue, buffer }),
                // raced with a teardown that took the payload back
                None => queue.set_request_pending(false),
            }
        }
        if entries.is_empty() {
            continue;
        }
        trace!(
            broker = conn.broker_id,
            partitions = entries.len(),
            "sending bundled produce"
        );
        if let Err(error) = conn.send_produce(entries).await {
            conn.report_lost(error);
            return;
        }
    }
}

async fn receiver_loop(
    conn: Arc<BrokerConnection>,
    mut reader: FrameReader<OwnedReadHalf>,
    mut in_flight: mpsc::UnboundedReceiver<InFlight>,
) {
    let result = receive_frames(&conn, &mut reader, &mut in_flight).await;
    match result {
        Ok(()) => trace!(broker = conn.broker_id, "receiver drained"),
        Err(error) => conn.report_lost(error),
    }
}

async fn receive_frames(
    conn: &Arc<BrokerConnection>,
    reader: &mut FrameReader<OwnedReadHalf>,
    in_flight: &mut mpsc::UnboundedReceiver<InFlight>,
) -> Result<()> {
    while let Some(entry) = in_flight.recv().await {
        reader.read_response_header().await?;
        match entry {
            InFlight::Metadata { reply } => {
                let response = MetadataResponse::decode(reader).await?;
                let _ = reply.send(response);
            }
            InFlight::Offset { reply } => {
                let response = kafka_mux_wire::OffsetResponse::decode(reader).await?;
                let _ = reply.send(response);
            }
            InFlight::Fetch => conn.handle_fetch(reader).await?,
            InFlight::Produce { entries } => conn.handle_produce(reader, entries).await?,
        }
        reader.end_frame().await?;
    }
    Ok(())
}
