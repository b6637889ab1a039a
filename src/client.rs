//! Client: metadata cache, connection pool and worker registry.
//!
//! The client owns one connection per broker it currently talks to and a
//! single connection-manager task. Workers (consumer/producer queues) that
//! are not attached to any connection sit on the brokerless list; the
//! manager drains it, resolving each worker's partition leader from fresh
//! metadata and attaching the worker to that leader's connection. Leader
//! changes and dead connections feed workers back onto the same list, so
//! recovery is just the steady-state path re-running.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kafka_mux_wire::{FrameReader, FrameWriter, MetadataRequest, MetadataResponse};

use crate::config::Config;
use crate::connection::BrokerConnection;
use crate::error::{Error, Result};
use crate::metadata::MetadataCache;
use crate::queue::{PartitionQueue, WorkerRole};

struct ClientState {
    metadata: MetadataCache,
    connections: HashMap<i32, Arc<BrokerConnection>>,
    /// Every live worker, weakly held, for duplicate detection.
    workers: Vec<Weak<PartitionQueue>>,
    /// Work queue for the connection manager: workers attached to no
    /// bundler.
    brokerless: VecDeque<Arc<PartitionQueue>>,
}

pub(crate) struct ClientInner {
    client_id: String,
    bootstrap: Vec<String>,
    config: Config,
    state: Mutex<ClientState>,
    brokerless_notify: Notify,
    manager: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Handle to one Kafka cluster.
///
/// Consumers and producers are created from a client and share its
/// connections; dropping the client shuts the runtime down and fails any
/// still-attached workers.
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Validate the configuration, fetch initial metadata from the
    /// bootstrap brokers and start the connection manager.
    pub async fn connect(
        bootstrap: Vec<String>,
        client_id: impl Into<String>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        if bootstrap.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one bootstrap broker is required".into(),
            ));
        }
        let inner = Arc::new(ClientInner {
            client_id: client_id.into(),
            bootstrap,
            config,
            state: Mutex::new(ClientState {
                metadata: MetadataCache::default(),
                connections: HashMap::new(),
                workers: Vec::new(),
                brokerless: VecDeque::new(),
            }),
            brokerless_notify: Notify::new(),
            manager: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        inner.refresh_metadata().await?;
        info!(client_id = %inner.client_id, "client connected");

        let manager = tokio::spawn(manager_loop(Arc::clone(&inner)));
        *inner.manager.lock().unwrap() = Some(manager);
        Ok(Self { inner })
    }

    /// Force a metadata refresh outside the recovery loop.
    pub async fn refresh_metadata(&self) -> Result<()> {
        self.inner.refresh_metadata().await
    }

    /// Topics known to the cluster, from the cached metadata.
    pub fn topics(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().metadata.topic_names()
    }

    /// Partition ids of one topic, from the cached metadata.
    pub fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.inner.state.lock().unwrap().metadata.partition_ids(topic)
    }

    /// Stop the connection manager and every broker connection, and fail
    /// outstanding workers with [`Error::Shutdown`].
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl ClientInner {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Rebuild the metadata cache: ask an already-open connection first,
    /// then sweep the bootstrap brokers over one-shot connections. Sweeps
    /// are retried per configuration; the last error surfaces when retries
    /// run out.
    pub async fn refresh_metadata(&self) -> Result<()> {
        let open: Vec<Arc<BrokerConnection>> = {
            let s = self.state.lock().unwrap();
            s.connections.values().cloned().collect()
        };
        for conn in open {
            match conn.get_metadata(Vec::new()).await {
                Ok(response) => {
                    let cache = MetadataCache::from_response(&response);
                    if cache.is_empty() {
                        warn!(broker = conn.broker_id(), "metadata response listed no brokers");
                        continue;
                    }
                    self.state.lock().unwrap().metadata = cache;
                    debug!(
                        broker = conn.broker_id(),
                        "metadata refreshed over open connection"
                    );
                    return Ok(());
                }
                Err(error) => {
                    warn!(
                        broker = conn.broker_id(),
                        %error,
                        "metadata request over open connection failed"
                    );
                }
            }
        }

        let mut sweeps = 0u32;
        loop {
            sweeps += 1;
            let mut last_error = Error::Connection("no bootstrap brokers configured".into());
            for addr in &self.bootstrap {
                match self.fetch_bootstrap_metadata(addr).await {
                    Ok(response) => {
                        let cache = MetadataCache::from_response(&response);
                        if cache.is_empty() {
                            last_error =
                                Error::Protocol(format!("{addr} returned an empty broker list"));
                            warn!(%addr, "metadata response listed no brokers");
                            continue;
                        }
                        match cache.node_for_addr(addr) {
                            Some(node_id) => {
                                debug!(%addr, node_id, "metadata refreshed");
                            }
                            None => {
                                debug!(%addr, "responding broker absent from its own broker list");
                            }
                        }
                        self.state.lock().unwrap().metadata = cache;
                        return Ok(());
                    }
                    Err(error) => {
                        warn!(%addr, %error, "bootstrap metadata request failed");
                        last_error = error;
                    }
                }
            }
            if self.config.metadata_refresh_retry_count != 0
                && sweeps >= self.config.metadata_refresh_retry_count
            {
                return Err(last_error);
            }
            tokio::time::sleep(self.config.metadata_refresh_retry_timeout).await;
        }
    }

    /// One-shot metadata request over a throwaway connection.
    async fn fetch_bootstrap_metadata(&self, addr: &str) -> Result<MetadataResponse> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("connect to {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = FrameWriter::new(write_half, self.config.serializer_chunk_size);
        MetadataRequest::default().encode(&mut writer, 0, &self.client_id);
        writer.flush().await?;

        let mut reader = FrameReader::new(read_half, self.config.deserializer_chunk_size);
        reader.read_response_header().await?;
        let response = MetadataResponse::decode(&mut reader).await?;
        reader.end_frame().await?;
        Ok(response)
    }

    /// Admit a new worker: reject duplicates, then queue it for placement.
    pub fn register_worker(&self, queue: &Arc<PartitionQueue>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        {
            let mut s = self.state.lock().unwrap();
            s.workers
                .retain(|w| w.upgrade().is_some_and(|q| !q.is_detached()));
            let duplicate = s.workers.iter().filter_map(Weak::upgrade).any(|existing| {
                existing.topic() == queue.topic()
                    && existing.partition() == queue.partition()
                    && existing.role() == queue.role()
            });
            if duplicate {
                return Err(Error::DuplicateWorker {
                    role: queue.role().as_str(),
                    topic: queue.topic().to_string(),
                    partition: queue.partition(),
                });
            }
            s.workers.push(Arc::downgrade(queue));
            s.brokerless.push_back(Arc::clone(queue));
        }
        self.brokerless_notify.notify_one();
        Ok(())
    }

    /// Drop a worker from the registry and the placement queue.
    pub fn unregister_worker(&self, queue: &Arc<PartitionQueue>) {
        let mut s = self.state.lock().unwrap();
        s.brokerless.retain(|q| !Arc::ptr_eq(q, queue));
        s.workers
            .retain(|w| w.upgrade().is_some_and(|q| !Arc::ptr_eq(&q, queue)));
    }

    /// Hand a worker back to the connection manager. Dead or detached
    /// workers stay out, and a worker is never queued twice.
    pub fn enqueue_brokerless(&self, queue: Arc<PartitionQueue>) {
        if queue.is_detached() || queue.pending_error().is_some() {
            return;
        }
        {
            let mut s = self.state.lock().unwrap();
            if s.brokerless.iter().any(|q| Arc::ptr_eq(q, &queue)) {
                return;
            }
            s.brokerless.push_back(queue);
        }
        self.brokerless_notify.notify_one();
    }

    /// Teardown for one dead connection: unmap it, strip both bundlers and
    /// feed every worker back to the manager. Runs under the client lock
    /// with the bundlers locked inside it, the one composite-lock path in
    /// the runtime.
    pub fn connection_lost(&self, conn: &Arc<BrokerConnection>) {
        let rehomed = {
            let mut s = self.state.lock().unwrap();
            if s.connections
                .get(&conn.broker_id())
                .is_some_and(|c| Arc::ptr_eq(c, conn))
            {
                s.connections.remove(&conn.broker_id());
            }
            let mut orphans = conn.consumer_bundler.drain();
            orphans.extend(conn.producer_bundler.drain());
            let mut rehomed = 0usize;
            for queue in orphans {
                if queue.is_detached() || queue.pending_error().is_some() {
                    continue;
                }
                if !s.brokerless.iter().any(|q| Arc::ptr_eq(q, &queue)) {
                    s.brokerless.push_back(queue);
                    rehomed += 1;
                }
            }
            rehomed
        };
        debug!(
            broker = conn.broker_id(),
            workers = rehomed,
            "workers re-homed from lost connection"
        );
        self.brokerless_notify.notify_one();
        conn.abort_tasks();
    }

    /// Existing connection for a broker, or a freshly opened one. Only the
    /// manager task opens connections, so there is no connect race.
    async fn connection_for(self: &Arc<Self>, broker_id: i32) -> Result<Arc<BrokerConnection>> {
        let addr = {
            let s = self.state.lock().unwrap();
            if let Some(conn) = s.connections.get(&broker_id) {
                return Ok(Arc::clone(conn));
            }
            s.metadata.broker_addr(broker_id)?
        };
        let conn = BrokerConnection::connect(self, broker_id, addr).await?;
        self.state
            .lock()
            .unwrap()
            .connections
            .insert(broker_id, Arc::clone(&conn));
        Ok(conn)
    }

    /// Resolve one brokerless worker's leader and attach it. Any error is
    /// the caller's to inject into the worker.
    async fn place_worker(self: &Arc<Self>, queue: &Arc<PartitionQueue>) -> Result<()> {
        let topic = queue.topic().to_string();
        let partition = queue.partition();

        let mut attempts = 0u32;
        let leader = loop {
            attempts += 1;
            self.refresh_metadata().await?;
            let leader = {
                let s = self.state.lock().unwrap();
                s.metadata.partition(&topic, partition)?.leader
            };
            if leader >= 0 {
                break leader;
            }
            if self.config.leader_election_retry_count != 0
                && attempts >= self.config.leader_election_retry_count
            {
                return Err(Error::LeaderElectionTimeout { topic, partition });
            }
            debug!(%topic, partition, "no leader elected yet, waiting");
            tokio::time::sleep(self.config.leader_election_retry_timeout).await;
        };

        let conn = self.connection_for(leader).await?;
        if queue.is_detached() {
            return Ok(());
        }
        let bundler = match queue.role() {
            WorkerRole::Consumer => {
                if queue.next_offset() < 0 {
                    let offset = conn
                        .get_starting_offset(&topic, partition, queue.next_offset())
                        .await?;
                    debug!(%topic, partition, offset, "starting offset resolved");
                    queue.set_next_offset(offset);
                }
                &conn.consumer_bundler
            }
            WorkerRole::Producer => &conn.producer_bundler,
        };
        bundler.add_queue(queue);
        if queue.is_detached() {
            // the façade dropped while we were attaching
            bundler.remove_queue(&topic, partition);
            return Ok(());
        }
        debug!(
            %topic,
            partition,
            broker = leader,
            role = queue.role().as_str(),
            "worker attached"
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.lock().unwrap().take() {
            manager.abort();
        }
        let (connections, workers) = {
            let mut s = self.state.lock().unwrap();
            s.brokerless.clear();
            let connections: Vec<_> = s.connections.drain().map(|(_, c)| c).collect();
            let workers: Vec<_> = s.workers.iter().filter_map(Weak::upgrade).collect();
            (connections, workers)
        };
        for conn in connections {
            conn.abort_tasks();
        }
        for worker in workers {
            worker.inject_error(Error::Shutdown);
        }
        info!(client_id = %self.client_id, "client shut down");
    }
}

/// The connection manager: the client's recovery loop.
async fn manager_loop(inner: Arc<ClientInner>) {
    loop {
        let queue = loop {
            let notified = inner.brokerless_notify.notified();
            let popped = inner.state.lock().unwrap().brokerless.pop_front();
            if let Some(queue) = popped {
                break queue;
            }
            notified.await;
        };
        if queue.is_detached() {
            continue;
        }
        if let Err(error) = inner.place_worker(&queue).await {
            warn!(
                topic = queue.topic(),
                partition = queue.partition(),
                %error,
                "failed to place worker"
            );
            queue.inject_error(error);
        }
    }
}
