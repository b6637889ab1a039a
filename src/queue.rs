//! Per-partition buffer ring.
//!
//! A `PartitionQueue` owns a fixed set of buffers cycling between a `free`
//! and a `filled` list, plus at most a few checked out to whoever is
//! actively reading or writing them (the consumer's current buffer, the
//! receiver mid-fill, produce payloads awaiting their ack). The total never
//! changes.
//!
//! Availability counters and the in-flight flag are atomics so the bundler
//! can consult them while holding only its own lock; the queue mutex guards
//! just the list mutations and is never held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::buffer::{self, QueueBuffer};
use crate::bundler::RequestBundler;
use crate::error::{Error, Result};

/// Which side of the ring a worker consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferKind {
    Free,
    Filled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerRole {
    Consumer,
    Producer,
}

impl WorkerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Consumer => "consumer",
            WorkerRole::Producer => "producer",
        }
    }
}

struct QueueState {
    free: VecDeque<Box<QueueBuffer>>,
    filled: VecDeque<Box<QueueBuffer>>,
    /// Buffers held outside both lists: the façade's current buffer, a
    /// receiver mid-fill, or produce payloads in flight.
    checked_out: usize,
    /// Back-reference to the owning bundler; `None` means brokerless.
    bundler: Option<Weak<RequestBundler>>,
    /// First injected failure; surfaced (cloned) by façade operations.
    error: Option<Error>,
    detached: bool,
}

pub(crate) struct PartitionQueue {
    topic: String,
    partition: i32,
    role: WorkerRole,
    total_buffers: usize,
    free_len: AtomicUsize,
    filled_len: AtomicUsize,
    request_pending: AtomicBool,
    /// Next offset to fetch; sentinels -1 (latest) and -2 (earliest) until
    /// resolved against the broker.
    next_offset: AtomicI64,
    state: Mutex<QueueState>,
    filled_notify: Notify,
    free_notify: Notify,
}

impl PartitionQueue {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        role: WorkerRole,
        buffers: usize,
        capacity: usize,
        initial_offset: i64,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            role,
            total_buffers: buffers,
            free_len: AtomicUsize::new(buffers),
            filled_len: AtomicUsize::new(0),
            request_pending: AtomicBool::new(false),
            next_offset: AtomicI64::new(initial_offset),
            state: Mutex::new(QueueState {
                free: buffer::allocate(buffers, capacity),
                filled: VecDeque::new(),
                checked_out: 0,
                bundler: None,
                error: None,
                detached: false,
            }),
            filled_notify: Notify::new(),
            free_notify: Notify::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn set_next_offset(&self, offset: i64) {
        self.next_offset.store(offset, Ordering::Release);
    }

    pub fn is_request_pending(&self) -> bool {
        self.request_pending.load(Ordering::Acquire)
    }

    pub fn set_request_pending(&self, pending: bool) {
        self.request_pending.store(pending, Ordering::Release);
    }

    pub fn has_ready_buffer(&self, kind: BufferKind) -> bool {
        match kind {
            BufferKind::Free => self.free_len.load(Ordering::Acquire) > 0,
            BufferKind::Filled => self.filled_len.load(Ordering::Acquire) > 0,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().unwrap().detached
    }

    pub fn pending_error(&self) -> Option<Error> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn attach_bundler(&self, bundler: &Arc<RequestBundler>) {
        self.state.lock().unwrap().bundler = Some(Arc::downgrade(bundler));
    }

    /// Reset to the brokerless state: no bundler, no request in flight.
    pub fn detach_bundler(&self) {
        self.state.lock().unwrap().bundler = None;
        self.set_request_pending(false);
    }

    fn bundler(&self) -> Option<Arc<RequestBundler>> {
        self.state.lock().unwrap().bundler.as_ref()?.upgrade()
    }

    /// Tell the bundler this queue can take part in the next bundle. No-op
    /// while an RPC for the queue is in flight.
    fn notify_bundler_ready(&self) {
        if self.is_request_pending() {
            return;
        }
        if let Some(bundler) = self.bundler() {
            bundler.mark_ready(&self.topic, self.partition);
        }
    }

    /// Pop a free buffer for filling. The caller keeps it checked out until
    /// it releases it back through one of the lists.
    pub fn acquire_free(&self) -> Option<Box<QueueBuffer>> {
        let mut s = self.state.lock().unwrap();
        let buf = s.free.pop_front()?;
        s.checked_out += 1;
        self.free_len.fetch_sub(1, Ordering::AcqRel);
        Some(buf)
    }

    /// Pop a filled buffer (produce payload) for serialization.
    pub fn acquire_filled(&self) -> Option<Box<QueueBuffer>> {
        let mut s = self.state.lock().unwrap();
        let buf = s.filled.pop_front()?;
        s.checked_out += 1;
        self.filled_len.fetch_sub(1, Ordering::AcqRel);
        Some(buf)
    }

    /// Publish a filled buffer and wake the waiting consumer. On producer
    /// queues this is the façade handing over a payload, which also makes
    /// the queue eligible for the next produce bundle.
    pub fn release_filled(&self, buf: Box<QueueBuffer>) {
        {
            let mut s = self.state.lock().unwrap();
            s.filled.push_back(buf);
            s.checked_out -= 1;
            self.filled_len.fetch_add(1, Ordering::AcqRel);
        }
        self.filled_notify.notify_one();
        if self.role == WorkerRole::Producer {
            self.notify_bundler_ready();
        }
    }

    /// Return an exhausted (or acked) buffer to the free list. On consumer
    /// queues a fresh free buffer makes the queue fetch-ready again.
    pub fn release_free(&self, mut buf: Box<QueueBuffer>) {
        buf.reset();
        {
            let mut s = self.state.lock().unwrap();
            s.free.push_back(buf);
            s.checked_out -= 1;
            self.free_len.fetch_add(1, Ordering::AcqRel);
        }
        self.free_notify.notify_one();
        if self.role == WorkerRole::Consumer {
            self.notify_bundler_ready();
        }
    }

    /// Put an un-acked produce payload back at the head of the filled list
    /// so it is retried first after the queue is re-homed.
    pub fn requeue_filled(&self, buf: Box<QueueBuffer>) {
        let mut s = self.state.lock().unwrap();
        s.filled.push_front(buf);
        s.checked_out -= 1;
        self.filled_len.fetch_add(1, Ordering::AcqRel);
    }

    /// Consumer side: wait until a filled buffer is available and check it
    /// out. Already-filled buffers are drained before an injected error is
    /// surfaced, so a consumer can finish what arrived before a failure.
    pub async fn wait_filled(&self) -> Result<Box<QueueBuffer>> {
        loop {
            let notified = self.filled_notify.notified();
            {
                let mut s = self.state.lock().unwrap();
                if let Some(buf) = s.filled.pop_front() {
                    s.checked_out += 1;
                    self.filled_len.fetch_sub(1, Ordering::AcqRel);
                    return Ok(buf);
                }
                if let Some(error) = &s.error {
                    return Err(error.clone());
                }
                if s.detached {
                    return Err(Error::Detached);
                }
            }
            notified.await;
        }
    }

    /// Producer side: wait until a free buffer is available and check it
    /// out. This is the producer's back-pressure point.
    pub async fn wait_free(&self) -> Result<Box<QueueBuffer>> {
        loop {
            let notified = self.free_notify.notified();
            {
                let mut s = self.state.lock().unwrap();
                if let Some(error) = &s.error {
                    return Err(error.clone());
                }
                if s.detached {
                    return Err(Error::Detached);
                }
                if let Some(buf) = s.free.pop_front() {
                    s.checked_out += 1;
                    self.free_len.fetch_sub(1, Ordering::AcqRel);
                    return Ok(buf);
                }
            }
            notified.await;
        }
    }

    /// Fail the worker that owns this queue. The first error wins; waiters
    /// are woken so it surfaces immediately.
    pub fn inject_error(&self, error: Error) {
        {
            let mut s = self.state.lock().unwrap();
            if s.error.is_none() {
                s.error = Some(error);
            }
        }
        self.filled_notify.notify_one();
        self.free_notify.notify_one();
    }

    /// Façade drop: leave the bundler, wake any waiter with a cancel
    /// marker, and make the queue invisible to the connection manager.
    pub fn detach(&self) {
        let bundler = {
            let mut s = self.state.lock().unwrap();
            s.detached = true;
            s.bundler.take().and_then(|w| w.upgrade())
        };
        self.set_request_pending(false);
        if let Some(bundler) = bundler {
            bundler.remove_queue(&self.topic, self.partition);
        }
        self.filled_notify.notify_one();
        self.free_notify.notify_one();
    }

    /// (free, filled, checked out); their sum is invariant.
    #[cfg(test)]
    pub fn census(&self) -> (usize, usize, usize) {
        let s = self.state.lock().unwrap();
        (s.free.len(), s.filled.len(), s.checked_out)
    }

    #[cfg(test)]
    pub fn total_buffers(&self) -> usize {
        self.total_buffers
    }
}

impl std::fmt::Debug for PartitionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionQueue")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("role", &self.role)
            .field("total_buffers", &self.total_buffers)
            .finish_non_exhaustive()
    }
}
