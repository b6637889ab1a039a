//! Request bundling.
//!
//! Each connection runs one bundler per direction. A bundler tracks which of
//! its partition queues could take part in the next broker RPC (a consumer
//! queue with a free buffer to fill, a producer queue with a filled payload
//! to ship) and hands the fetcher/pusher tasks a batch once enough queues
//! are ready or the wait budget runs out.
//!
//! Topics and partitions live in ordered maps, so walking the ready slots
//! yields the exact order the request is serialized in.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::queue::{BufferKind, PartitionQueue};

struct Slot {
    queue: Arc<PartitionQueue>,
    ready: bool,
}

struct BundlerState {
    topics: BTreeMap<String, BTreeMap<i32, Slot>>,
    ready_count: usize,
}

pub(crate) struct RequestBundler {
    /// Buffer kind that makes a queue ready: `Free` on the fetch direction,
    /// `Filled` on the produce direction.
    kind: BufferKind,
    state: Mutex<BundlerState>,
    ready_notify: Notify,
}

impl RequestBundler {
    pub fn new(kind: BufferKind) -> Self {
        Self {
            kind,
            state: Mutex::new(BundlerState {
                topics: BTreeMap::new(),
                ready_count: 0,
            }),
            ready_notify: Notify::new(),
        }
    }

    /// Insert a queue, marking it ready right away if it has a usable
    /// buffer and no RPC in flight.
    pub fn add_queue(self: &Arc<Self>, queue: &Arc<PartitionQueue>) {
        queue.attach_bundler(self);
        let ready = {
            let mut s = self.state.lock().unwrap();
            let ready = queue.has_ready_buffer(self.kind) && !queue.is_request_pending();
            s.topics
                .entry(queue.topic().to_string())
                .or_default()
                .insert(
                    queue.partition(),
                    Slot {
                        queue: Arc::clone(queue),
                        ready,
                    },
                );
            if ready {
                s.ready_count += 1;
            }
            ready
        };
        if ready {
            self.ready_notify.notify_one();
        }
    }

    /// Unlink a queue and clear its back-reference. Returns the queue so
    /// callers can re-home or fail it.
    pub fn remove_queue(&self, topic: &str, partition: i32) -> Option<Arc<PartitionQueue>> {
        let queue = {
            let mut s = self.state.lock().unwrap();
            let partitions = s.topics.get_mut(topic)?;
            let slot = partitions.remove(&partition)?;
            if partitions.is_empty() {
                s.topics.remove(topic);
            }
            if slot.ready {
                s.ready_count -= 1;
            }
            slot.queue
        };
        queue.detach_bundler();
        Some(queue)
    }

    /// Signal that a queue gained a usable buffer. Ignored while the
    /// queue's RPC is in flight; the receiver re-evaluates readiness when
    /// the response lands.
    pub fn mark_ready(&self, topic: &str, partition: i32) {
        let became_ready = {
            let mut s = self.state.lock().unwrap();
            let Some(slot) = s.topics.get_mut(topic).and_then(|t| t.get_mut(&partition)) else {
                return;
            };
            if slot.ready
                || slot.queue.is_request_pending()
                || !slot.queue.has_ready_buffer(self.kind)
            {
                false
            } else {
                slot.ready = true;
                s.ready_count += 1;
                true
            }
        };
        if became_ready {
            self.ready_notify.notify_one();
        }
    }

    /// Receiver-side bookkeeping after a response partition is handled:
    /// the in-flight flag clears, and the queue re-enters the ready list
    /// immediately when another usable buffer is waiting.
    pub fn response_done(&self, topic: &str, partition: i32) {
        let became_ready = {
            let mut s = self.state.lock().unwrap();
            let Some(slot) = s.topics.get_mut(topic).and_then(|t| t.get_mut(&partition)) else {
                return;
            };
            slot.queue.set_request_pending(false);
            if !slot.ready && slot.queue.has_ready_buffer(self.kind) {
                slot.ready = true;
                s.ready_count += 1;
                true
            } else {
                false
            }
        };
        if became_ready {
            self.ready_notify.notify_one();
        }
    }

    /// Route a response partition back to its queue.
    pub fn find(&self, topic: &str, partition: i32) -> Option<Arc<PartitionQueue>> {
        let s = self.state.lock().unwrap();
        s.topics
            .get(topic)
            .and_then(|t| t.get(&partition))
            .map(|slot| Arc::clone(&slot.queue))
    }

    /// Collect one batch under the two-phase policy: block until anything
    /// is ready, then top up for at most `max_wait` while the batch is
    /// smaller than `min_requests`.
    ///
    /// The returned queues are in topic/partition order, flagged in-flight,
    /// and removed from the ready list.
    pub async fn collect(&self, min_requests: usize, max_wait: Duration) -> Vec<Arc<PartitionQueue>> {
        loop {
            // Wait for the first ready queue.
            let count = loop {
                let notified = self.ready_notify.notified();
                let count = self.state.lock().unwrap().ready_count;
                if count > 0 {
                    break count;
                }
                notified.await;
            };

            if count < min_requests {
                // Give the bundle a bounded chance to fill up.
                let deadline = Instant::now() + max_wait;
                loop {
                    let notified = self.ready_notify.notified();
                    if self.state.lock().unwrap().ready_count >= min_requests {
                        break;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    if tokio::time::timeout(deadline - now, notified).await.is_err() {
                        break;
                    }
                }
            }

            let batch = self.take_ready();
            if !batch.is_empty() {
                return batch;
            }
            // Raced with a drain; start over.
        }
    }

    /// The `clear_request_lists` step: flag every collected queue as
    /// in-flight and empty the ready list.
    fn take_ready(&self) -> Vec<Arc<PartitionQueue>> {
        let mut s = self.state.lock().unwrap();
        let mut batch = Vec::with_capacity(s.ready_count);
        for partitions in s.topics.values_mut() {
            for slot in partitions.values_mut() {
                if slot.ready {
                    slot.ready = false;
                    slot.queue.set_request_pending(true);
                    batch.push(Arc::clone(&slot.queue));
                }
            }
        }
        s.ready_count = 0;
        batch
    }

    /// Tear-down path: unlink every queue (resetting each to brokerless)
    /// and return them for re-homing.
    pub fn drain(&self) -> Vec<Arc<PartitionQueue>> {
        let topics = {
            let mut s = self.state.lock().unwrap();
            s.ready_count = 0;
            std::mem::take(&mut s.topics)
        };
        let mut queues = Vec::new();
        for (_, partitions) in topics {
            for (_, slot) in partitions {
                slot.queue.detach_bundler();
                queues.push(slot.queue);
            }
        }
        queues
    }

    #[cfg(test)]
    pub fn ready_count(&self) -> usize {
        self.state.lock().unwrap().ready_count
    }
}
