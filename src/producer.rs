//! Producer façade.

use std::sync::Arc;

use kafka_mux_wire::message::{self, MessageSetWriter};
use kafka_mux_wire::Compression;

use crate::buffer::QueueBuffer;
use crate::client::{Client, ClientInner};
use crate::error::{Error, Result};
use crate::queue::{PartitionQueue, WorkerRole};

/// Producer for one partition.
///
/// Records accumulate into the current free buffer as one message set;
/// [`flush`](Producer::flush) (or a full buffer) publishes the set to the
/// pusher, which bundles it with other partitions into a produce request.
/// When every buffer is filled and unacked, [`send`](Producer::send) blocks:
/// that is the back-pressure.
pub struct Producer {
    client: Arc<ClientInner>,
    queue: Arc<PartitionQueue>,
    current: Option<Box<QueueBuffer>>,
    compression: Compression,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer").finish()
    }
}

impl Producer {
    pub fn new(client: &Client, topic: impl Into<String>, partition: i32) -> Result<Self> {
        let config = client.inner.config();
        let compression = config.producer_compression.ok_or_else(|| {
            Error::InvalidConfig(
                "producer_compression must be chosen explicitly before creating producers".into(),
            )
        })?;
        let queue = Arc::new(PartitionQueue::new(
            topic.into(),
            partition,
            WorkerRole::Producer,
            config.consumer_queue_buffers,
            config.consumer_max_bytes,
            0,
        ));
        client.inner.register_worker(&queue)?;
        Ok(Self {
            client: Arc::clone(&client.inner),
            queue,
            current: None,
            compression,
        })
    }

    pub fn topic(&self) -> &str {
        self.queue.topic()
    }

    pub fn partition(&self) -> i32 {
        self.queue.partition()
    }

    /// Append one record to the in-progress message set.
    ///
    /// With nonzero compression configured the value must already be
    /// encoded by the matching codec; this runtime only stamps the
    /// attribute bits.
    pub async fn send(&mut self, key: Option<&[u8]>, value: Option<&[u8]>) -> Result<()> {
        if let Some(error) = self.queue.pending_error() {
            return Err(error);
        }
        let needed = message::record_len(key, value);
        loop {
            let buf = match self.current.as_mut() {
                Some(buf) => buf,
                None => self.current.insert(self.queue.wait_free().await?),
            };
            if needed > buf.capacity() {
                return Err(Error::MessageTooLarge {
                    size: needed,
                    max: buf.capacity(),
                });
            }

            let len = buf.len();
            let (appended, new_len) = {
                let mut writer = MessageSetWriter::resume(buf.storage_mut(), len);
                let appended = writer.append(key, value, self.compression);
                (appended, writer.len())
            };
            if appended {
                buf.set_len(new_len);
                return Ok(());
            }
            // set is full: publish it and roll over to a fresh buffer
            self.publish_current();
        }
    }

    /// Publish the in-progress message set to the pusher. A no-op when
    /// nothing has been written since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(error) = self.queue.pending_error() {
            return Err(error);
        }
        self.publish_current();
        Ok(())
    }

    fn publish_current(&mut self) {
        if let Some(buf) = self.current.take() {
            if buf.is_empty() {
                self.queue.release_free(buf);
            } else {
                self.queue.release_filled(buf);
            }
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.queue.detach();
        if let Some(buf) = self.current.take() {
            self.queue.release_free(buf);
        }
        self.client.unregister_worker(&self.queue);
    }
}
