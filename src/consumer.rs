//! Consumer façade.

use std::sync::Arc;

use kafka_mux_wire::message::{MessageSetParser, COMPRESSION_MASK};
use kafka_mux_wire::{OFFSET_EARLIEST, WireError};

use crate::buffer::QueueBuffer;
use crate::client::{Client, ClientInner};
use crate::error::{Error, Result};
use crate::queue::{PartitionQueue, WorkerRole};

/// One message, borrowed from the consumer's current buffer.
///
/// The views stay valid until the next [`Consumer::next_message`] call,
/// which may retire the underlying buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Message<'a> {
    pub offset: i64,
    pub key: Option<&'a [u8]>,
    pub value: Option<&'a [u8]>,
}

/// Manually-positioned consumer of one partition.
///
/// Created from a [`Client`] with a starting offset, where `-1` means
/// latest and `-2` earliest. Fetching, batching and leader tracking happen
/// in the background; `next_message` only ever parses local buffers or
/// waits for the next one to arrive.
pub struct Consumer {
    client: Arc<ClientInner>,
    queue: Arc<PartitionQueue>,
    current: Option<Box<QueueBuffer>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish()
    }
}

impl Consumer {
    pub fn new(
        client: &Client,
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
    ) -> Result<Self> {
        let topic = topic.into();
        if offset < OFFSET_EARLIEST {
            return Err(Error::InvalidConfig(format!(
                "offset {offset} is neither a position nor a sentinel"
            )));
        }
        let config = client.inner.config();
        let queue = Arc::new(PartitionQueue::new(
            topic,
            partition,
            WorkerRole::Consumer,
            config.consumer_queue_buffers,
            config.consumer_max_bytes,
            offset,
        ));
        client.inner.register_worker(&queue)?;
        Ok(Self {
            client: Arc::clone(&client.inner),
            queue,
            current: None,
        })
    }

    pub fn topic(&self) -> &str {
        self.queue.topic()
    }

    pub fn partition(&self) -> i32 {
        self.queue.partition()
    }

    /// The next offset this consumer will fetch; a sentinel until resolved.
    pub fn offset(&self) -> i64 {
        self.queue.next_offset()
    }

    /// The next message of the partition, in offset order.
    ///
    /// Blocks while no fetched data is buffered locally. A CRC failure
    /// leaves the parse cursor on the bad record, so the call can be
    /// retried; broker-side failures injected by the runtime surface here.
    pub async fn next_message(&mut self) -> Result<Message<'_>> {
        loop {
            // own the buffer while parsing; error paths put it back so the
            // cursor keeps its position for a retry
            let mut buf = match self.current.take() {
                Some(buf) => buf,
                None => self.queue.wait_filled().await?,
            };

            match MessageSetParser::with_pos(buf.payload(), buf.cursor()).next_record() {
                Ok(Some(record)) => {
                    if record.attributes & COMPRESSION_MASK != 0 {
                        let sole = record.start == 0
                            && matches!(
                                MessageSetParser::with_pos(buf.payload(), record.end)
                                    .next_record(),
                                Ok(None)
                            );
                        self.current = Some(buf);
                        if !sole {
                            return Err(Error::Protocol(
                                "compressed record is not the sole entry of its message set"
                                    .into(),
                            ));
                        }
                        return Err(Error::Protocol(
                            "compressed message sets require an external decompression codec"
                                .into(),
                        ));
                    }
                    buf.set_cursor(record.end);
                    let buf = self.current.insert(buf);
                    let payload = buf.payload();
                    return Ok(Message {
                        offset: record.offset,
                        key: record.key.map(|r| &payload[r]),
                        value: record.value.map(|r| &payload[r]),
                    });
                }
                Ok(None) => {
                    // buffer exhausted; recycle it and wait for the next one
                    self.queue.release_free(buf);
                }
                Err(WireError::Crc { stored, computed }) => {
                    self.current = Some(buf);
                    return Err(Error::Crc { stored, computed });
                }
                Err(error) => {
                    self.current = Some(buf);
                    return Err(error.into());
                }
            }
        }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.queue.detach();
        if let Some(buf) = self.current.take() {
            self.queue.release_free(buf);
        }
        self.client.unregister_worker(&self.queue);
    }
}
