//! Fixed-size recycled byte buffers.

/// One preallocated buffer of a partition queue.
///
/// On the consume path the receiver fills `storage` with one fetch
/// response's message set and the consumer walks it with `cursor`; on the
/// produce path the producer appends records and `len` tracks the bytes
/// written so far. Buffers never reallocate; `reset` returns one to its
/// pristine state when it re-enters the free list.
#[derive(Debug)]
pub struct QueueBuffer {
    storage: Box<[u8]>,
    len: usize,
    cursor: usize,
}

impl QueueBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Valid bytes: the message set size once filled.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Parse position within the valid bytes.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: usize) {
        debug_assert!(cursor <= self.len);
        self.cursor = cursor;
    }

    /// Mark `len` bytes as valid after a fill.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.storage.len());
        self.len = len;
    }

    /// The valid bytes.
    pub fn payload(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Writable view of the whole storage, for fills and appends.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.cursor = 0;
    }
}

/// Allocate the ring of a new partition queue.
pub fn allocate(count: usize, capacity: usize) -> std::collections::VecDeque<Box<QueueBuffer>> {
    (0..count).map(|_| Box::new(QueueBuffer::new(capacity))).collect()
}
