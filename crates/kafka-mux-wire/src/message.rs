//! Kafka v0 message sets.
//!
//! A message set is a plain concatenation of
//! `{offset: i64, size: i32, crc: i32, magic: i8, attributes: i8,
//! key: bytes, value: bytes}` records with no outer length or count. A
//! record whose declared size extends past the end of the set is a partial
//! tail: the broker truncates sets at the fetch byte limit, and the parser
//! treats the truncated record as the end-of-batch marker.

use std::ops::Range;

use crate::codes::Compression;
use crate::error::{Result, WireError};

/// Bytes occupied by the `{offset, size}` prefix of every record.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Minimum value of the `size` field: crc, magic, attributes and the two
/// length prefixes of an empty key and value.
pub const RECORD_OVERHEAD: usize = 14;

/// Bits of the attributes byte carrying the compression codec.
pub const COMPRESSION_MASK: i8 = 0b11;

/// One decoded record, with key/value as ranges into the parsed slice so the
/// caller can hand out borrowed views without copying.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub offset: i64,
    pub attributes: i8,
    pub key: Option<Range<usize>>,
    pub value: Option<Range<usize>>,
    /// Byte offset of the record within the set.
    pub start: usize,
    /// Byte offset one past the record, i.e. the parser position after it.
    pub end: usize,
}

/// Total encoded size of a record with the given key and value.
pub fn record_len(key: Option<&[u8]>, value: Option<&[u8]>) -> usize {
    RECORD_HEADER_SIZE
        + RECORD_OVERHEAD
        + key.map(<[u8]>::len).unwrap_or(0)
        + value.map(<[u8]>::len).unwrap_or(0)
}

/// Cursor-driven parser over a message set slice.
///
/// The cursor only advances past a record once it validated; a CRC failure
/// leaves the cursor on the bad record so the caller may retry or surface
/// the error without losing position.
pub struct MessageSetParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageSetParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_pos(data, 0)
    }

    pub fn with_pos(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Decode the record at the cursor. `Ok(None)` means the set is
    /// exhausted: fewer than 12 bytes remain, or only a partial tail does.
    pub fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let remaining = self.data.len() - self.pos;
        if remaining < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let start = self.pos;
        let offset = read_i64(self.data, start);
        let size = read_i32(self.data, start + 8);
        if size < RECORD_OVERHEAD as i32 {
            return Err(WireError::Malformed(format!(
                "record size {size} below the {RECORD_OVERHEAD} byte minimum"
            )));
        }
        let size = size as usize;
        if size > remaining - RECORD_HEADER_SIZE {
            // partial tail, end of batch
            return Ok(None);
        }

        let body = start + RECORD_HEADER_SIZE;
        let stored = read_i32(self.data, body) as u32;
        let computed = crc32fast::hash(&self.data[body + 4..body + size]);
        if stored != computed {
            return Err(WireError::Crc { stored, computed });
        }

        let magic = self.data[body + 4] as i8;
        if magic != 0 {
            return Err(WireError::Malformed(format!(
                "unsupported message magic {magic}"
            )));
        }
        let attributes = self.data[body + 5] as i8;

        let payload_limit = size - RECORD_OVERHEAD;
        let key_len = read_i32(self.data, body + 6);
        let key = if key_len < 0 {
            None
        } else {
            let key_len = key_len as usize;
            if key_len > payload_limit {
                return Err(WireError::Malformed(format!(
                    "key of {key_len} bytes overruns its {size} byte record"
                )));
            }
            Some(body + 10..body + 10 + key_len)
        };
        let key_bytes = key.as_ref().map(Range::len).unwrap_or(0);

        let value_pos = body + 10 + key_bytes;
        let value_len = read_i32(self.data, value_pos);
        let value = if value_len < 0 {
            None
        } else {
            let value_len = value_len as usize;
            if value_len > payload_limit - key_bytes {
                return Err(WireError::Malformed(format!(
                    "value of {value_len} bytes overruns its {size} byte record"
                )));
            }
            Some(value_pos + 4..value_pos + 4 + value_len)
        };

        self.pos = body + size;
        Ok(Some(RawRecord {
            offset,
            attributes,
            key,
            value,
            start,
            end: self.pos,
        }))
    }
}

/// Offset of the last complete record in a set, scanning headers only.
///
/// Used to compute the next fetch offset after a fill; CRCs are left to the
/// consumer that actually parses the records.
pub fn last_offset(data: &[u8]) -> Option<i64> {
    let mut pos = 0usize;
    let mut last = None;
    while data.len() - pos >= RECORD_HEADER_SIZE {
        let size = read_i32(data, pos + 8);
        if size < 0 || size as usize > data.len() - pos - RECORD_HEADER_SIZE {
            break;
        }
        last = Some(read_i64(data, pos));
        pos += RECORD_HEADER_SIZE + size as usize;
    }
    last
}

/// Appends records to a fixed-size buffer, maintaining the running length.
pub struct MessageSetWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> MessageSetWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self::resume(buf, 0)
    }

    /// Continue appending after `len` bytes already written.
    pub fn resume(buf: &'a mut [u8], len: usize) -> Self {
        debug_assert!(len <= buf.len());
        Self { buf, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one record with offset 0, as producers do (the broker assigns
    /// real offsets on append).
    pub fn append(
        &mut self,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        compression: Compression,
    ) -> bool {
        self.append_with_offset(0, key, value, compression)
    }

    /// Append one record with an explicit offset (broker side of a fetch).
    pub fn append_with_offset(
        &mut self,
        offset: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        compression: Compression,
    ) -> bool {
        let total = record_len(key, value);
        if total > self.buf.len() - self.len {
            return false;
        }
        let start = self.len;
        let mut pos = start;
        write_i64(self.buf, &mut pos, offset);
        write_i32(self.buf, &mut pos, (total - RECORD_HEADER_SIZE) as i32);
        let crc_pos = pos;
        pos += 4;
        self.buf[pos] = 0; // magic
        pos += 1;
        self.buf[pos] = compression.attribute_bits() as u8;
        pos += 1;
        write_block(self.buf, &mut pos, key);
        write_block(self.buf, &mut pos, value);
        debug_assert_eq!(pos, start + total);

        let crc = crc32fast::hash(&self.buf[crc_pos + 4..pos]);
        self.buf[crc_pos..crc_pos + 4].copy_from_slice(&(crc as i32).to_be_bytes());
        self.len = pos;
        true
    }
}

fn read_i32(data: &[u8], pos: usize) -> i32 {
    i32::from_be_bytes(data[pos..pos + 4].try_into().unwrap())
}

fn read_i64(data: &[u8], pos: usize) -> i64 {
    i64::from_be_bytes(data[pos..pos + 8].try_into().unwrap())
}

fn write_i32(buf: &mut [u8], pos: &mut usize, v: i32) {
    buf[*pos..*pos + 4].copy_from_slice(&v.to_be_bytes());
    *pos += 4;
}

fn write_i64(buf: &mut [u8], pos: &mut usize, v: i64) {
    buf[*pos..*pos + 8].copy_from_slice(&v.to_be_bytes());
    *pos += 8;
}

fn write_block(buf: &mut [u8], pos: &mut usize, block: Option<&[u8]>) {
    match block {
        Some(b) => {
            write_i32(buf, pos, b.len() as i32);
            buf[*pos..*pos + b.len()].copy_from_slice(b);
            *pos += b.len();
        }
        None => write_i32(buf, pos, -1),
    }
}
