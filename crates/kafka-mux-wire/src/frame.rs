//! Framed I/O over a broker stream.
//!
//! Requests are staged in memory and written with a single `write_all` per
//! RPC; responses are decoded incrementally so large message sets can be
//! copied straight into preallocated buffers without an intermediate
//! allocation. Both halves track the `{size: i32}` frame boundary: the
//! reader refuses to consume past the end of the current frame and the
//! writer back-patches the size once the body is complete.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::codes::ApiKey;
use crate::error::{Result, WireError};

/// Header of a request frame, as read by the broker side.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
}

/// Staging serializer for one request or response frame.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// `chunk_size` is the initial capacity of the staging buffer; it grows
    /// beyond that only for frames that need it.
    pub fn new(inner: W, chunk_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(chunk_size),
        }
    }

    /// Start a client request frame: size slot, api key/version, correlation
    /// id and client id.
    pub fn begin_request(&mut self, api_key: ApiKey, correlation_id: i32, client_id: &str) {
        self.buf.clear();
        self.buf.put_i32(0); // patched in flush
        self.buf.put_i16(api_key.as_i16());
        self.buf.put_i16(0); // api_version
        self.buf.put_i32(correlation_id);
        self.put_string(client_id);
    }

    /// Start a broker response frame: size slot and correlation id.
    pub fn begin_response(&mut self, correlation_id: i32) {
        self.buf.clear();
        self.buf.put_i32(0);
        self.buf.put_i32(correlation_id);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    /// Length-prefixed protocol string (i16 length).
    pub fn put_string(&mut self, s: &str) {
        self.buf.put_i16(s.len() as i16);
        self.buf.put_slice(s.as_bytes());
    }

    /// Length-prefixed byte block (i32 length, -1 for null).
    pub fn put_bytes(&mut self, b: Option<&[u8]>) {
        match b {
            Some(b) => {
                self.buf.put_i32(b.len() as i32);
                self.buf.put_slice(b);
            }
            None => self.buf.put_i32(-1),
        }
    }

    /// Raw bytes without a length prefix (message sets carry their size in
    /// a dedicated field).
    pub fn put_raw(&mut self, b: &[u8]) {
        self.buf.put_slice(b);
    }

    /// Patch the size slot and push the staged frame to the stream in one
    /// write.
    pub async fn flush(&mut self) -> Result<()> {
        let size = (self.buf.len() - 4) as i32;
        self.buf[..4].copy_from_slice(&size.to_be_bytes());
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        self.buf.clear();
        Ok(())
    }
}

/// Incremental deserializer over a buffered stream.
///
/// All reads are bounded by the current frame: consuming more bytes than the
/// frame declared is a codec bug surfaced as [`WireError::Overrun`] rather
/// than a silent desync onto the next frame.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    remaining: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner: BufReader::with_capacity(chunk_size, inner),
            remaining: 0,
        }
    }

    /// Read the next frame's size prefix and enter the frame.
    pub async fn begin_frame(&mut self) -> Result<usize> {
        debug_assert_eq!(self.remaining, 0, "previous frame not fully consumed");
        let mut b = [0u8; 4];
        self.inner.read_exact(&mut b).await?;
        let size = i32::from_be_bytes(b);
        if size < 0 {
            return Err(WireError::Malformed(format!("negative frame size {size}")));
        }
        self.remaining = size as usize;
        Ok(self.remaining)
    }

    /// Client side: enter a response frame and return its correlation id.
    pub async fn read_response_header(&mut self) -> Result<i32> {
        self.begin_frame().await?;
        self.read_i32().await
    }

    /// Broker side: enter a request frame and read the common header.
    pub async fn read_request_header(&mut self) -> Result<RequestHeader> {
        self.begin_frame().await?;
        let raw_key = self.read_i16().await?;
        let api_key = ApiKey::from_i16(raw_key)
            .ok_or_else(|| WireError::Malformed(format!("unknown api key {raw_key}")))?;
        let api_version = self.read_i16().await?;
        let correlation_id = self.read_i32().await?;
        let client_id = self.read_string().await?;
        Ok(RequestHeader {
            api_key,
            api_version,
            correlation_id,
            client_id,
        })
    }

    fn reserve(&mut self, n: usize) -> Result<()> {
        if n > self.remaining {
            return Err(WireError::Overrun {
                needed: n,
                remaining: self.remaining,
            });
        }
        self.remaining -= n;
        Ok(())
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reserve(buf.len())?;
        self.inner.read_exact(buf).await?;
        Ok(())
    }

    pub async fn read_i8(&mut self) -> Result<i8> {
        let mut b = [0u8; 1];
        self.fill(&mut b).await?;
        Ok(b[0] as i8)
    }

    pub async fn read_i16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.fill(&mut b).await?;
        Ok(i16::from_be_bytes(b))
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.fill(&mut b).await?;
        Ok(i32::from_be_bytes(b))
    }

    pub async fn read_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.fill(&mut b).await?;
        Ok(i64::from_be_bytes(b))
    }

    pub async fn read_string(&mut self) -> Result<String> {
        let len = self.read_i16().await?;
        if len < 0 {
            return Err(WireError::Malformed("null string".into()));
        }
        let mut v = vec![0u8; len as usize];
        self.fill(&mut v).await?;
        String::from_utf8(v).map_err(|_| WireError::Malformed("string is not UTF-8".into()))
    }

    pub async fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_i32().await?;
        if len < 0 {
            return Ok(None);
        }
        let mut v = vec![0u8; len as usize];
        self.fill(&mut v).await?;
        Ok(Some(v))
    }

    /// Copy exactly `buf.len()` frame bytes into a caller-owned buffer.
    pub async fn read_exact_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.fill(buf).await
    }

    /// Discard `n` frame bytes.
    pub async fn skip(&mut self, n: usize) -> Result<()> {
        self.reserve(n)?;
        let mut scratch = [0u8; 512];
        let mut left = n;
        while left > 0 {
            let take = left.min(scratch.len());
            self.inner.read_exact(&mut scratch[..take]).await?;
            left -= take;
        }
        Ok(())
    }

    /// Bytes left in the current frame.
    pub fn frame_remaining(&self) -> usize {
        self.remaining
    }

    /// Leave the current frame, discarding whatever the caller did not read.
    pub async fn end_frame(&mut self) -> Result<()> {
        let left = self.remaining;
        if left > 0 {
            self.skip(left).await?;
        }
        Ok(())
    }
}
