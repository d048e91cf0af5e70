#![forbid(unsafe_code)]
//! Primitive-typed byte channels shared by the value codec and the cache files.
//!
//! Every multi-byte quantity is big-endian two's complement. Strings are an
//! `i32` byte length followed by UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{Result, StageError};

/// Sink accepting primitive values.
pub trait WritableChannel {
    /// Writes one unsigned byte.
    fn put_u8(&mut self, v: u8) -> Result<()>;
    /// Writes a big-endian `i16`.
    fn put_i16(&mut self, v: i16) -> Result<()>;
    /// Writes a big-endian `i32`.
    fn put_i32(&mut self, v: i32) -> Result<()>;
    /// Writes a big-endian `i64`.
    fn put_i64(&mut self, v: i64) -> Result<()>;
    /// Writes raw bytes without a length prefix.
    fn put_bytes(&mut self, src: &[u8]) -> Result<()>;

    /// Pushes buffered bytes to the backing store. No-op for memory sinks.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Writes one signed byte.
    fn put_i8(&mut self, v: i8) -> Result<()> {
        self.put_u8(v as u8)
    }

    /// Writes an `f32` through its bit pattern.
    fn put_f32(&mut self, v: f32) -> Result<()> {
        self.put_i32(v.to_bits() as i32)
    }

    /// Writes an `f64` through its bit pattern.
    fn put_f64(&mut self, v: f64) -> Result<()> {
        self.put_i64(v.to_bits() as i64)
    }

    /// Writes a length-prefixed UTF-8 string.
    fn put_string(&mut self, s: &str) -> Result<()> {
        let len = i32::try_from(s.len())
            .map_err(|_| StageError::invalid(format!("string of {} bytes too long", s.len())))?;
        self.put_i32(len)?;
        self.put_bytes(s.as_bytes())
    }
}

/// Source yielding primitive values.
pub trait ReadableChannel {
    /// Reads one unsigned byte.
    fn get_u8(&mut self) -> Result<u8>;
    /// Reads a big-endian `i16`.
    fn get_i16(&mut self) -> Result<i16>;
    /// Reads a big-endian `i32`.
    fn get_i32(&mut self) -> Result<i32>;
    /// Reads a big-endian `i64`.
    fn get_i64(&mut self) -> Result<i64>;
    /// Fills `dst` completely.
    fn get_bytes(&mut self, dst: &mut [u8]) -> Result<()>;

    /// Reads one signed byte.
    fn get_i8(&mut self) -> Result<i8> {
        Ok(self.get_u8()? as i8)
    }

    /// Reads an `f32` from its bit pattern.
    fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.get_i32()? as u32))
    }

    /// Reads an `f64` from its bit pattern.
    fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_i64()? as u64))
    }

    /// Reads a length-prefixed UTF-8 string.
    fn get_string(&mut self) -> Result<String> {
        let len = self.get_i32()?;
        let len = usize::try_from(len)
            .map_err(|_| StageError::corruption(format!("negative string length {len}")))?;
        let mut buf = vec![0u8; len];
        self.get_bytes(&mut buf)?;
        String::from_utf8(buf).map_err(|_| StageError::corruption("invalid UTF-8 string"))
    }
}

/// Byte length of a length-prefixed string.
pub fn string_length(s: &str) -> usize {
    4 + s.len()
}

/// Growable in-memory channel used to assemble chunks before they hit disk.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    inner: BytesMut,
}

impl ByteBuffer {
    /// Creates an empty buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Detaches the written bytes, leaving the buffer empty but keeping capacity.
    pub fn take(&mut self) -> Bytes {
        self.inner.split().freeze()
    }

    /// Drops everything written after the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.inner.truncate(len);
    }

    /// Drops all written bytes.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl WritableChannel for ByteBuffer {
    fn put_u8(&mut self, v: u8) -> Result<()> {
        self.inner.put_u8(v);
        Ok(())
    }

    fn put_i16(&mut self, v: i16) -> Result<()> {
        self.inner.put_i16(v);
        Ok(())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        self.inner.put_i32(v);
        Ok(())
    }

    fn put_i64(&mut self, v: i64) -> Result<()> {
        self.inner.put_i64(v);
        Ok(())
    }

    fn put_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.inner.put_slice(src);
        Ok(())
    }
}

/// Bounded reader over one loaded chunk.
#[derive(Clone, Default)]
pub struct ChunkCursor {
    buf: Bytes,
}

impl ChunkCursor {
    /// Creates a cursor positioned at the start of `buf`.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Replaces the underlying bytes and rewinds.
    pub fn reset(&mut self, buf: Bytes) {
        self.buf = buf;
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(StageError::corruption(format!(
                "chunk truncated: need {} bytes, remaining {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChunkCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCursor")
            .field("remaining", &self.remaining())
            .finish()
    }
}

impl ReadableChannel for ChunkCursor {
    fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    fn get_i16(&mut self) -> Result<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    fn get_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    fn get_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    fn get_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ensure(dst.len())?;
        self.buf.copy_to_slice(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn primitives_roundtrip() {
        let mut buf = ByteBuffer::default();
        buf.put_u8(0xAB).unwrap();
        buf.put_i8(-5).unwrap();
        buf.put_i16(i16::MIN).unwrap();
        buf.put_i32(-42).unwrap();
        buf.put_i64(i64::MAX).unwrap();
        buf.put_f32(1.5).unwrap();
        buf.put_f64(-0.0).unwrap();
        buf.put_string("héllo").unwrap();

        let mut cur = ChunkCursor::new(buf.take());
        assert_eq!(cur.get_u8().unwrap(), 0xAB);
        assert_eq!(cur.get_i8().unwrap(), -5);
        assert_eq!(cur.get_i16().unwrap(), i16::MIN);
        assert_eq!(cur.get_i32().unwrap(), -42);
        assert_eq!(cur.get_i64().unwrap(), i64::MAX);
        assert_eq!(cur.get_f32().unwrap(), 1.5);
        assert!(cur.get_f64().unwrap().is_sign_negative());
        assert_eq!(cur.get_string().unwrap(), "héllo");
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn big_endian_layout() {
        let mut buf = ByteBuffer::default();
        buf.put_i32(1).unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 1]);
    }

    #[test]
    fn overread_is_corruption() {
        let mut cur = ChunkCursor::new(Bytes::from_static(&[1, 2, 3]));
        let err = cur.get_i32().unwrap_err();
        assert!(matches!(err, StageError::Corruption(_)));
    }

    #[test]
    fn negative_string_length_is_corruption() {
        let mut buf = ByteBuffer::default();
        buf.put_i32(-1).unwrap();
        let mut cur = ChunkCursor::new(buf.take());
        assert!(matches!(
            cur.get_string().unwrap_err(),
            StageError::Corruption(_)
        ));
    }

    #[test]
    fn take_keeps_buffer_reusable() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.put_i64(7).unwrap();
        let first = buf.take();
        assert_eq!(first.len(), 8);
        assert!(buf.is_empty());
        buf.put_u8(1).unwrap();
        assert_eq!(buf.len(), 1);
    }

    proptest! {
        #[test]
        fn string_roundtrip_prop(s in ".*") {
            let mut buf = ByteBuffer::default();
            buf.put_string(&s).unwrap();
            prop_assert_eq!(buf.len(), string_length(&s));
            let mut cur = ChunkCursor::new(buf.take());
            prop_assert_eq!(cur.get_string().unwrap(), s);
        }
    }
}
