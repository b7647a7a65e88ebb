//! Adapters exposing host-pooled buffers through the engine's buffer traits.
//!
//! Both adapters hold their pooled memory in an `Option` and hand it back to
//! the pool on the first `close`/`release` (or on drop), so the pool sees
//! each buffer exactly once.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use grpc_bridge_core::{
    BufferError, BytesReadableBuffer, ReadableBuffer, WritableBuffer, WritableBufferAllocator,
};

use crate::host::{BufferPool, PooledBuffer};

/// Smallest buffer requested from the pool for an outbound frame.
pub const MIN_ALLOCATION: usize = 4096;

/// [`ReadableBuffer`] over an inbound pooled buffer.
pub struct PooledReadableBuffer {
    buf: Option<BytesMut>,
    pool: Arc<dyn BufferPool>,
}

impl PooledReadableBuffer {
    pub fn new(pooled: PooledBuffer) -> Self {
        Self {
            buf: Some(pooled.buf),
            pool: pooled.pool,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.buf.is_none()
    }

    fn open(&mut self, requested: usize) -> Result<&mut BytesMut, BufferError> {
        let buf = self.buf.as_mut().ok_or(BufferError::Released)?;
        if requested > buf.len() {
            return Err(BufferError::Underflow {
                requested,
                available: buf.len(),
            });
        }
        Ok(buf)
    }
}

impl ReadableBuffer for PooledReadableBuffer {
    fn readable_bytes(&self) -> usize {
        self.buf.as_ref().map_or(0, BytesMut::len)
    }

    fn skip_bytes(&mut self, length: usize) -> Result<(), BufferError> {
        self.open(length)?.advance(length);
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.open(1)?.get_u8())
    }

    fn read_bytes(&mut self, dest: &mut [u8]) -> Result<(), BufferError> {
        self.open(dest.len())?.copy_to_slice(dest);
        Ok(())
    }

    fn read_into(&mut self, dest: &mut BytesMut, length: usize) -> Result<(), BufferError> {
        let chunk = self.open(length)?.split_to(length);
        dest.put_slice(&chunk);
        Ok(())
    }

    fn read_to_writer(&mut self, dest: &mut dyn io::Write, length: usize) -> io::Result<()> {
        let chunk = self
            .open(length)
            .map_err(|e| io::Error::new(io::ErrorKind::UnexpectedEof, e))?
            .split_to(length);
        dest.write_all(&chunk)
    }

    fn read_buffer(&mut self, length: usize) -> Result<Box<dyn ReadableBuffer>, BufferError> {
        let chunk = self.open(length)?.split_to(length).freeze();
        Ok(Box::new(BytesReadableBuffer::new(chunk)))
    }

    fn array(&self) -> Option<&[u8]> {
        self.buf.as_deref()
    }

    fn close(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Drop for PooledReadableBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

/// [`WritableBuffer`] over an outbound pooled buffer.
pub struct PooledWritableBuffer {
    buf: Option<BytesMut>,
    capacity: usize,
    pool: Arc<dyn BufferPool>,
}

impl PooledWritableBuffer {
    pub fn new(buf: BytesMut, pool: Arc<dyn BufferPool>) -> Self {
        let capacity = buf.capacity();
        Self {
            buf: Some(buf),
            capacity,
            pool,
        }
    }

    fn reserve(&mut self, requested: usize) -> Result<&mut BytesMut, BufferError> {
        let capacity = self.capacity;
        let buf = self.buf.as_mut().ok_or(BufferError::Released)?;
        let available = capacity - buf.len();
        if requested > available {
            return Err(BufferError::Overflow {
                requested,
                available,
            });
        }
        Ok(buf)
    }
}

impl WritableBuffer for PooledWritableBuffer {
    fn write(&mut self, src: &[u8]) -> Result<(), BufferError> {
        self.reserve(src.len())?.put_slice(src);
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), BufferError> {
        self.reserve(1)?.put_u8(byte);
        Ok(())
    }

    fn writable_bytes(&self) -> usize {
        self.buf
            .as_ref()
            .map_or(0, |buf| self.capacity - buf.len())
    }

    fn readable_bytes(&self) -> usize {
        self.buf.as_ref().map_or(0, BytesMut::len)
    }

    fn written(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Drop for PooledWritableBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Allocates outbound frame buffers from the host pool.
#[derive(Clone)]
pub struct PooledBufferAllocator {
    pool: Arc<dyn BufferPool>,
}

impl PooledBufferAllocator {
    pub fn new(pool: Arc<dyn BufferPool>) -> Self {
        Self { pool }
    }
}

impl WritableBufferAllocator for PooledBufferAllocator {
    fn allocate(&self, capacity_hint: usize) -> Result<Box<dyn WritableBuffer>, BufferError> {
        let capacity = capacity_hint.max(MIN_ALLOCATION);
        let buf = self
            .pool
            .acquire(capacity)
            .map_err(|e| BufferError::Allocation {
                capacity,
                reason: e.to_string(),
            })?;
        Ok(Box::new(PooledWritableBuffer::new(buf, self.pool.clone())))
    }
}
