//! Readable and writable buffer contracts used between a transport and the
//! RPC engine.
//!
//! A transport hands inbound bytes to the engine as a [`ReadableBuffer`] and
//! receives outbound frames as a [`WritableBuffer`] obtained from its
//! [`WritableBufferAllocator`]. Implementations backed by pooled memory must
//! return that memory exactly once, from [`ReadableBuffer::close`] or
//! [`WritableBuffer::release`].

use std::io;

use bytes::{Buf, Bytes, BytesMut};

/// Buffer access errors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// A read asked for more bytes than remain.
    #[error("buffer underflow: requested {requested} bytes, {available} available")]
    Underflow { requested: usize, available: usize },

    /// A write exceeded the remaining capacity.
    #[error("buffer overflow: writing {requested} bytes, {available} writable")]
    Overflow { requested: usize, available: usize },

    /// The buffer was already closed or released.
    #[error("buffer already released")]
    Released,

    /// The pool could not provide a buffer.
    #[error("failed to allocate {capacity} byte buffer: {reason}")]
    Allocation { capacity: usize, reason: String },
}

/// Inbound bytes handed to the engine.
pub trait ReadableBuffer: Send {
    /// Bytes left to read.
    fn readable_bytes(&self) -> usize;

    /// Advance the read position by `length` bytes.
    fn skip_bytes(&mut self, length: usize) -> Result<(), BufferError>;

    /// Read one unsigned byte.
    fn read_u8(&mut self) -> Result<u8, BufferError>;

    /// Fill `dest` completely.
    fn read_bytes(&mut self, dest: &mut [u8]) -> Result<(), BufferError>;

    /// Move `length` bytes onto the end of `dest`.
    fn read_into(&mut self, dest: &mut BytesMut, length: usize) -> Result<(), BufferError>;

    /// Copy `length` bytes into `dest`.
    fn read_to_writer(&mut self, dest: &mut dyn io::Write, length: usize) -> io::Result<()>;

    /// Split off the next `length` bytes as an independent buffer.
    fn read_buffer(&mut self, length: usize) -> Result<Box<dyn ReadableBuffer>, BufferError>;

    /// Direct view of the unread bytes, when the buffer can expose one.
    fn array(&self) -> Option<&[u8]>;

    /// Release any backing memory. Calling this more than once is a no-op.
    fn close(&mut self);
}

/// Outbound frame bytes produced by the engine.
pub trait WritableBuffer: Send {
    fn write(&mut self, src: &[u8]) -> Result<(), BufferError>;

    fn write_byte(&mut self, byte: u8) -> Result<(), BufferError>;

    /// Bytes that can still be written.
    fn writable_bytes(&self) -> usize;

    /// Bytes written so far.
    fn readable_bytes(&self) -> usize;

    /// The bytes written so far.
    fn written(&self) -> &[u8];

    /// Return backing memory to its pool. Calling this more than once is a no-op.
    fn release(&mut self);
}

/// Source of [`WritableBuffer`]s for outbound frames.
pub trait WritableBufferAllocator: Send + Sync {
    /// Allocate a buffer able to hold at least `capacity_hint` bytes.
    fn allocate(&self, capacity_hint: usize) -> Result<Box<dyn WritableBuffer>, BufferError>;
}

fn check_available(requested: usize, available: usize) -> Result<(), BufferError> {
    if requested > available {
        Err(BufferError::Underflow {
            requested,
            available,
        })
    } else {
        Ok(())
    }
}

/// [`ReadableBuffer`] over reference-counted [`Bytes`] with no pool behind it.
///
/// Used for sub-ranges split off pooled buffers and for engine-side tests.
#[derive(Clone, Debug, Default)]
pub struct BytesReadableBuffer {
    bytes: Bytes,
    closed: bool,
}

impl BytesReadableBuffer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            closed: false,
        }
    }
}

impl ReadableBuffer for BytesReadableBuffer {
    fn readable_bytes(&self) -> usize {
        self.bytes.len()
    }

    fn skip_bytes(&mut self, length: usize) -> Result<(), BufferError> {
        check_available(length, self.bytes.len())?;
        self.bytes.advance(length);
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, BufferError> {
        check_available(1, self.bytes.len())?;
        Ok(self.bytes.get_u8())
    }

    fn read_bytes(&mut self, dest: &mut [u8]) -> Result<(), BufferError> {
        check_available(dest.len(), self.bytes.len())?;
        self.bytes.copy_to_slice(dest);
        Ok(())
    }

    fn read_into(&mut self, dest: &mut BytesMut, length: usize) -> Result<(), BufferError> {
        check_available(length, self.bytes.len())?;
        dest.extend_from_slice(&self.bytes.split_to(length));
        Ok(())
    }

    fn read_to_writer(&mut self, dest: &mut dyn io::Write, length: usize) -> io::Result<()> {
        check_available(length, self.bytes.len())
            .map_err(|e| io::Error::new(io::ErrorKind::UnexpectedEof, e))?;
        let chunk = self.bytes.split_to(length);
        dest.write_all(&chunk)
    }

    fn read_buffer(&mut self, length: usize) -> Result<Box<dyn ReadableBuffer>, BufferError> {
        check_available(length, self.bytes.len())?;
        Ok(Box::new(BytesReadableBuffer::new(self.bytes.split_to(length))))
    }

    fn array(&self) -> Option<&[u8]> {
        if self.closed { None } else { Some(&self.bytes) }
    }

    fn close(&mut self) {
        self.closed = true;
        self.bytes = Bytes::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_readable_buffer_reads() {
        let mut buf = BytesReadableBuffer::new(&b"\x07hello world"[..]);
        assert_eq!(buf.read_u8().unwrap(), 7);

        let mut hello = [0u8; 5];
        buf.read_bytes(&mut hello).unwrap();
        assert_eq!(&hello, b"hello");

        buf.skip_bytes(1).unwrap();
        let mut out = Vec::new();
        buf.read_to_writer(&mut out, 5).unwrap();
        assert_eq!(out, b"world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_bytes_readable_buffer_underflow() {
        let mut buf = BytesReadableBuffer::new(&b"ab"[..]);
        assert_eq!(
            buf.skip_bytes(3),
            Err(BufferError::Underflow {
                requested: 3,
                available: 2
            })
        );
        assert_eq!(buf.readable_bytes(), 2);
    }

    #[test]
    fn test_read_buffer_splits_prefix() {
        let mut buf = BytesReadableBuffer::new(&b"abcdef"[..]);
        let mut head = buf.read_buffer(2).unwrap();
        assert_eq!(head.array(), Some(&b"ab"[..]));
        assert_eq!(buf.array(), Some(&b"cdef"[..]));
        head.close();
        assert_eq!(head.array(), None);
    }
}
