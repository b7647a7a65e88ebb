//! Length-prefixed message framing and the inbound [`MessageDeframer`].
//!
//! Every message on a stream is framed as:
//!
//! ```text
//! [compressed:1][length:4 big-endian][payload:length]
//! ```
//!
//! The deframer accumulates inbound bytes and releases whole messages only
//! as fast as they are requested.

use bytes::{Buf, Bytes, BytesMut};

use crate::buffer::{BufferError, ReadableBuffer};
use crate::codec::{BoxedCodec, DecompressError};
use crate::status::{Code, Status};

/// Frame header size (flag byte + 32-bit length).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame flag values.
pub mod frame_flags {
    pub const UNCOMPRESSED: u8 = 0x00;
    pub const COMPRESSED: u8 = 0x01;
    /// Bits that must be zero.
    pub const RESERVED_MASK: u8 = 0xFE;
}

/// Frame a payload.
pub fn encode_frame(payload: &[u8], compressed: bool) -> Vec<u8> {
    let flags = if compressed {
        frame_flags::COMPRESSED
    } else {
        frame_flags::UNCOMPRESSED
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.push(flags);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parse `(flags, length)` from the start of `data`, or `None` if fewer than
/// [`FRAME_HEADER_SIZE`] bytes are present.
pub fn parse_frame_header(data: &[u8]) -> Option<(u8, u32)> {
    if data.len() < FRAME_HEADER_SIZE {
        return None;
    }
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Some((data[0], length))
}

/// Inbound deframing failures. All of them end the stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeframeError {
    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Inflation passed the limit and was stopped.
    #[error("decompressed message exceeds maximum of {max} bytes")]
    DecompressedTooLarge { max: usize },

    #[error("compressed message received but no decompressor is configured")]
    CompressedWithoutCodec,

    #[error("failed to decompress message: {0}")]
    Decompression(String),

    #[error("frame header has reserved flag bits set: 0x{0:02x}")]
    ReservedFlags(u8),

    #[error("end of stream with {buffered} bytes of an incomplete message")]
    TruncatedMessage { buffered: usize },

    #[error("data received after end of stream")]
    DataAfterEndOfStream,

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl DeframeError {
    /// Status reported to the peer when this failure ends a stream.
    pub fn to_status(&self) -> Status {
        let code = match self {
            DeframeError::MessageTooLarge { .. } | DeframeError::DecompressedTooLarge { .. } => {
                Code::ResourceExhausted
            }
            _ => Code::Internal,
        };
        Status::new(code, self.to_string())
    }
}

/// Output of [`MessageDeframer::drain`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Deframed {
    /// A complete, decompressed message payload.
    Message(Bytes),
    /// The peer half-closed and every buffered message has been delivered.
    EndOfStream,
}

/// Reassembles framed messages from inbound bytes.
///
/// # Example
///
/// ```
/// use grpc_bridge_core::{encode_frame, BytesReadableBuffer, Deframed, MessageDeframer};
///
/// let mut deframer = MessageDeframer::new(None);
/// let mut wire = encode_frame(b"one", false);
/// wire.extend(encode_frame(b"two", false));
/// deframer.deframe(Box::new(BytesReadableBuffer::new(wire)), true).unwrap();
///
/// // Nothing is released until requested.
/// assert!(deframer.drain().unwrap().is_empty());
///
/// deframer.request(1);
/// assert_eq!(deframer.drain().unwrap(), vec![Deframed::Message("one".into())]);
///
/// deframer.request(5);
/// assert_eq!(
///     deframer.drain().unwrap(),
///     vec![Deframed::Message("two".into()), Deframed::EndOfStream]
/// );
/// ```
#[derive(Debug)]
pub struct MessageDeframer {
    buffer: BytesMut,
    max_message_size: Option<usize>,
    decompressor: Option<BoxedCodec>,
    pending_deliveries: u64,
    end_of_stream: bool,
    end_of_stream_reported: bool,
}

impl MessageDeframer {
    /// Create a deframer. `None` disables the message size check.
    pub fn new(max_message_size: Option<usize>) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
            decompressor: None,
            pending_deliveries: 0,
            end_of_stream: false,
            end_of_stream_reported: false,
        }
    }

    pub fn set_decompressor(&mut self, codec: Option<BoxedCodec>) {
        self.decompressor = codec;
    }

    /// Allow `n` more messages to be released.
    pub fn request(&mut self, n: u32) {
        self.pending_deliveries = self.pending_deliveries.saturating_add(u64::from(n));
    }

    pub fn pending_deliveries(&self) -> u64 {
        self.pending_deliveries
    }

    /// Bytes accumulated but not yet released as messages.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_end_of_stream_received(&self) -> bool {
        self.end_of_stream
    }

    /// Append the contents of `data` and close it.
    pub fn deframe(
        &mut self,
        mut data: Box<dyn ReadableBuffer>,
        end_of_stream: bool,
    ) -> Result<(), DeframeError> {
        if self.end_of_stream {
            data.close();
            return Err(DeframeError::DataAfterEndOfStream);
        }
        let length = data.readable_bytes();
        let copied = data.read_into(&mut self.buffer, length);
        data.close();
        copied?;
        if end_of_stream {
            self.end_of_stream = true;
        }
        Ok(())
    }

    /// Release as many messages as have been requested and are complete.
    pub fn drain(&mut self) -> Result<Vec<Deframed>, DeframeError> {
        self.check_next_header()?;

        let mut out = Vec::new();
        while self.pending_deliveries > 0 {
            match self.next_message()? {
                Some(message) => {
                    self.pending_deliveries -= 1;
                    out.push(Deframed::Message(message));
                }
                None => break,
            }
        }

        if self.end_of_stream && !self.end_of_stream_reported {
            if self.buffer.is_empty() {
                self.end_of_stream_reported = true;
                out.push(Deframed::EndOfStream);
            } else if !self.has_complete_message() {
                return Err(DeframeError::TruncatedMessage {
                    buffered: self.buffer.len(),
                });
            }
        }
        Ok(out)
    }

    fn check_next_header(&self) -> Result<(), DeframeError> {
        let Some((flags, length)) = parse_frame_header(&self.buffer) else {
            return Ok(());
        };
        if flags & frame_flags::RESERVED_MASK != 0 {
            return Err(DeframeError::ReservedFlags(flags));
        }
        self.check_size(length as usize)
    }

    fn check_size(&self, size: usize) -> Result<(), DeframeError> {
        match self.max_message_size {
            Some(max) if size > max => Err(DeframeError::MessageTooLarge { size, max }),
            _ => Ok(()),
        }
    }

    fn has_complete_message(&self) -> bool {
        parse_frame_header(&self.buffer)
            .is_some_and(|(_, length)| self.buffer.len() >= FRAME_HEADER_SIZE + length as usize)
    }

    fn next_message(&mut self) -> Result<Option<Bytes>, DeframeError> {
        self.check_next_header()?;
        if !self.has_complete_message() {
            return Ok(None);
        }
        let Some((flags, length)) = parse_frame_header(&self.buffer) else {
            return Ok(None);
        };
        self.buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.buffer.split_to(length as usize).freeze();

        if flags & frame_flags::COMPRESSED == 0 {
            return Ok(Some(payload));
        }
        let Some(codec) = &self.decompressor else {
            return Err(DeframeError::CompressedWithoutCodec);
        };
        let inflated = codec
            .decompress(&payload, self.max_message_size)
            .map_err(|e| match e {
                DecompressError::LimitExceeded { limit } => {
                    DeframeError::DecompressedTooLarge { max: limit }
                }
                DecompressError::Io(e) => DeframeError::Decompression(e.to_string()),
            })?;
        Ok(Some(inflated))
    }
}
