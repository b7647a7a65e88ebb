//! Per-message decompression for inbound messages.
//!
//! A message whose frame carries the compressed flag is inflated with the
//! codec named by the stream's `grpc-encoding` header. Inflation is bounded:
//! a codec stops as soon as its output passes the receive limit, so a small
//! compressed frame cannot expand into an unbounded allocation.

use std::io;
use std::sync::Arc;

use bytes::Bytes;

/// Header naming the per-message encoding of inbound messages.
pub const GRPC_ENCODING_HEADER: &str = "grpc-encoding";

/// Encoding token meaning "no compression".
pub const IDENTITY_ENCODING: &str = "identity";

/// Why a message could not be inflated.
#[derive(Debug, thiserror::Error)]
pub enum DecompressError {
    /// Output passed the limit; inflation stopped there.
    #[error("decompressed message exceeds {limit} bytes")]
    LimitExceeded { limit: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Decompression algorithm for individual inbound messages.
pub trait Codec: Send + Sync + 'static {
    /// Encoding token as used in `grpc-encoding`.
    fn name(&self) -> &'static str;

    /// Inflate `data`. With `Some(limit)`, fails with
    /// [`DecompressError::LimitExceeded`] once more than `limit` bytes are produced.
    fn decompress(&self, data: &[u8], limit: Option<usize>) -> Result<Bytes, DecompressError>;
}

/// Shared, type-erased codec held by a stream's deframer.
#[derive(Clone)]
pub struct BoxedCodec(Arc<dyn Codec>);

impl BoxedCodec {
    pub fn new<C: Codec>(codec: C) -> Self {
        BoxedCodec(Arc::new(codec))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn decompress(&self, data: &[u8], limit: Option<usize>) -> Result<Bytes, DecompressError> {
        self.0.decompress(data, limit)
    }
}

impl std::fmt::Debug for BoxedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxedCodec").field(&self.name()).finish()
    }
}

/// Resolve a `grpc-encoding` token to a codec.
///
/// Returns `None` for `identity` and for encodings this build does not support.
pub fn codec_for_encoding(encoding: &str) -> Option<BoxedCodec> {
    match encoding.trim() {
        #[cfg(feature = "compression-gzip")]
        "gzip" => Some(BoxedCodec::new(GzipCodec)),
        _ => None,
    }
}

/// Read all of `reader`, stopping one byte past `limit`.
pub fn read_bounded(reader: impl io::Read, limit: Option<usize>) -> Result<Bytes, DecompressError> {
    use std::io::Read;

    let mut out = Vec::new();
    match limit {
        Some(limit) => {
            reader.take(limit as u64 + 1).read_to_end(&mut out)?;
            if out.len() > limit {
                return Err(DecompressError::LimitExceeded { limit });
            }
        }
        None => {
            let mut reader = reader;
            reader.read_to_end(&mut out)?;
        }
    }
    Ok(Bytes::from(out))
}

/// Gzip inflation backed by flate2.
#[cfg(feature = "compression-gzip")]
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCodec;

#[cfg(feature = "compression-gzip")]
impl Codec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn decompress(&self, data: &[u8], limit: Option<usize>) -> Result<Bytes, DecompressError> {
        read_bounded(flate2::read::GzDecoder::new(data), limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_unknown_resolve_to_none() {
        assert!(codec_for_encoding(IDENTITY_ENCODING).is_none());
        assert!(codec_for_encoding("snappy").is_none());
    }

    #[test]
    fn test_read_bounded_stops_past_limit() {
        let data = vec![7u8; 100];
        assert_eq!(read_bounded(&data[..], Some(100)).unwrap().len(), 100);
        assert!(matches!(
            read_bounded(&data[..], Some(99)),
            Err(DecompressError::LimitExceeded { limit: 99 })
        ));
        assert_eq!(read_bounded(&data[..], None).unwrap().len(), 100);
    }

    #[cfg(feature = "compression-gzip")]
    fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_resolves_and_decompresses() {
        let codec = codec_for_encoding("gzip").unwrap();
        assert_eq!(codec.name(), "gzip");

        let packed = gzip(b"payload payload payload");
        assert_eq!(
            &codec.decompress(&packed, Some(64)).unwrap()[..],
            b"payload payload payload"
        );
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_inflation_is_bounded() {
        let packed = gzip(&vec![0u8; 8 * 1024 * 1024]);
        assert!(packed.len() < 64 * 1024);

        let err = GzipCodec.decompress(&packed, Some(1024)).unwrap_err();
        assert!(matches!(err, DecompressError::LimitExceeded { limit: 1024 }));
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_rejects_garbage() {
        let codec = BoxedCodec::new(GzipCodec);
        assert!(matches!(
            codec.decompress(b"definitely not gzip", None),
            Err(DecompressError::Io(_))
        ));
    }
}
