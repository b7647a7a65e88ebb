//! The host transport contract consumed by the bridge.
//!
//! The host owns connection accept, TLS, keep-alive and stream multiplexing.
//! It dispatches new streams whose content type matches a registered
//! [`ContentHandler`], then delivers each stream's frames to the
//! [`StreamEvents`] returned for it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{Method, Uri};
use tokio::runtime::Handle;

use crate::config::ServerConfig;
use crate::error::HostError;

/// Per-connection stream identifier.
pub type StreamId = u32;

/// Identifier of one host connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Ordered header block with raw byte values.
///
/// Pseudo-headers (`:status`, `:path`, ...) are allowed. Values are the raw
/// bytes of the field; any wire encoding is the host's concern.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderList {
    fields: Vec<(String, Bytes)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.push(name, value);
        self
    }

    /// First value for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// First value for `name` as UTF-8.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// HPACK-style list size: name + value + 32 bytes per field.
    pub fn encoded_size(&self) -> usize {
        self.fields.iter().map(|(n, v)| n.len() + v.len() + 32).sum()
    }
}

/// Request line and headers of a newly opened stream.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderList,
}

/// Socket-level statistics, where the host can report them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Pooled byte buffers owned by the host.
pub trait BufferPool: Send + Sync + 'static {
    /// Obtain an empty buffer with at least `min_capacity` bytes of capacity.
    fn acquire(&self, min_capacity: usize) -> Result<BytesMut, HostError>;

    /// Hand a buffer back to the pool.
    fn release(&self, buf: BytesMut);
}

/// A pooled buffer in transit, carrying the pool it must go back to.
pub struct PooledBuffer {
    pub buf: BytesMut,
    pub pool: Arc<dyn BufferPool>,
}

impl PooledBuffer {
    pub fn new(buf: BytesMut, pool: Arc<dyn BufferPool>) -> Self {
        Self { buf, pool }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish_non_exhaustive()
    }
}

/// One low-level multiplexed stream on a host connection.
pub trait HostStream: Send + Sync + 'static {
    fn id(&self) -> StreamId;

    fn connection_id(&self) -> ConnectionId;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// `:authority` of the request, if any.
    fn authority(&self) -> Option<String>;

    fn write_headers(&self, headers: HeaderList, end_of_stream: bool) -> Result<(), HostError>;

    fn write_data(&self, data: Bytes, end_of_stream: bool) -> Result<(), HostError>;

    /// Write a trailer block; always ends the stream.
    fn write_trailers(&self, trailers: HeaderList) -> Result<(), HostError>;

    /// Reset the stream with a numeric error code.
    fn cancel(&self, code: u32) -> Result<(), HostError>;
}

/// Inbound callbacks for one dispatched stream, invoked on host dispatch threads.
pub trait StreamEvents: Send + Sync + 'static {
    /// A data frame arrived. `data` may be empty when it only carries end-of-stream.
    fn on_data(&self, data: PooledBuffer, end_of_stream: bool);

    /// The stream closed; `reset_code` is set when it was reset by the peer or host.
    fn on_closed(&self, reset_code: Option<u32>);
}

/// Receives streams whose content type starts with [`content_type`](Self::content_type).
pub trait ContentHandler: Send + Sync + 'static {
    fn content_type(&self) -> &str;

    /// Connection tuning the host should apply to dispatched connections.
    fn connection_settings(&self) -> &ServerConfig;

    /// A new stream arrived. `None` means the handler refused it.
    fn on_new_stream(
        &self,
        stream: Arc<dyn HostStream>,
        head: RequestHead,
    ) -> Option<Arc<dyn StreamEvents>>;

    /// The connection went away; every stream on it is gone.
    fn on_connection_closed(&self, connection: ConnectionId);
}

/// Token returned by [`HostTransport::register_handler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerRegistration(pub u64);

/// The host transport.
pub trait HostTransport: Send + Sync + 'static {
    fn register_handler(
        &self,
        handler: Arc<dyn ContentHandler>,
    ) -> Result<HandlerRegistration, HostError>;

    /// Stop dispatching to a handler. Returns false if it was not registered.
    fn unregister_handler(&self, registration: HandlerRegistration) -> bool;

    fn buffer_pool(&self) -> Arc<dyn BufferPool>;

    /// Shared scheduler for transport-side work.
    fn scheduler(&self) -> Handle;

    fn listen_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn socket_stats(&self) -> Option<SocketStats> {
        None
    }
}
