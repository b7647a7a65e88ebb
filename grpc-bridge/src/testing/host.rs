//! Host-side doubles.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use grpc_bridge_core::encode_frame;
use http::{Method, Uri};
use tokio::runtime::Handle;

use super::lock;
use crate::error::HostError;
use crate::host::{
    BufferPool, ConnectionId, ContentHandler, HandlerRegistration, HeaderList, HostStream,
    HostTransport, PooledBuffer, RequestHead, SocketStats, StreamEvents, StreamId,
};
use crate::metadata::GRPC_CONTENT_TYPE;

/// Buffer pool that hands out fresh buffers and counts them back in.
#[derive(Debug, Default)]
pub struct CountingPool {
    acquired: AtomicUsize,
    released: AtomicUsize,
    fail: AtomicBool,
}

impl CountingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `acquire` fail until called again with `false`.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// A counted buffer holding `bytes`. Never fails.
    pub fn checkout(&self, bytes: &[u8]) -> BytesMut {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        BytesMut::from(bytes)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Buffers acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }
}

impl BufferPool for CountingPool {
    fn acquire(&self, min_capacity: usize) -> Result<BytesMut, HostError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(HostError::PoolExhausted("allocations disabled".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(BytesMut::with_capacity(min_capacity))
    }

    fn release(&self, _buf: BytesMut) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// One write observed on a [`RecordingHostStream`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostWrite {
    Headers {
        headers: HeaderList,
        end_of_stream: bool,
    },
    Data {
        len: usize,
        end_of_stream: bool,
    },
    Trailers(HeaderList),
    Cancel(u32),
}

/// Host stream that records writes instead of sending them.
#[derive(Debug)]
pub struct RecordingHostStream {
    connection: ConnectionId,
    id: StreamId,
    authority: Option<String>,
    writes: Mutex<Vec<HostWrite>>,
    data: Mutex<BytesMut>,
    fail_writes: AtomicBool,
}

impl RecordingHostStream {
    pub fn new(connection: ConnectionId, id: StreamId) -> Self {
        Self {
            connection,
            id,
            authority: None,
            writes: Mutex::new(Vec::new()),
            data: Mutex::new(BytesMut::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// Make every write fail with [`HostError::StreamClosed`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<HostWrite> {
        lock(&self.writes).clone()
    }

    /// Every data write, concatenated.
    pub fn data(&self) -> Bytes {
        lock(&self.data).clone().freeze()
    }

    pub fn cancel_codes(&self) -> Vec<u32> {
        lock(&self.writes)
            .iter()
            .filter_map(|write| match write {
                HostWrite::Cancel(code) => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn record(&self, write: HostWrite) -> Result<(), HostError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HostError::StreamClosed(self.id));
        }
        lock(&self.writes).push(write);
        Ok(())
    }
}

impl HostStream for RecordingHostStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn authority(&self) -> Option<String> {
        self.authority.clone()
    }

    fn write_headers(&self, headers: HeaderList, end_of_stream: bool) -> Result<(), HostError> {
        self.record(HostWrite::Headers {
            headers,
            end_of_stream,
        })
    }

    fn write_data(&self, data: Bytes, end_of_stream: bool) -> Result<(), HostError> {
        self.record(HostWrite::Data {
            len: data.len(),
            end_of_stream,
        })?;
        lock(&self.data).extend_from_slice(&data);
        Ok(())
    }

    fn write_trailers(&self, trailers: HeaderList) -> Result<(), HostError> {
        self.record(HostWrite::Trailers(trailers))
    }

    fn cancel(&self, code: u32) -> Result<(), HostError> {
        self.record(HostWrite::Cancel(code))
    }
}

/// A stream the [`MemoryHost`] dispatched to a handler.
pub struct OpenedStream {
    pub host: Arc<RecordingHostStream>,
    pub events: Arc<dyn StreamEvents>,
    pool: Arc<CountingPool>,
}

impl OpenedStream {
    /// Deliver raw bytes as one data frame.
    pub fn send(&self, bytes: &[u8], end_of_stream: bool) {
        let buf = self.pool.checkout(bytes);
        self.events
            .on_data(PooledBuffer::new(buf, self.pool.clone()), end_of_stream);
    }

    /// Deliver one framed, uncompressed message.
    pub fn send_message(&self, payload: &[u8], end_of_stream: bool) {
        self.send(&encode_frame(payload, false), end_of_stream);
    }

    pub fn close(&self, reset_code: Option<u32>) {
        self.events.on_closed(reset_code);
    }
}

/// In-memory host transport.
///
/// Streams are opened by the test; each is dispatched to the first handler
/// whose content type prefixes the request's `content-type`.
pub struct MemoryHost {
    handlers: Mutex<Vec<(HandlerRegistration, Arc<dyn ContentHandler>)>>,
    next_registration: AtomicU64,
    pool: Arc<CountingPool>,
    scheduler: Handle,
    listen_addr: Option<SocketAddr>,
    fail_registration: AtomicBool,
    dispatched: AtomicUsize,
}

impl MemoryHost {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            pool: Arc::new(CountingPool::new()),
            scheduler: Handle::current(),
            listen_addr: None,
            fail_registration: AtomicBool::new(false),
            dispatched: AtomicUsize::new(0),
        }
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    pub fn pool(&self) -> Arc<CountingPool> {
        self.pool.clone()
    }

    pub fn fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }

    /// Streams accepted by a handler so far.
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Open a `POST` stream for `path` with a gRPC content type.
    pub fn open_stream(&self, connection: u64, id: StreamId, path: &str) -> Option<OpenedStream> {
        let uri = Uri::try_from(path).ok()?;
        let headers = HeaderList::new()
            .with("content-type", GRPC_CONTENT_TYPE)
            .with("te", "trailers");
        self.open_stream_with(
            connection,
            id,
            RequestHead {
                method: Method::POST,
                uri,
                headers,
            },
        )
    }

    /// Dispatch a stream. `None` when no handler matches or the handler refused it.
    pub fn open_stream_with(
        &self,
        connection: u64,
        id: StreamId,
        head: RequestHead,
    ) -> Option<OpenedStream> {
        let content_type = head.headers.get_str("content-type")?;
        let handler = lock(&self.handlers)
            .iter()
            .find(|(_, handler)| content_type.starts_with(handler.content_type()))
            .map(|(_, handler)| handler.clone())?;

        let host = Arc::new(RecordingHostStream::new(ConnectionId(connection), id).with_authority("localhost"));
        let events = handler.on_new_stream(host.clone(), head)?;
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        Some(OpenedStream {
            host,
            events,
            pool: self.pool.clone(),
        })
    }

    /// Close a connection on every registered handler.
    pub fn close_connection(&self, connection: u64) {
        let handlers: Vec<_> = lock(&self.handlers).iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler.on_connection_closed(ConnectionId(connection));
        }
    }
}

impl HostTransport for MemoryHost {
    fn register_handler(
        &self,
        handler: Arc<dyn ContentHandler>,
    ) -> Result<HandlerRegistration, HostError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(HostError::Registration("registration disabled".to_string()));
        }
        let registration = HandlerRegistration(self.next_registration.fetch_add(1, Ordering::SeqCst));
        lock(&self.handlers).push((registration, handler));
        Ok(registration)
    }

    fn unregister_handler(&self, registration: HandlerRegistration) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(r, _)| *r != registration);
        handlers.len() != before
    }

    fn buffer_pool(&self) -> Arc<dyn BufferPool> {
        self.pool.clone()
    }

    fn scheduler(&self) -> Handle {
        self.scheduler.clone()
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    fn socket_stats(&self) -> Option<SocketStats> {
        self.listen_addr.map(|addr| SocketStats {
            local_addr: Some(addr),
            ..SocketStats::default()
        })
    }
}
