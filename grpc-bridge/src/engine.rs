//! The RPC engine's transport SPI.
//!
//! The engine drives calls; the bridge implements [`InternalServer`],
//! [`ServerTransport`] and [`StreamSink`] for it and calls back into
//! [`ServerListener`], [`ServerTransportListener`] and [`StreamListener`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use grpc_bridge_core::{Metadata, Status, WritableBuffer, WritableBufferAllocator};
use tokio::runtime::Handle;

use crate::error::BridgeError;
use crate::host::{SocketStats, StreamId};

static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier used in transport log lines.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogId {
    kind: &'static str,
    id: u64,
}

impl LogId {
    pub fn allocate(kind: &'static str) -> Self {
        Self {
            kind,
            id: NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.kind, self.id)
    }
}

/// Engine-side receiver for one stream's inbound events.
pub trait StreamListener: Send + Sync + 'static {
    /// One deframed request message.
    fn message_available(&self, message: Bytes);

    /// The client finished sending.
    fn half_closed(&self);

    /// The stream ended; `status` is OK for a normal completion.
    fn closed(&self, status: &Status);
}

/// Per-stream outbound contract the bridge implements for the engine.
pub trait StreamSink: Send + Sync + 'static {
    fn stream_id(&self) -> StreamId;

    /// `:authority` of the request, if the host reported one.
    fn authority(&self) -> Option<String>;

    /// Install the listener that receives deframed messages.
    fn set_listener(&self, listener: Arc<dyn StreamListener>);

    /// Allocator for outbound frame buffers.
    fn allocator(&self) -> Arc<dyn WritableBufferAllocator>;

    /// Ask for `n` more inbound messages. Resolves once the request has been
    /// handed to the deframer.
    fn request(&self, n: u32) -> BoxFuture<'_, Result<(), BridgeError>>;

    fn write_headers(&self, headers: Metadata) -> Result<(), BridgeError>;

    fn write_frame(
        &self,
        frame: Option<Box<dyn WritableBuffer>>,
        flush: bool,
        num_messages: u32,
    ) -> Result<(), BridgeError>;

    fn write_trailers(
        &self,
        trailers: Option<Metadata>,
        headers_sent: bool,
        status: &Status,
    ) -> Result<(), BridgeError>;

    fn cancel(&self, status: &Status);
}

/// Engine-side receiver for one transport.
pub trait ServerTransportListener: Send + Sync + 'static {
    /// A new call arrived. `method` is the full method name without a leading `/`.
    fn stream_created(&self, stream: Arc<dyn StreamSink>, method: &str, headers: Metadata);

    fn transport_terminated(&self);
}

/// Transport object handed to the engine.
pub trait ServerTransport: Send + Sync + 'static {
    /// Shared scheduler for transport-thread callbacks.
    fn scheduler(&self) -> Handle;

    fn shutdown(&self);

    /// Shut down and cancel every live stream with `status`.
    fn shutdown_now(&self, status: Status);

    fn log_id(&self) -> &LogId;

    fn stats(&self) -> Option<SocketStats>;
}

/// Engine-side receiver for server lifecycle.
pub trait ServerListener: Send + Sync + 'static {
    fn transport_created(
        &self,
        transport: Arc<dyn ServerTransport>,
    ) -> Arc<dyn ServerTransportListener>;

    fn server_shutdown(&self);
}

/// The top-level server contract the engine starts and stops.
pub trait InternalServer: Send + Sync + 'static {
    fn start(&self, listener: Arc<dyn ServerListener>) -> Result<(), BridgeError>;

    fn shutdown(&self);

    fn listen_addr(&self) -> Option<SocketAddr>;

    fn listen_socket_stats(&self) -> Option<SocketStats>;
}

/// A service implementation the engine can route calls to.
pub trait BindableService: Send + Sync + 'static {
    /// Fully-qualified service name, e.g. `orders.OrderService`.
    fn service_name(&self) -> &str;
}

/// Entry point into the engine: binds services and produces the listener
/// that handles transports for them.
pub trait RpcEngine: Send + Sync + 'static {
    fn server_listener(&self, services: &[Arc<dyn BindableService>]) -> Arc<dyn ServerListener>;
}
