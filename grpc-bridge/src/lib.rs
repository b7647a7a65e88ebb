//! # gRPC Bridge
//!
//! Runs an RPC engine's server transport on top of a host's multiplexed-stream
//! transport. The host owns connections, TLS, keep-alive and stream
//! multiplexing; the engine owns call routing and marshalling. This crate
//! implements the engine's transport contract using host primitives.
//!
//! ## Data flow
//!
//! ```text
//! host ──new stream──▶ ConnectionHandler ──stream_created──▶ engine
//! host ──data frame──▶ RpcStream ──deframe──▶ StreamListener
//! engine ──write_*───▶ RpcStream ──headers/data/trailers──▶ host
//! ```
//!
//! ## Modules
//!
//! - [`host`]: the host transport contract the bridge consumes
//! - [`engine`]: the engine transport contract the bridge implements
//! - [`buffer`]: pooled buffer adapters
//! - [`metadata`]: header and metadata translation
//! - [`stream`]: [`RpcStream`] and its state machine
//! - [`handler`]: [`ConnectionHandler`]
//! - [`transport`]: [`BridgeServer`] and [`BridgeTransport`]
//! - [`builder`] / [`config`]: [`GrpcServerBuilder`] and [`ServerConfig`]
//! - [`registry`]: per-application servers
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use grpc_bridge::{ApplicationEvent, ApplicationInfo, ApplicationRegistry, StaticDiscovery};
//!
//! let discovery = Arc::new(StaticDiscovery::new());
//! discovery.insert("orders-svc", ["orders::OrderService"]);
//!
//! let registry = ApplicationRegistry::new(discovery, host, engine);
//! registry.handle_event(ApplicationEvent::Starting(ApplicationInfo::new("orders-svc", catalog)));
//! assert!(registry.contains("orders-svc"));
//! ```

mod bindings;
pub mod buffer;
pub mod builder;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod handler;
pub mod host;
pub mod metadata;
pub mod registry;
pub mod server;
pub mod stream;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use grpc_bridge_core;

pub use buffer::{PooledBufferAllocator, PooledReadableBuffer, PooledWritableBuffer};
pub use builder::GrpcServerBuilder;
pub use config::ServerConfig;
pub use discovery::{
    ApplicationInfo, ServiceCatalog, ServiceDescriptor, ServiceDiscovery, ServiceFactory,
    StaticDiscovery,
};
pub use engine::{
    BindableService, InternalServer, LogId, RpcEngine, ServerListener, ServerTransport,
    ServerTransportListener, StreamListener, StreamSink,
};
pub use error::{
    BridgeError, ConfigError, GateError, HostError, InstantiationError, RegistryError, Result,
};
pub use handler::ConnectionHandler;
pub use host::{
    BufferPool, ConnectionId, ContentHandler, HandlerRegistration, HeaderList, HostStream,
    HostTransport, PooledBuffer, RequestHead, SocketStats, StreamEvents, StreamId,
};
pub use registry::{ApplicationEvent, ApplicationRegistry};
pub use server::GrpcServer;
pub use stream::{InboundGate, Phase, RpcStream};
pub use transport::{BridgeServer, BridgeTransport};
