//! In-memory host and engine doubles for exercising the bridge.
//!
//! - [`MemoryHost`] - a [`HostTransport`](crate::HostTransport) that
//!   dispatches streams opened by the test to registered handlers
//! - [`RecordingHostStream`] - a host stream that records every write
//! - [`CountingPool`] - a buffer pool that counts acquires and releases
//! - [`RecordingEngine`] - an [`RpcEngine`](crate::RpcEngine) that records
//!   created calls and the messages delivered to them
//!
//! # Example
//!
//! ```rust,ignore
//! use grpc_bridge::testing::{MemoryHost, NamedService, RecordingEngine};
//!
//! #[tokio::test]
//! async fn test_call_reaches_engine() {
//!     let host = Arc::new(MemoryHost::new());
//!     let engine = Arc::new(RecordingEngine::default());
//!     let server = GrpcServerBuilder::new()
//!         .add_service(Arc::new(NamedService::new("orders.Orders")))
//!         .build(host.clone(), engine.clone());
//!     server.start().unwrap();
//!
//!     let call = host.open_stream(1, 1, "/orders.Orders/Get").unwrap();
//!     call.send_message(b"request", true);
//!     assert_eq!(engine.listener(0).transport_listener().calls().len(), 1);
//! }
//! ```

use std::sync::{Mutex, MutexGuard};

pub mod engine;
pub mod host;

pub use engine::{
    CreatedCall, NamedService, RecordingEngine, RecordingListener, RecordingServerListener,
    RecordingTransportListener,
};
pub use host::{CountingPool, HostWrite, MemoryHost, OpenedStream, RecordingHostStream};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
