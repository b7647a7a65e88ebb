//! Bridge error types.
//!
//! Uses `thiserror`; one enum per concern so callers can tell a host failure
//! apart from a configuration mistake or a stream that already ended.

use std::time::Duration;

use grpc_bridge_core::{BufferError, Status};
use thiserror::Error;

/// A host transport primitive failed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HostError {
    /// The low-level stream is closed or reset.
    #[error("host stream {0} is closed")]
    StreamClosed(u32),

    /// The host could not start dispatching to a handler.
    #[error("host refused handler registration: {0}")]
    Registration(String),

    /// The buffer pool is exhausted or shut down.
    #[error("host buffer pool exhausted: {0}")]
    PoolExhausted(String),

    /// Any other host-side I/O failure.
    #[error("host I/O failure: {0}")]
    Io(String),
}

/// Invalid tuning value passed to the server builder.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A tunable that must be strictly positive was zero.
    #[error("{name} must be positive")]
    NotPositive { name: &'static str },

    /// Transport security is configured on the host listener, not here.
    #[error("transport security is not supported by this transport; configure TLS on the host listener")]
    TransportSecurityUnsupported,
}

/// Why a `request(n)` wait on the inbound gate ended without the gate opening.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum GateError {
    /// The stream ended before its first inbound frame.
    #[error("stream terminated before the first inbound frame")]
    Abandoned,

    /// The configured bound elapsed.
    #[error("no inbound frame within {0:?}")]
    TimedOut(Duration),
}

/// Errors surfaced by the bridge's stream, transport and server objects.
#[derive(Clone, Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("request wait abandoned: {0}")]
    Gate(#[from] GateError),

    /// A write or request reached a stream that already ended.
    #[error("stream {stream_id} already terminated")]
    StreamTerminated { stream_id: u32 },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server is shut down")]
    Shutdown,

    /// The stream ended with a status.
    #[error("stream failed: {0}")]
    Status(Status),
}

/// Errors from the application registry.
#[derive(Clone, Debug, Error)]
pub enum RegistryError {
    #[error("application {0:?} already has a running server")]
    AlreadyRegistered(String),

    #[error("application {0:?} exposes no RPC services")]
    NoServices(String),

    /// The application stopped while its server was starting.
    #[error("application {0:?} stopped before its server finished starting")]
    StoppedWhileStarting(String),

    #[error("failed to start server for application {application:?}: {source}")]
    Start {
        application: String,
        #[source]
        source: BridgeError,
    },
}

/// A discovered service type could not be constructed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InstantiationError {
    #[error("service type {0:?} is not known to the application")]
    UnknownType(String),

    #[error("failed to construct service {type_name:?}: {reason}")]
    Construction { type_name: String, reason: String },
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
