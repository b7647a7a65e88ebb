//! Server configuration - connection tuning fixed at build time.
//!
//! Built by [`GrpcServerBuilder`](crate::GrpcServerBuilder), then shared
//! read-only by the transport, its connection handler and every stream.

use std::time::Duration;

/// Default HTTP/2 flow-control window (1 MiB).
pub const DEFAULT_FLOW_CONTROL_WINDOW: u32 = 1024 * 1024;

/// Default maximum inbound message size (4 MiB).
pub const DEFAULT_MAX_INBOUND_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default maximum request header list size (8 KiB).
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 8192;

/// Default interval between server keep-alive pings (2 hours).
pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Default wait for a keep-alive ping acknowledgement (20 seconds).
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Default most frequent client keep-alive the server tolerates (5 minutes).
pub const DEFAULT_PERMIT_KEEPALIVE_TIME: Duration = Duration::from_secs(5 * 60);

/// Smallest keep-alive interval; smaller requests are raised to it.
pub const MIN_KEEPALIVE_TIME: Duration = Duration::from_millis(1);

/// Smallest keep-alive ack timeout; smaller requests are raised to it.
pub const MIN_KEEPALIVE_TIMEOUT: Duration = Duration::from_micros(499);

/// Smallest idle limit; smaller requests are raised to it.
pub const MIN_MAX_CONNECTION_IDLE: Duration = Duration::from_secs(1);

/// Smallest connection age limit; smaller requests are raised to it.
pub const MIN_MAX_CONNECTION_AGE: Duration = Duration::from_secs(1);

/// Durations at or above this are treated as infinite.
pub const AS_LARGE_AS_INFINITE: Duration = Duration::from_secs(1000 * 24 * 60 * 60);

/// Immutable connection tuning.
///
/// `None` durations mean disabled (keep-alive time and timeout, idle, age)
/// or infinite (age grace).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub(crate) max_concurrent_calls_per_connection: Option<u32>,
    pub(crate) flow_control_window: u32,
    pub(crate) max_inbound_message_size: usize,
    pub(crate) max_header_list_size: u32,
    pub(crate) keepalive_time: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
    pub(crate) max_connection_idle: Option<Duration>,
    pub(crate) max_connection_age: Option<Duration>,
    pub(crate) max_connection_age_grace: Option<Duration>,
    pub(crate) permit_keepalive_time: Duration,
    pub(crate) permit_keepalive_without_calls: bool,
    pub(crate) inbound_gate_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls_per_connection: None,
            flow_control_window: DEFAULT_FLOW_CONTROL_WINDOW,
            max_inbound_message_size: DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            keepalive_time: Some(DEFAULT_KEEPALIVE_TIME),
            keepalive_timeout: Some(DEFAULT_KEEPALIVE_TIMEOUT),
            max_connection_idle: None,
            max_connection_age: None,
            max_connection_age_grace: None,
            permit_keepalive_time: DEFAULT_PERMIT_KEEPALIVE_TIME,
            permit_keepalive_without_calls: false,
            inbound_gate_timeout: None,
        }
    }
}

impl ServerConfig {
    /// `None` means unlimited.
    pub fn max_concurrent_calls_per_connection(&self) -> Option<u32> {
        self.max_concurrent_calls_per_connection
    }

    /// Initial flow-control window advertised per stream, in bytes.
    pub fn flow_control_window(&self) -> u32 {
        self.flow_control_window
    }

    /// Largest inbound message accepted, in bytes, after decompression.
    pub fn max_inbound_message_size(&self) -> usize {
        self.max_inbound_message_size
    }

    /// Largest request header block accepted, in bytes.
    pub fn max_header_list_size(&self) -> u32 {
        self.max_header_list_size
    }

    /// Interval between server keep-alive pings. `None` when disabled.
    pub fn keepalive_time(&self) -> Option<Duration> {
        self.keepalive_time
    }

    /// How long to wait for a ping acknowledgement. `None` when disabled.
    pub fn keepalive_timeout(&self) -> Option<Duration> {
        self.keepalive_timeout
    }

    /// Close connections idle for this long. `None` when disabled.
    pub fn max_connection_idle(&self) -> Option<Duration> {
        self.max_connection_idle
    }

    /// Close connections older than this. `None` when disabled.
    pub fn max_connection_age(&self) -> Option<Duration> {
        self.max_connection_age
    }

    /// Time allowed for in-flight calls after `max_connection_age`. `None` is infinite.
    pub fn max_connection_age_grace(&self) -> Option<Duration> {
        self.max_connection_age_grace
    }

    /// Most frequent client keep-alive the server tolerates.
    pub fn permit_keepalive_time(&self) -> Duration {
        self.permit_keepalive_time
    }

    /// Whether clients may ping while no call is active.
    pub fn permit_keepalive_without_calls(&self) -> bool {
        self.permit_keepalive_without_calls
    }

    /// Bound on how long `request(n)` waits for a stream's first inbound frame.
    pub fn inbound_gate_timeout(&self) -> Option<Duration> {
        self.inbound_gate_timeout
    }
}
