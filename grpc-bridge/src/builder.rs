//! Builder for a bridge-backed server.
//!
//! Setters for tunables that must be strictly positive return
//! `Result<Self, ConfigError>`. Timing tunables are advisory, so out-of-range
//! values are clamped instead of rejected.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    AS_LARGE_AS_INFINITE, MIN_KEEPALIVE_TIME, MIN_KEEPALIVE_TIMEOUT, MIN_MAX_CONNECTION_AGE,
    MIN_MAX_CONNECTION_IDLE, ServerConfig,
};
use crate::engine::{BindableService, RpcEngine};
use crate::error::ConfigError;
use crate::host::HostTransport;
use crate::server::GrpcServer;
use crate::transport::BridgeServer;

/// Builder for [`GrpcServer`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use grpc_bridge::GrpcServerBuilder;
///
/// let builder = GrpcServerBuilder::new()
///     .max_concurrent_calls_per_connection(100)?
///     .keepalive_time(Duration::from_secs(30))?
///     .max_connection_age(Duration::from_secs(3000 * 24 * 60 * 60))?;
///
/// // 3000 days is treated as infinite
/// assert_eq!(builder.config().max_connection_age(), None);
/// # Ok::<(), grpc_bridge::ConfigError>(())
/// ```
#[derive(Clone, Default)]
pub struct GrpcServerBuilder {
    config: ServerConfig,
    services: Vec<Arc<dyn BindableService>>,
}

fn positive(value: u64, name: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(())
}

fn positive_duration(value: Duration, name: &'static str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::NotPositive { name });
    }
    Ok(())
}

/// `None` at or above the infinite threshold, otherwise at least `min`.
fn clamp_or_disable(value: Duration, min: Duration, name: &'static str) -> Option<Duration> {
    if value >= AS_LARGE_AS_INFINITE {
        tracing::debug!(tunable = name, ?value, "treated as infinite, disabled");
        None
    } else {
        Some(clamp_min(value, min, name))
    }
}

fn clamp_min(value: Duration, min: Duration, name: &'static str) -> Duration {
    if value < min {
        tracing::debug!(tunable = name, ?value, ?min, "raised to minimum");
        min
    } else {
        value
    }
}

impl GrpcServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit concurrent calls on one connection. Unlimited by default.
    pub fn max_concurrent_calls_per_connection(mut self, max: u32) -> Result<Self, ConfigError> {
        positive(u64::from(max), "max_concurrent_calls_per_connection")?;
        self.config.max_concurrent_calls_per_connection = Some(max);
        Ok(self)
    }

    /// Initial per-stream flow-control window in bytes. Must be positive.
    pub fn flow_control_window(mut self, window: u32) -> Result<Self, ConfigError> {
        positive(u64::from(window), "flow_control_window")?;
        self.config.flow_control_window = window;
        Ok(self)
    }

    /// Largest inbound message, after decompression. Larger messages fail
    /// their stream with `RESOURCE_EXHAUSTED`.
    pub fn max_inbound_message_size(mut self, bytes: usize) -> Self {
        self.config.max_inbound_message_size = bytes;
        self
    }

    /// Largest request header block accepted. Larger requests are refused
    /// with `RESOURCE_EXHAUSTED`. Must be positive.
    pub fn max_header_list_size(mut self, bytes: u32) -> Result<Self, ConfigError> {
        positive(u64::from(bytes), "max_header_list_size")?;
        self.config.max_header_list_size = bytes;
        Ok(self)
    }

    /// Ping interval. Raised to [`MIN_KEEPALIVE_TIME`]; values at or above
    /// [`AS_LARGE_AS_INFINITE`] disable keep-alive.
    pub fn keepalive_time(mut self, interval: Duration) -> Result<Self, ConfigError> {
        positive_duration(interval, "keepalive_time")?;
        self.config.keepalive_time = clamp_or_disable(interval, MIN_KEEPALIVE_TIME, "keepalive_time");
        Ok(self)
    }

    /// How long to wait for a ping ack. Raised to [`MIN_KEEPALIVE_TIMEOUT`];
    /// values at or above [`AS_LARGE_AS_INFINITE`] disable the timeout.
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        positive_duration(timeout, "keepalive_timeout")?;
        self.config.keepalive_timeout =
            clamp_or_disable(timeout, MIN_KEEPALIVE_TIMEOUT, "keepalive_timeout");
        Ok(self)
    }

    /// Close connections idle this long. Raised to [`MIN_MAX_CONNECTION_IDLE`];
    /// values at or above [`AS_LARGE_AS_INFINITE`] disable the limit.
    pub fn max_connection_idle(mut self, idle: Duration) -> Result<Self, ConfigError> {
        positive_duration(idle, "max_connection_idle")?;
        self.config.max_connection_idle = clamp_or_disable(idle, MIN_MAX_CONNECTION_IDLE, "max_connection_idle");
        Ok(self)
    }

    /// Close connections older than this. Raised to [`MIN_MAX_CONNECTION_AGE`];
    /// values at or above [`AS_LARGE_AS_INFINITE`] disable the limit.
    pub fn max_connection_age(mut self, age: Duration) -> Result<Self, ConfigError> {
        positive_duration(age, "max_connection_age")?;
        self.config.max_connection_age = clamp_or_disable(age, MIN_MAX_CONNECTION_AGE, "max_connection_age");
        Ok(self)
    }

    /// Grace period after `max_connection_age`. Zero is allowed.
    pub fn max_connection_age_grace(mut self, grace: Duration) -> Self {
        self.config.max_connection_age_grace = clamp_or_disable(grace, Duration::ZERO, "max_connection_age_grace");
        self
    }

    /// Most frequent client keep-alive the server tolerates.
    pub fn permit_keepalive_time(mut self, interval: Duration) -> Self {
        self.config.permit_keepalive_time = interval;
        self
    }

    /// Allow client pings while the connection has no active call.
    pub fn permit_keepalive_without_calls(mut self, permit: bool) -> Self {
        self.config.permit_keepalive_without_calls = permit;
        self
    }

    /// Bound how long `request(n)` waits for a stream's first inbound frame.
    /// Unbounded by default; the call's deadline cancels the stream instead.
    pub fn inbound_gate_timeout(mut self, timeout: Duration) -> Self {
        self.config.inbound_gate_timeout = Some(timeout);
        self
    }

    /// Always fails: TLS belongs to the host listener's configuration.
    pub fn use_transport_security(
        self,
        _cert_chain: &[u8],
        _private_key: &[u8],
    ) -> Result<Self, ConfigError> {
        Err(ConfigError::TransportSecurityUnsupported)
    }

    /// Bind `service` on the built server.
    pub fn add_service(mut self, service: Arc<dyn BindableService>) -> Self {
        self.services.push(service);
        self
    }

    /// Bind each of `services`, in order.
    pub fn add_services(mut self, services: impl IntoIterator<Item = Arc<dyn BindableService>>) -> Self {
        self.services.extend(services);
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Services added so far.
    pub fn services(&self) -> &[Arc<dyn BindableService>] {
        &self.services
    }

    /// The transport servers for this configuration. Always exactly one.
    pub fn build_transport_servers(&self, host: Arc<dyn HostTransport>) -> Vec<BridgeServer> {
        vec![BridgeServer::new(host, Arc::new(self.config.clone()))]
    }

    /// Bind the added services through `engine` on top of `host`.
    pub fn build(self, host: Arc<dyn HostTransport>, engine: Arc<dyn RpcEngine>) -> GrpcServer {
        let transports = self.build_transport_servers(host);
        GrpcServer::new(self.services, transports, engine)
    }
}
