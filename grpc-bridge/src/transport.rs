//! The engine-facing server and transport objects.
//!
//! [`BridgeServer`] is the engine's [`InternalServer`]: starting it creates a
//! [`BridgeTransport`], asks the engine for that transport's listener and
//! registers a [`ConnectionHandler`] with the host. There is exactly one
//! transport per server; the host multiplexes every connection through it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use grpc_bridge_core::Status;
use tokio::runtime::Handle;

use crate::config::ServerConfig;
use crate::engine::{InternalServer, LogId, ServerListener, ServerTransport};
use crate::error::BridgeError;
use crate::handler::ConnectionHandler;
use crate::host::{HandlerRegistration, HostTransport, SocketStats};

/// The single engine transport of a [`BridgeServer`].
pub struct BridgeTransport {
    host: Arc<dyn HostTransport>,
    log_id: LogId,
    handler: OnceLock<Arc<ConnectionHandler>>,
}

impl BridgeTransport {
    fn new(host: Arc<dyn HostTransport>) -> Self {
        Self {
            host,
            log_id: LogId::allocate("BridgeTransport"),
            handler: OnceLock::new(),
        }
    }

    /// The handler serving this transport's streams, once started.
    pub fn handler(&self) -> Option<&Arc<ConnectionHandler>> {
        self.handler.get()
    }
}

impl ServerTransport for BridgeTransport {
    fn scheduler(&self) -> Handle {
        self.host.scheduler()
    }

    fn shutdown(&self) {
        if let Some(handler) = self.handler.get()
            && handler.shutdown()
        {
            tracing::debug!(transport = %self.log_id, "transport shut down");
        }
    }

    fn shutdown_now(&self, status: Status) {
        self.shutdown();
        if let Some(handler) = self.handler.get() {
            let cancelled = handler.cancel_all(&status);
            tracing::debug!(
                transport = %self.log_id,
                cancelled,
                status = %status,
                "transport shut down, live streams cancelled"
            );
        }
    }

    fn log_id(&self) -> &LogId {
        &self.log_id
    }

    fn stats(&self) -> Option<SocketStats> {
        self.host.socket_stats()
    }
}

struct Running {
    transport: Arc<BridgeTransport>,
    registration: HandlerRegistration,
    listener: Arc<dyn ServerListener>,
}

#[derive(Default)]
enum Lifecycle {
    #[default]
    Idle,
    Running(Running),
    Terminated,
}

/// The engine's server object, backed by a host transport.
pub struct BridgeServer {
    host: Arc<dyn HostTransport>,
    config: Arc<ServerConfig>,
    lifecycle: Mutex<Lifecycle>,
}

impl BridgeServer {
    pub fn new(host: Arc<dyn HostTransport>, config: Arc<ServerConfig>) -> Self {
        Self {
            host,
            config,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The live transport while the server is running.
    pub fn transport(&self) -> Option<Arc<BridgeTransport>> {
        match &*self.lock() {
            Lifecycle::Running(running) => Some(running.transport.clone()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), Lifecycle::Running(_))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InternalServer for BridgeServer {
    fn start(&self, listener: Arc<dyn ServerListener>) -> Result<(), BridgeError> {
        let mut lifecycle = self.lock();
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Err(BridgeError::AlreadyStarted),
            Lifecycle::Terminated => return Err(BridgeError::Shutdown),
        }

        let transport = Arc::new(BridgeTransport::new(self.host.clone()));
        let transport_listener = listener.transport_created(transport.clone());
        let handler = Arc::new(ConnectionHandler::new(
            transport_listener,
            self.config.clone(),
            self.host.buffer_pool(),
        ));
        let _ = transport.handler.set(handler.clone());

        let registration = match self.host.register_handler(handler) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::error!(transport = %transport.log_id, error = %e, "failed to register with host transport");
                transport.shutdown();
                return Err(e.into());
            }
        };

        tracing::info!(
            transport = %transport.log_id,
            listen_addr = ?self.host.listen_addr(),
            "bridge server started"
        );
        *lifecycle = Lifecycle::Running(Running {
            transport,
            registration,
            listener,
        });
        Ok(())
    }

    fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Lifecycle::Terminated);
        let Lifecycle::Running(running) = previous else {
            return;
        };

        if !self.host.unregister_handler(running.registration) {
            tracing::debug!(transport = %running.transport.log_id, "handler was already unregistered");
        }
        running.transport.shutdown();
        running.listener.server_shutdown();
        tracing::info!(transport = %running.transport.log_id, "bridge server stopped");
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        self.host.listen_addr()
    }

    fn listen_socket_stats(&self) -> Option<SocketStats> {
        self.host.socket_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RpcEngine;
    use crate::testing::{MemoryHost, RecordingEngine};
    use grpc_bridge_core::Code;

    fn server(host: &Arc<MemoryHost>) -> BridgeServer {
        BridgeServer::new(host.clone(), Arc::new(ServerConfig::default()))
    }

    #[tokio::test]
    async fn test_start_registers_handler() {
        let host = Arc::new(MemoryHost::new());
        let engine = RecordingEngine::default();
        let server = server(&host);

        server.start(engine.server_listener(&[])).unwrap();
        assert!(server.is_running());
        assert_eq!(host.handler_count(), 1);
        assert!(matches!(
            server.start(engine.server_listener(&[])),
            Err(BridgeError::AlreadyStarted)
        ));
        assert_eq!(engine.listener(0).transports(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let host = Arc::new(MemoryHost::new());
        let engine = RecordingEngine::default();
        let server = server(&host);
        server.start(engine.server_listener(&[])).unwrap();

        server.shutdown();
        server.shutdown();
        assert!(!server.is_running());
        assert_eq!(host.handler_count(), 0);
        assert!(engine.listener(0).is_shut_down());
        assert_eq!(engine.listener(0).transport_listener().terminations(), 1);
        assert!(matches!(
            server.start(engine.server_listener(&[])),
            Err(BridgeError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_registration_failure_propagates() {
        let host = Arc::new(MemoryHost::new());
        host.fail_registration(true);
        let engine = RecordingEngine::default();
        let server = server(&host);

        assert!(matches!(
            server.start(engine.server_listener(&[])),
            Err(BridgeError::Host(_))
        ));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_now_cancels_live_streams() {
        let host = Arc::new(MemoryHost::new());
        let engine = RecordingEngine::default();
        let server = server(&host);
        server.start(engine.server_listener(&[])).unwrap();

        let call = host.open_stream(1, 1, "/orders.Orders/Get").unwrap();
        let transport = server.transport().unwrap();
        transport.shutdown_now(Status::unavailable("going away"));

        assert_eq!(call.host.cancel_codes(), vec![Code::Unavailable.value()]);
        assert_eq!(transport.handler().map(|h| h.active_streams()), Some(0));
        // new streams are refused once the transport is shut down
        assert!(host.open_stream(1, 3, "/orders.Orders/Get").is_none());
    }

    #[tokio::test]
    async fn test_scheduler_and_stats_come_from_host() {
        let addr: SocketAddr = "127.0.0.1:50051".parse().unwrap();
        let host = Arc::new(MemoryHost::new().with_listen_addr(addr));
        let engine = RecordingEngine::default();
        let server = server(&host);
        server.start(engine.server_listener(&[])).unwrap();

        assert_eq!(server.listen_addr(), Some(addr));
        let transport = server.transport().unwrap();
        assert_eq!(transport.stats().and_then(|s| s.local_addr), Some(addr));
        let handle = transport.scheduler();
        assert_eq!(handle.spawn(async { 7 }).await.unwrap(), 7);
    }
}
