//! [`GrpcServer`] - a managed server: bound services plus its transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::{BindableService, InternalServer, RpcEngine};
use crate::error::BridgeError;
use crate::transport::BridgeServer;

/// A server built by [`GrpcServerBuilder`](crate::GrpcServerBuilder).
pub struct GrpcServer {
    services: Vec<Arc<dyn BindableService>>,
    transports: Vec<BridgeServer>,
    engine: Arc<dyn RpcEngine>,
    running: AtomicBool,
}

impl GrpcServer {
    pub(crate) fn new(
        services: Vec<Arc<dyn BindableService>>,
        transports: Vec<BridgeServer>,
        engine: Arc<dyn RpcEngine>,
    ) -> Self {
        Self {
            services,
            transports,
            engine,
            running: AtomicBool::new(false),
        }
    }

    /// Bind the services in the engine and start every transport.
    ///
    /// If a transport fails to start, the ones already started are shut down.
    pub fn start(&self) -> Result<(), BridgeError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::AlreadyStarted);
        }
        let listener = self.engine.server_listener(&self.services);
        for (started, transport) in self.transports.iter().enumerate() {
            if let Err(e) = transport.start(listener.clone()) {
                for transport in &self.transports[..started] {
                    transport.shutdown();
                }
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        }
        tracing::info!(services = ?self.service_names(), "server started");
        Ok(())
    }

    /// Stop every transport. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for transport in &self.transports {
            transport.shutdown();
        }
        tracing::info!(services = ?self.service_names(), "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.service_name()).collect()
    }

    pub fn transport_servers(&self) -> &[BridgeServer] {
        &self.transports
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.transports.iter().find_map(|transport| transport.listen_addr())
    }
}

impl Drop for GrpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GrpcServerBuilder;
    use crate::testing::{MemoryHost, NamedService, RecordingEngine};

    #[tokio::test]
    async fn test_start_binds_services() {
        let host = Arc::new(MemoryHost::new());
        let engine = Arc::new(RecordingEngine::default());
        let server = GrpcServerBuilder::new()
            .add_service(Arc::new(NamedService::new("orders.Orders")))
            .build(host.clone(), engine.clone());

        server.start().unwrap();
        assert!(server.is_running());
        assert_eq!(server.transport_servers().len(), 1);
        assert_eq!(engine.listener(0).services(), vec!["orders.Orders".to_string()]);
        assert_eq!(host.handler_count(), 1);

        server.shutdown();
        assert!(!server.is_running());
        assert_eq!(host.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let host = Arc::new(MemoryHost::new());
        host.fail_registration(true);
        let server = GrpcServerBuilder::new().build(host.clone(), Arc::new(RecordingEngine::default()));

        assert!(server.start().is_err());
        assert!(!server.is_running());

        host.fail_registration(false);
        server.start().unwrap();
        assert_eq!(host.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_shuts_down() {
        let host = Arc::new(MemoryHost::new());
        let server = GrpcServerBuilder::new().build(host.clone(), Arc::new(RecordingEngine::default()));
        server.start().unwrap();
        drop(server);
        assert_eq!(host.handler_count(), 0);
    }
}
