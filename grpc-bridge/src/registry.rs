//! Process-wide map from application name to its running server.
//!
//! Driven by application lifecycle events: an application that exposes RPC
//! services gets one [`GrpcServer`] when it starts, which is shut down and
//! removed when it stops. RPC support is best effort; no failure here
//! stops the application from starting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::builder::GrpcServerBuilder;
use crate::discovery::{ApplicationInfo, ServiceDiscovery};
use crate::engine::RpcEngine;
use crate::error::RegistryError;
use crate::host::HostTransport;
use crate::server::GrpcServer;

/// Application lifecycle events the registry reacts to.
#[derive(Clone, Debug)]
pub enum ApplicationEvent {
    Starting(ApplicationInfo),
    Stopping(String),
}

/// A registry entry. A name is reserved with a `Starting` token before its
/// server is built, so concurrent starts never both reach the host.
enum Slot {
    Starting(u64),
    Running(Arc<GrpcServer>),
}

impl Slot {
    fn server(&self) -> Option<&Arc<GrpcServer>> {
        match self {
            Slot::Starting(_) => None,
            Slot::Running(server) => Some(server),
        }
    }
}

/// One running [`GrpcServer`] per application name.
///
/// Every server is built from the same template builder, so connection
/// tuning is shared across applications.
pub struct ApplicationRegistry {
    servers: DashMap<String, Slot>,
    next_reservation: AtomicU64,
    discovery: Arc<dyn ServiceDiscovery>,
    host: Arc<dyn HostTransport>,
    engine: Arc<dyn RpcEngine>,
    template: GrpcServerBuilder,
}

impl ApplicationRegistry {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        host: Arc<dyn HostTransport>,
        engine: Arc<dyn RpcEngine>,
    ) -> Self {
        Self {
            servers: DashMap::new(),
            next_reservation: AtomicU64::new(1),
            discovery,
            host,
            engine,
            template: GrpcServerBuilder::new(),
        }
    }

    /// Configuration applied to every application's server.
    pub fn with_server_template(mut self, template: GrpcServerBuilder) -> Self {
        self.template = template;
        self
    }

    /// React to one lifecycle event. Failures are logged, never propagated.
    pub fn handle_event(&self, event: ApplicationEvent) {
        match event {
            ApplicationEvent::Starting(application) => {
                if let Err(e) = self.application_starting(&application) {
                    tracing::debug!(application = application.name(), error = %e, "no RPC server for application");
                }
            }
            ApplicationEvent::Stopping(name) => {
                self.application_stopping(&name);
            }
        }
    }

    /// Discover, build, start and register a server for `application`.
    ///
    /// The name is reserved before anything is built, so a concurrent start of
    /// the same application returns `AlreadyRegistered` without touching the
    /// host. If the application stops before its server is up, the server is
    /// shut down and `StoppedWhileStarting` returned.
    pub fn application_starting(
        &self,
        application: &ApplicationInfo,
    ) -> Result<Arc<GrpcServer>, RegistryError> {
        let name = application.name();
        let token = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        match self.servers.entry(name.to_owned()) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyRegistered(name.to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Starting(token));
            }
        }

        match self.start_server(application) {
            Ok(server) => self.promote(name, token, server),
            Err(e) => {
                self.servers
                    .remove_if(name, |_, slot| matches!(slot, Slot::Starting(t) if *t == token));
                Err(e)
            }
        }
    }

    fn start_server(&self, application: &ApplicationInfo) -> Result<Arc<GrpcServer>, RegistryError> {
        let name = application.name();
        let descriptors = self.discovery.discover(application);
        let services = application.instantiate_all(&descriptors);
        if services.is_empty() {
            return Err(RegistryError::NoServices(name.to_owned()));
        }

        let server = Arc::new(
            self.template
                .clone()
                .add_services(services)
                .build(self.host.clone(), self.engine.clone()),
        );
        if let Err(e) = server.start() {
            tracing::error!(
                application = name,
                error = %e,
                "failed to start RPC server, application continues without RPC"
            );
            return Err(RegistryError::Start {
                application: name.to_owned(),
                source: e,
            });
        }

        Ok(server)
    }

    /// Swap this start's reservation for the running server.
    fn promote(
        &self,
        name: &str,
        token: u64,
        server: Arc<GrpcServer>,
    ) -> Result<Arc<GrpcServer>, RegistryError> {
        let promoted = match self.servers.get_mut(name) {
            Some(mut slot) if matches!(*slot, Slot::Starting(t) if t == token) => {
                *slot = Slot::Running(server.clone());
                true
            }
            _ => false,
        };
        if !promoted {
            server.shutdown();
            tracing::info!(application = name, "application stopped while its RPC server was starting");
            return Err(RegistryError::StoppedWhileStarting(name.to_owned()));
        }
        tracing::info!(
            application = name,
            services = ?server.service_names(),
            "registered RPC server"
        );
        Ok(server)
    }

    /// Shut down and remove the server registered for `name`. Returns false
    /// if there was none. A start still in progress is abandoned.
    pub fn application_stopping(&self, name: &str) -> bool {
        let Some((_, slot)) = self.servers.remove(name) else {
            return false;
        };
        let Slot::Running(server) = slot else {
            // the pending start sees its reservation gone and shuts down
            return true;
        };
        server.shutdown();
        tracing::info!(application = name, "deregistered RPC server");
        true
    }

    /// Shut down every registered server.
    pub fn shutdown_all(&self) {
        let names: Vec<_> = self.servers.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.application_stopping(&name);
        }
    }

    /// The running server for `name`. `None` while it is still starting.
    pub fn get(&self, name: &str) -> Option<Arc<GrpcServer>> {
        self.servers.get(name).and_then(|entry| entry.value().server().cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of running servers.
    pub fn len(&self) -> usize {
        self.servers
            .iter()
            .filter(|entry| entry.value().server().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{OnceLock, Weak};

    use crate::discovery::{ServiceCatalog, ServiceDescriptor, StaticDiscovery};
    use crate::testing::{MemoryHost, NamedService, RecordingEngine};

    /// Discovery that calls back into the registry while a start is underway.
    struct ReentrantDiscovery {
        registry: OnceLock<Weak<ApplicationRegistry>>,
        during: fn(&ApplicationRegistry, &ApplicationInfo),
        inner: StaticDiscovery,
    }

    impl ServiceDiscovery for ReentrantDiscovery {
        fn discover(&self, application: &ApplicationInfo) -> Vec<ServiceDescriptor> {
            if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
                (self.during)(&registry, application);
            }
            self.inner.discover(application)
        }
    }

    fn reentrant(
        during: fn(&ApplicationRegistry, &ApplicationInfo),
    ) -> (Arc<MemoryHost>, Arc<ApplicationRegistry>) {
        let host = Arc::new(MemoryHost::new());
        let inner = StaticDiscovery::new();
        inner.insert("A", ["svc::Orders"]);
        let discovery = Arc::new(ReentrantDiscovery {
            registry: OnceLock::new(),
            during,
            inner,
        });
        let registry = Arc::new(ApplicationRegistry::new(
            discovery.clone(),
            host.clone(),
            Arc::new(RecordingEngine::default()),
        ));
        let _ = discovery.registry.set(Arc::downgrade(&registry));
        (host, registry)
    }

    struct Fixture {
        host: Arc<MemoryHost>,
        discovery: Arc<StaticDiscovery>,
        registry: ApplicationRegistry,
    }

    fn fixture() -> Fixture {
        let host = Arc::new(MemoryHost::new());
        let discovery = Arc::new(StaticDiscovery::new());
        let registry = ApplicationRegistry::new(
            discovery.clone(),
            host.clone(),
            Arc::new(RecordingEngine::default()),
        );
        Fixture {
            host,
            discovery,
            registry,
        }
    }

    fn app(name: &str) -> ApplicationInfo {
        let catalog = ServiceCatalog::new()
            .register("svc::Orders", || Ok(Arc::new(NamedService::new("orders.Orders"))));
        ApplicationInfo::new(name, Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let f = fixture();
        f.discovery.insert("A", ["svc::Orders"]);

        let server = f.registry.application_starting(&app("A")).unwrap();
        assert!(server.is_running());
        assert!(f.registry.contains("A"));

        assert!(f.registry.application_stopping("A"));
        assert!(!f.registry.contains("A"));
        assert!(!server.is_running());
        assert_eq!(f.host.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_stopping_unknown_is_noop() {
        let f = fixture();
        assert!(!f.registry.application_stopping("never-registered"));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let f = fixture();
        f.discovery.insert("A", ["svc::Orders"]);
        f.registry.application_starting(&app("A")).unwrap();

        assert!(matches!(
            f.registry.application_starting(&app("A")),
            Err(RegistryError::AlreadyRegistered(name)) if name == "A"
        ));
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.host.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_application_without_services_not_registered() {
        let f = fixture();
        f.discovery.insert("A", ["svc::Unknown"]);
        assert!(matches!(
            f.registry.application_starting(&app("A")),
            Err(RegistryError::NoServices(_))
        ));
        assert!(f.registry.is_empty());
        assert_eq!(f.host.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_application_running() {
        let f = fixture();
        f.discovery.insert("A", ["svc::Orders"]);
        f.host.fail_registration(true);

        // handled, not propagated
        f.registry.handle_event(ApplicationEvent::Starting(app("A")));
        assert!(!f.registry.contains("A"));
    }

    #[tokio::test]
    async fn test_events_drive_lifecycle() {
        let f = fixture();
        f.discovery.insert("A", ["svc::Orders"]);
        f.discovery.insert("B", ["svc::Orders"]);

        f.registry.handle_event(ApplicationEvent::Starting(app("A")));
        f.registry.handle_event(ApplicationEvent::Starting(app("B")));
        assert_eq!(f.registry.len(), 2);

        f.registry.handle_event(ApplicationEvent::Stopping("A".to_string()));
        assert!(!f.registry.contains("A"));
        assert!(f.registry.contains("B"));

        f.registry.shutdown_all();
        assert!(f.registry.is_empty());
        assert_eq!(f.host.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_start_refused_before_reaching_host() {
        let (host, registry) = reentrant(|registry, application| {
            assert!(matches!(
                registry.application_starting(application),
                Err(RegistryError::AlreadyRegistered(_))
            ));
            assert!(!registry.contains("A"));
        });

        registry.application_starting(&app("A")).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(host.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_during_start_shuts_new_server_down() {
        let (host, registry) = reentrant(|registry, _| {
            assert!(registry.application_stopping("A"));
        });

        assert!(matches!(
            registry.application_starting(&app("A")),
            Err(RegistryError::StoppedWhileStarting(name)) if name == "A"
        ));
        assert!(registry.is_empty());
        assert_eq!(host.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_releases_reservation() {
        let f = fixture();
        f.discovery.insert("A", ["svc::Orders"]);
        f.host.fail_registration(true);
        assert!(matches!(
            f.registry.application_starting(&app("A")),
            Err(RegistryError::Start { .. })
        ));

        f.host.fail_registration(false);
        f.registry.application_starting(&app("A")).unwrap();
        assert!(f.registry.contains("A"));
    }
}
