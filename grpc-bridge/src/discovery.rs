//! Finding and constructing an application's RPC services.
//!
//! [`ServiceDiscovery`] names the service types an application exposes;
//! the application's own [`ServiceFactory`] turns each name into an instance.
//! Construction failures are values, not panics, so one bad service never
//! stops the others.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::BindableService;
use crate::error::InstantiationError;

/// A discovered service implementation type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    type_name: String,
}

impl ServiceDescriptor {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name)
    }
}

/// Constructs service instances in an application's own context.
pub trait ServiceFactory: Send + Sync + 'static {
    fn instantiate(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn BindableService>, InstantiationError>;
}

/// Lists the service types an application exposes.
pub trait ServiceDiscovery: Send + Sync + 'static {
    fn discover(&self, application: &ApplicationInfo) -> Vec<ServiceDescriptor>;
}

/// A deployed application, as seen by the registry.
#[derive(Clone)]
pub struct ApplicationInfo {
    name: String,
    factory: Arc<dyn ServiceFactory>,
}

impl ApplicationInfo {
    pub fn new(name: impl Into<String>, factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory(&self) -> &Arc<dyn ServiceFactory> {
        &self.factory
    }

    /// Instantiate every descriptor, keeping the successes.
    ///
    /// Each failure is logged and skipped.
    pub fn instantiate_all(&self, descriptors: &[ServiceDescriptor]) -> Vec<Arc<dyn BindableService>> {
        descriptors
            .iter()
            .filter_map(|descriptor| match self.factory.instantiate(descriptor) {
                Ok(service) => Some(service),
                Err(e) => {
                    tracing::warn!(
                        application = %self.name,
                        service = %descriptor,
                        error = %e,
                        "skipping service that could not be instantiated"
                    );
                    None
                }
            })
            .collect()
    }
}

impl fmt::Debug for ApplicationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationInfo")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

type Constructor =
    Box<dyn Fn() -> Result<Arc<dyn BindableService>, String> + Send + Sync + 'static>;

/// A [`ServiceFactory`] over registered constructors.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use grpc_bridge::{BindableService, ServiceCatalog, ServiceDescriptor, ServiceFactory};
///
/// struct Orders;
///
/// impl BindableService for Orders {
///     fn service_name(&self) -> &str {
///         "orders.Orders"
///     }
/// }
///
/// let catalog = ServiceCatalog::new().register("app::Orders", || Ok(Arc::new(Orders)));
/// let service = catalog.instantiate(&ServiceDescriptor::new("app::Orders")).unwrap();
/// assert_eq!(service.service_name(), "orders.Orders");
/// ```
#[derive(Default)]
pub struct ServiceCatalog {
    constructors: HashMap<String, Constructor>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, S>(mut self, type_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> Result<Arc<S>, String> + Send + Sync + 'static,
        S: BindableService,
    {
        self.constructors.insert(
            type_name.into(),
            Box::new(move || constructor().map(|service| service as Arc<dyn BindableService>)),
        );
        self
    }

    /// Descriptors of every registered type, sorted by name.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        let mut names: Vec<_> = self.constructors.keys().cloned().collect();
        names.sort();
        names.into_iter().map(ServiceDescriptor::new).collect()
    }
}

impl ServiceFactory for ServiceCatalog {
    fn instantiate(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn BindableService>, InstantiationError> {
        let constructor = self
            .constructors
            .get(descriptor.type_name())
            .ok_or_else(|| InstantiationError::UnknownType(descriptor.type_name().to_owned()))?;
        constructor().map_err(|reason| InstantiationError::Construction {
            type_name: descriptor.type_name().to_owned(),
            reason,
        })
    }
}

/// Discovery backed by a per-application index of service type names.
#[derive(Default)]
pub struct StaticDiscovery {
    index: DashMap<String, Vec<ServiceDescriptor>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the service types `application` exposes, replacing any earlier entry.
    pub fn insert<I, S>(&self, application: impl Into<String>, type_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let descriptors = type_names.into_iter().map(ServiceDescriptor::new).collect();
        self.index.insert(application.into(), descriptors);
    }

    pub fn remove(&self, application: &str) {
        self.index.remove(application);
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn discover(&self, application: &ApplicationInfo) -> Vec<ServiceDescriptor> {
        self.index
            .get(application.name())
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::NamedService;

    fn catalog() -> ServiceCatalog {
        ServiceCatalog::new()
            .register("orders::OrderService", || {
                Ok(Arc::new(NamedService::new("orders.OrderService")))
            })
            .register("orders::Broken", || {
                Err::<Arc<NamedService>, _>("missing configuration".to_string())
            })
    }

    #[test]
    fn test_catalog_instantiates_known_types() {
        let service = catalog()
            .instantiate(&ServiceDescriptor::new("orders::OrderService"))
            .unwrap();
        assert_eq!(service.service_name(), "orders.OrderService");
    }

    #[test]
    fn test_catalog_failures_are_values() {
        let catalog = catalog();
        assert!(matches!(
            catalog.instantiate(&ServiceDescriptor::new("orders::Missing")),
            Err(InstantiationError::UnknownType(name)) if name == "orders::Missing"
        ));
        assert!(matches!(
            catalog.instantiate(&ServiceDescriptor::new("orders::Broken")),
            Err(InstantiationError::Construction { reason, .. }) if reason == "missing configuration"
        ));
    }

    #[test]
    fn test_instantiate_all_skips_failures() {
        let app = ApplicationInfo::new("orders-svc", Arc::new(catalog()));
        let descriptors = [
            ServiceDescriptor::new("orders::Broken"),
            ServiceDescriptor::new("orders::OrderService"),
            ServiceDescriptor::new("orders::Missing"),
        ];
        let services = app.instantiate_all(&descriptors);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_name(), "orders.OrderService");
    }

    #[test]
    fn test_static_discovery() {
        let discovery = StaticDiscovery::new();
        discovery.insert("orders-svc", ["orders::OrderService"]);
        let app = ApplicationInfo::new("orders-svc", Arc::new(catalog()));
        let other = ApplicationInfo::new("billing", Arc::new(catalog()));

        assert_eq!(
            discovery.discover(&app),
            vec![ServiceDescriptor::new("orders::OrderService")]
        );
        assert!(discovery.discover(&other).is_empty());
        assert_eq!(catalog().descriptors().len(), 2);
    }
}
