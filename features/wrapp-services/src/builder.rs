use std::sync::Arc;

use crate::{
    config::{LifecycleConfig, ServiceDefinitions},
    errors::GraphErrors,
    factories::{DynServiceFactory, ServiceFactory},
    model::ServicesModel,
    state::ServiceListener,
    types::{DependencyDefinition, DependencyType, ServiceKey},
};

//////////////////////////////////////////////////////////////////////
///
/// Composition of a services model happens in two steps.
/// 1. Register all factories, dependencies and listeners on the builder
/// 2. Build, which validates the whole dependency graph at once
pub struct ServicesModelBuilder {
    config: LifecycleConfig,
    /// Registered factories which can create service instances
    factories: Vec<(ServiceKey, Arc<dyn DynServiceFactory>)>,
    /// Declared services without dependencies of their own
    services: Vec<ServiceKey>,
    dependencies: Vec<DependencyDefinition>,
    listeners: Vec<Arc<dyn ServiceListener>>,
}
impl Default for ServicesModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServicesModelBuilder {
    pub fn new() -> Self {
        ServicesModelBuilder {
            config: LifecycleConfig::default(),
            factories: Vec::new(),
            services: Vec::new(),
            dependencies: Vec::new(),
            listeners: Vec::new(),
        }
    }
}
impl ServicesModelBuilder {
    pub fn config(mut self, config: LifecycleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_factory<Factory: ServiceFactory>(
        mut self,
        key: impl Into<ServiceKey>,
        factory: Factory,
    ) -> Self {
        let factory: Arc<dyn DynServiceFactory> = Arc::new(factory);
        self.factories.push((key.into(), factory));
        self
    }

    pub fn add_dependency(
        mut self,
        dependant: impl Into<ServiceKey>,
        dependency: impl Into<ServiceKey>,
        kind: DependencyType,
    ) -> Self {
        self.dependencies
            .push(DependencyDefinition::new(dependant, dependency, kind));
        self
    }

    pub fn definitions(mut self, definitions: ServiceDefinitions) -> Self {
        self.services.extend(definitions.services);
        self.dependencies.extend(definitions.dependencies);
        self
    }

    pub fn add_listener(mut self, listener: Arc<dyn ServiceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Builds the model
    ///
    /// Every invalid dependency is reported, not just the first one. Invalid
    /// dependencies are never part of the graph.
    pub fn build(self) -> Result<ServicesModel, GraphErrors> {
        let ServicesModelBuilder {
            config,
            factories,
            services,
            dependencies,
            listeners,
        } = self;

        tracing::debug!(
            "Building services model with {} factories and {} dependencies",
            factories.len(),
            dependencies.len()
        );

        let model = ServicesModel::new(config);
        for listener in listeners {
            model.add_listener(listener);
        }
        for (key, factory) in factories {
            model.register_dyn_factory(key, factory);
        }
        for key in services {
            model.add_service(key);
        }

        let errors: Vec<_> = dependencies
            .into_iter()
            .filter_map(|definition| {
                model
                    .add_dependency(definition.dependant, definition.dependency, definition.kind)
                    .err()
            })
            .collect();

        if !errors.is_empty() {
            return Err(GraphErrors { errors });
        }

        Ok(model)
    }
}
