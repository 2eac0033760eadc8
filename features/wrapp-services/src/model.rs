use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, PoisonError, RwLock},
};

use indexmap::{map::Entry, IndexMap};

use crate::{
    builder::ServicesModelBuilder,
    config::{LifecycleConfig, ServiceDefinitions},
    dependency_graph::DependencyGraph,
    errors::{GraphError, LifecycleError, RegistrationError, ServiceKeyLookupError},
    executor::{Action, RelatedServices},
    factories::{DynServiceFactory, ServiceFactory},
    service::Service,
    state::{ServiceListener, ServiceStateChange, StopCause},
    types::{DependencyType, Selection, ServiceKey},
};

/// Orchestrates the lifecycle of all services
///
/// Holds the declared dependencies between service keys (the class graph), the
/// wiring between live instances (the instance graph), and the factories used to
/// create instances on demand.
#[derive(Clone)]
pub struct ServicesModel(pub(crate) Arc<ServicesModelInner>);
pub struct ServicesModelInner {
    config: LifecycleConfig,
    class_graph: DependencyGraph<ServiceKey>,
    instance_graph: DependencyGraph<Arc<Service>>,
    factories: RwLock<HashMap<ServiceKey, Arc<dyn DynServiceFactory>>>,
    instances: RwLock<IndexMap<ServiceKey, Arc<Service>>>,
    listeners: RwLock<Vec<Arc<dyn ServiceListener>>>,
}
impl Debug for ServicesModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_struct("ServicesModel");
        for service in self.services() {
            map.field(&service.key().to_string(), &service.state());
        }
        map.finish()
    }
}
impl Default for ServicesModel {
    fn default() -> Self {
        Self::new(LifecycleConfig::default())
    }
}

// Registration
impl ServicesModel {
    pub fn new(config: LifecycleConfig) -> Self {
        ServicesModel(Arc::new(ServicesModelInner {
            config,
            class_graph: DependencyGraph::new(),
            instance_graph: DependencyGraph::new(),
            factories: RwLock::new(HashMap::new()),
            instances: RwLock::new(IndexMap::new()),
            listeners: RwLock::new(Vec::new()),
        }))
    }

    pub fn builder() -> ServicesModelBuilder {
        ServicesModelBuilder::new()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.0.config
    }

    /// Registers the factory used to create the instance for `key`
    ///
    /// Replaces an earlier factory for the same key, existing instances are kept.
    pub fn register_service_factory<Factory: ServiceFactory>(
        &self,
        key: ServiceKey,
        factory: Factory,
    ) {
        self.register_dyn_factory(key, Arc::new(factory));
    }

    pub(crate) fn register_dyn_factory(
        &self,
        key: ServiceKey,
        factory: Arc<dyn DynServiceFactory>,
    ) {
        self.0.class_graph.add_vertex(key.clone());
        let replaced = self
            .0
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), factory);

        if replaced.is_some() {
            tracing::warn!(service = %key, "Replaced the factory of an already registered service");
        }
    }

    /// Adds the key to the class graph
    ///
    /// Returns true if it was not known before
    pub fn add_service(&self, key: ServiceKey) -> bool {
        self.0.class_graph.add_vertex(key)
    }

    /// Declares that `dependant` depends on `dependency`
    ///
    /// If instances of both already exist they are wired up as well.
    pub fn add_dependency(
        &self,
        dependant: ServiceKey,
        dependency: ServiceKey,
        kind: DependencyType,
    ) -> Result<(), GraphError> {
        self.0
            .class_graph
            .create_dependency(dependant.clone(), dependency.clone(), kind)?;

        if let (Some(dependant), Some(dependency)) =
            (self.instance(&dependant), self.instance(&dependency))
        {
            self.link(&dependant, &dependency, kind);
        }

        Ok(())
    }

    /// Applies a list of declared services and dependencies
    ///
    /// Stops at the first invalid dependency, the ones before it stay applied.
    pub fn apply_definitions(&self, definitions: &ServiceDefinitions) -> Result<(), GraphError> {
        for key in &definitions.services {
            self.add_service(key.clone());
        }
        for definition in &definitions.dependencies {
            self.add_dependency(
                definition.dependant.clone(),
                definition.dependency.clone(),
                definition.kind,
            )?;
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.0
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn publish(&self, change: &ServiceStateChange) {
        for listener in self.listeners() {
            listener.on_state_change(change);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ServiceListener>> {
        self.0
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// Instances
impl ServicesModel {
    /// Gets the instance for `key`, creating it if needed
    ///
    /// A new instance is added to the instance graph together with every declared
    /// edge touching its key. Missing dependency instances are created as well,
    /// dependants are only linked if they already exist.
    ///
    /// If two callers race to create the same key, the factory may run twice but
    /// only one instance is kept. An instance whose dependencies can't be created
    /// stays registered, starting it later fails with the missing keys.
    pub fn service(&self, key: &ServiceKey) -> Result<Arc<Service>, RegistrationError> {
        if let Some(existing) = self.instance(key) {
            return Ok(existing);
        }

        let factory = self
            .factory(key)
            .ok_or_else(|| RegistrationError::MissingFactory(key.clone()))?;

        let lifecycle = factory
            .create(key)
            .map_err(|error| RegistrationError::FactoryFailed {
                key: key.clone(),
                error: Arc::new(error),
            })?;

        let created = Arc::new(Service::new(key.clone(), lifecycle, Arc::downgrade(&self.0)));
        let service = {
            let mut instances = self
                .0
                .instances
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match instances.entry(key.clone()) {
                Entry::Occupied(entry) => return Ok(entry.get().clone()),
                Entry::Vacant(entry) => entry.insert(created).clone(),
            }
        };

        tracing::debug!(service = %key, "Created service instance");
        self.0.class_graph.add_vertex(key.clone());
        self.0.instance_graph.add_vertex(service.clone());
        for listener in self.listeners() {
            listener.on_service_created(key);
        }

        self.wire(&service)?;
        Ok(service)
    }

    /// The instance for `key`, if one was created
    pub fn instance(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        self.0
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// All created instances, in creation order
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.0
            .instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Resolves every key to an instance, creating missing ones
    ///
    /// Fails with all keys which have no factory, not just the first one.
    pub fn services_for(&self, keys: &[ServiceKey]) -> Result<Vec<Arc<Service>>, LifecycleError> {
        let mut resolved = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            match self.service(key) {
                Ok(service) => resolved.push(service),
                Err(RegistrationError::MissingFactory(missing_key)) => {
                    if !missing.contains(&missing_key) {
                        missing.push(missing_key);
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        if !missing.is_empty() {
            return Err(ServiceKeyLookupError { missing }.into());
        }

        Ok(resolved)
    }

    fn factory(&self, key: &ServiceKey) -> Option<Arc<dyn DynServiceFactory>> {
        self.0
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Copies the declared edges of a new instance into the instance graph
    fn wire(&self, service: &Arc<Service>) -> Result<(), RegistrationError> {
        let key = service.key();

        for (dependant_key, kind) in self
            .0
            .class_graph
            .find_dependants_with_kind(key, Selection::All)
        {
            if let Some(dependant) = self.instance(&dependant_key) {
                self.link(&dependant, service, kind);
            }
        }

        for (dependency_key, kind) in self
            .0
            .class_graph
            .find_dependencies_with_kind(key, Selection::All)
        {
            let dependency = self.service(&dependency_key)?;
            self.link(service, &dependency, kind);
        }

        Ok(())
    }

    fn link(&self, dependant: &Arc<Service>, dependency: &Arc<Service>, kind: DependencyType) {
        match self
            .0
            .instance_graph
            .create_dependency(dependant.clone(), dependency.clone(), kind)
        {
            // Wired up by a concurrent creation already
            Ok(()) | Err(GraphError::DuplicateDependency { .. }) => {}
            Err(error) => {
                tracing::error!("Instance graph rejected a declared dependency: {error}")
            }
        }
    }
}

// Orchestration
impl ServicesModel {
    /// Starts every dependency declared for `dependant`, concurrently
    ///
    /// Returns true if all dependencies which are not optional have started.
    /// Optional dependencies are waited for as well, but their outcome is ignored.
    pub async fn start_dependencies_for(
        &self,
        dependant: &ServiceKey,
    ) -> Result<bool, LifecycleError> {
        let declared = self
            .0
            .class_graph
            .find_dependencies_with_kind(dependant, Selection::All);
        if declared.is_empty() {
            return Ok(true);
        }

        let dependant = self.service(dependant)?;
        let keys: Vec<ServiceKey> = declared.iter().map(|(key, _)| key.clone()).collect();
        let dependencies = self.services_for(&keys)?;

        let targets = dependencies
            .into_iter()
            .zip(declared.into_iter().map(|(_, kind)| kind))
            .inspect(|(dependency, kind)| self.link(&dependant, dependency, *kind))
            .collect();

        let outcome = RelatedServices::new(self.0.config.clone())
            .execute(Action::Start, targets)
            .await;

        Ok(outcome.succeeded())
    }

    /// Stops every dependant which always requires `dependency`, concurrently
    ///
    /// Dependants requiring it only at start, or optionally, keep running.
    /// Returns true if all of them ended up stopped for the given reason.
    pub async fn stop_dependants_of(&self, dependency: &ServiceKey, dependency_failed: bool) -> bool {
        let Some(dependency) = self.instance(dependency) else {
            return true;
        };

        let cause = match dependency_failed {
            true => StopCause::DependencyFailed,
            false => StopCause::DependencyStopped,
        };

        RelatedServices::new(self.0.config.clone())
            .stop_dependants_of(self, &dependency, cause)
            .await
            .succeeded()
    }

    /// Stops every instance, failures are logged only
    pub async fn stop_all_services(&self) {
        let targets: Vec<_> = self
            .services()
            .into_iter()
            .map(|service| (service, DependencyType::AlwaysRequired))
            .collect();

        tracing::debug!("Stopping all {} services", targets.len());
        let outcome = RelatedServices::new(self.0.config.clone())
            .execute(Action::Stop(StopCause::Stopped), targets)
            .await;

        for failure in outcome.failures() {
            tracing::warn!(service = %failure.key, "Service did not stop cleanly: {:?}", failure.outcome);
        }
    }
}

// Inspection
impl ServicesModel {
    /// Declared dependencies of `key`
    pub fn find_dependencies(&self, key: &ServiceKey, selection: Selection) -> Vec<ServiceKey> {
        self.0.class_graph.find_dependencies(key, selection)
    }

    /// Declared dependants of `key`
    pub fn find_dependants(&self, key: &ServiceKey, selection: Selection) -> Vec<ServiceKey> {
        self.0.class_graph.find_dependants(key, selection)
    }

    /// Instances `service` is wired to, with the type of each dependency
    pub fn find_instance_dependencies(
        &self,
        service: &Arc<Service>,
    ) -> Vec<(Arc<Service>, DependencyType)> {
        self.0
            .instance_graph
            .find_dependencies_with_kind(service, Selection::All)
    }

    /// Instances wired to `service`, with the type of each dependency
    pub fn find_instance_dependants(
        &self,
        service: &Arc<Service>,
    ) -> Vec<(Arc<Service>, DependencyType)> {
        self.0
            .instance_graph
            .find_dependants_with_kind(service, Selection::All)
    }

    pub fn class_graph(&self) -> &DependencyGraph<ServiceKey> {
        &self.0.class_graph
    }

    pub fn instance_graph(&self) -> &DependencyGraph<Arc<Service>> {
        &self.0.instance_graph
    }
}
