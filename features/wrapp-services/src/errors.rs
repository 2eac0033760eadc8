use std::sync::Arc;

use thiserror::Error;

use crate::types::{DependencyType, DynError, ServiceKey};

/// Errors while changing the dependency graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The edge would close a cycle, it was not added
    #[error("'{dependant}' -> '{dependency}' would create a circular dependency through {path:?}")]
    CycleDetected {
        dependant: String,
        dependency: String,
        /// Path from the dependency back to the dependant
        path: Vec<String>,
    },
    /// The ordered pair already has an edge
    #[error("'{dependant}' already depends on '{dependency}' ({existing})")]
    DuplicateDependency {
        dependant: String,
        dependency: String,
        existing: DependencyType,
    },
}

/// All issues found while building a services model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct GraphErrors {
    pub errors: Vec<GraphError>,
}
impl std::fmt::Display for GraphErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut display = Vec::new();
        display.push("The dependency graph had one or more errors:".to_string());
        for error in &self.errors {
            display.push(format!("- {}", error));
        }
        f.write_str(&display.join("\n"))
    }
}

/// Errors while creating service instances
#[derive(Error, Debug, Clone)]
pub enum RegistrationError {
    /// No factory was registered for the key
    #[error("No factory is registered for service '{0}'")]
    MissingFactory(ServiceKey),
    /// A Factory failed to build
    #[error("Factory for '{key}' failed - error: {error:?}")]
    FactoryFailed {
        key: ServiceKey,
        error: Arc<DynError>,
    },
}

/// A batch of keys could not be resolved to instances
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No service instance could be resolved for: {}", display_keys(.missing))]
pub struct ServiceKeyLookupError {
    pub missing: Vec<ServiceKey>,
}

fn display_keys(keys: &[ServiceKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Configuration errors surfacing from a start chain
#[derive(Error, Debug, Clone)]
pub enum LifecycleError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Lookup(#[from] ServiceKeyLookupError),
    /// The service outlived the model it was created by
    #[error("The services model owning '{0}' was dropped")]
    ModelDropped(ServiceKey),
}
