//! Lifecycle and dependency orchestration for services
//!
//! Services are registered on a [ServicesModel] through factories and declared
//! dependencies. Starting a [Service] starts everything it depends on first,
//! concurrently, and stopping it stops every dependant which always requires it.
//! State changes are published to [ServiceListener]s such as the [ServiceMonitor].
pub mod builder;
pub mod config;
pub mod dependency_graph;
pub mod errors;
pub mod executor;
pub mod factories;
pub mod model;
pub mod monitor;
pub mod service;
pub mod state;
pub mod types;

pub use builder::ServicesModelBuilder;
pub use config::{LifecycleConfig, ServiceDefinitions};
pub use dependency_graph::{DependencyGraph, ServiceEdge};
pub use errors::{GraphError, GraphErrors, LifecycleError, RegistrationError, ServiceKeyLookupError};
pub use executor::{Action, BatchOutcome, Outcome, RelatedServices, TargetOutcome};
pub use factories::{ServiceFactory, ServiceLifecycle};
pub use model::ServicesModel;
pub use monitor::{ServiceMonitor, ServiceStatus};
pub use service::{Service, ServiceContext};
pub use state::{ServiceListener, ServiceStateChange, State, StopCause};
pub use types::{DependencyDefinition, DependencyType, DynError, Selection, ServiceKey};
