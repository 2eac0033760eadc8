use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// All errors coming out of user code must be Send + Sync
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Identity of a service slot in the dependency graph
///
/// A key exists independently of a live instance. Two services with the same
/// name but a different instance number are different slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub name: Arc<str>,
    #[serde(default)]
    pub instance: u32,
}
impl ServiceKey {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_instance(name, 0)
    }

    pub fn with_instance(name: impl Into<Arc<str>>, instance: u32) -> Self {
        ServiceKey {
            name: name.into(),
            instance,
        }
    }
}
impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instance {
            0 => f.write_str(&self.name),
            instance => write!(f, "{}:{}", self.name, instance),
        }
    }
}
impl From<&str> for ServiceKey {
    fn from(name: &str) -> Self {
        ServiceKey::new(name)
    }
}

/// Strength of a dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// The dependency must keep running for the dependant to keep running
    AlwaysRequired,
    /// The dependency must only be running while the dependant starts
    RequiredOnlyAtStart,
    /// The dependant uses the dependency if available
    Optional,
}
impl DependencyType {
    pub fn is_optional(self) -> bool {
        self == DependencyType::Optional
    }
}
impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DependencyType::AlwaysRequired => "always required",
            DependencyType::RequiredOnlyAtStart => "required only at start",
            DependencyType::Optional => "optional",
        })
    }
}

/// Filter applied to edges when querying the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selection {
    All,
    AlwaysRequired,
    /// AlwaysRequired and RequiredOnlyAtStart
    RequiredAtStart,
    OnlyRequiredAtStart,
    Optional,
}
impl Selection {
    pub fn matches(self, kind: DependencyType) -> bool {
        use DependencyType as T;
        match self {
            Selection::All => true,
            Selection::AlwaysRequired => kind == T::AlwaysRequired,
            Selection::RequiredAtStart => {
                matches!(kind, T::AlwaysRequired | T::RequiredOnlyAtStart)
            }
            Selection::OnlyRequiredAtStart => kind == T::RequiredOnlyAtStart,
            Selection::Optional => kind == T::Optional,
        }
    }
}

/// A declared dependency between two service slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDefinition {
    /// The service which needs the dependency
    pub dependant: ServiceKey,
    /// The service being needed
    pub dependency: ServiceKey,
    #[serde(rename = "type")]
    pub kind: DependencyType,
}
impl DependencyDefinition {
    pub fn new(
        dependant: impl Into<ServiceKey>,
        dependency: impl Into<ServiceKey>,
        kind: DependencyType,
    ) -> Self {
        DependencyDefinition {
            dependant: dependant.into(),
            dependency: dependency.into(),
            kind,
        }
    }
}
