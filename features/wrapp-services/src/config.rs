//! Configuration of the lifecycle orchestration
//!
//! Both types deserialize from any serde format, so a loader can read them from
//! whatever configuration source the application uses:
//!
//! ```json
//! {
//!     "services": [{ "name": "cache" }],
//!     "dependencies": [
//!         { "dependant": { "name": "api" }, "dependency": { "name": "db" }, "type": "always_required" },
//!         { "dependant": { "name": "api" }, "dependency": { "name": "cache" }, "type": "optional" }
//!     ]
//! }
//! ```
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DependencyDefinition, ServiceKey};

/// Timing of start/stop batches
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long a batch waits for its services before counting them as failed
    #[serde(rename = "task_timeout_ms", with = "millis")]
    pub task_timeout: Duration,
    /// How long overdue tasks get to finish before they are aborted
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
}
impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            task_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
impl LifecycleConfig {
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Declared services and dependencies, as fed in by a configuration loader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinitions {
    #[serde(default)]
    pub services: Vec<ServiceKey>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDefinition>,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
