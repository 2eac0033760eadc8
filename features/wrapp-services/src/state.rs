use std::fmt;

use chrono::{DateTime, Utc};

use crate::types::ServiceKey;

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Initial,
    Starting,
    Started,
    Failed,
    Stopping,
    Stopped,
    FailedToStart,
    FailedToStop,
    DependencyStopped,
    DependencyFailed,
}
impl State {
    /// Every state except Initial, Starting and Started
    pub fn is_stopped(self) -> bool {
        !matches!(self, State::Initial | State::Starting | State::Started)
    }

    pub fn is_started(self) -> bool {
        self == State::Started
    }

    /// States which are not going to change without a new start/stop request
    pub fn is_settled(self) -> bool {
        !matches!(self, State::Starting | State::Stopping)
    }
}
impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The reason a service is stopped for, which is also the state it ends up in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopCause {
    Stopped,
    DependencyStopped,
    DependencyFailed,
    Failed,
}
impl StopCause {
    pub fn state(self) -> State {
        match self {
            StopCause::Stopped => State::Stopped,
            StopCause::DependencyStopped => State::DependencyStopped,
            StopCause::DependencyFailed => State::DependencyFailed,
            StopCause::Failed => State::Failed,
        }
    }

    /// Whether a service stopped for this cause may end in `state`
    pub fn accepts(self, state: State) -> bool {
        match self {
            StopCause::Stopped | StopCause::DependencyStopped => {
                state.is_stopped() && state != State::FailedToStop
            }
            StopCause::DependencyFailed | StopCause::Failed => state == self.state(),
        }
    }
}

/// Published whenever a service changes its state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStateChange {
    pub key: ServiceKey,
    pub from: State,
    pub to: State,
    pub at: DateTime<Utc>,
}

/// Receives lifecycle notifications from a [crate::model::ServicesModel]
///
/// Notifications are delivered synchronously from the thread performing the
/// transition. Changes of one service arrive in the order they happened, the
/// next transition of that service waits until all listeners returned.
/// Implementations must return quickly and must not start or stop services
/// themselves.
pub trait ServiceListener: Send + Sync + 'static {
    fn on_state_change(&self, change: &ServiceStateChange);

    /// Called once a new service instance was created
    fn on_service_created(&self, key: &ServiceKey) {
        let _ = key;
    }
}
