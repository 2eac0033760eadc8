use std::{
    fmt,
    hash::{Hash, Hasher},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;

use crate::{
    errors::LifecycleError,
    factories::DynLifecycle,
    model::{ServicesModel, ServicesModelInner},
    state::{ServiceStateChange, State, StopCause},
    types::{DynError, ServiceKey},
};

/// A live service instance and its lifecycle state machine
///
/// Services are created by a [ServicesModel] from the factory registered for
/// their key. Identity (equality, hashing) is the [ServiceKey].
pub struct Service {
    key: ServiceKey,
    state: watch::Sender<State>,
    /// Held while a transition is applied and published, so listeners see them in order
    publishing: Mutex<()>,
    lifecycle: Box<dyn DynLifecycle>,
    model: Weak<ServicesModelInner>,
}

/// Outcome of applying a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    from: State,
    to: State,
}
impl Transition {
    fn changed(self) -> bool {
        self.from != self.to
    }
}

impl Service {
    pub(crate) fn new(
        key: ServiceKey,
        lifecycle: Box<dyn DynLifecycle>,
        model: Weak<ServicesModelInner>,
    ) -> Self {
        let (state, _) = watch::channel(State::Initial);
        Service {
            key,
            state,
            publishing: Mutex::new(()),
            lifecycle,
            model,
        }
    }

    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn description(&self) -> Option<&str> {
        self.lifecycle.description()
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Starts all dependencies of this service and then the service itself
    ///
    /// Returns the state the service ends up in. A service which is already
    /// started returns immediately, a service which is being started by another
    /// caller is waited for. Only configuration errors found while resolving the
    /// dependencies are returned as errors, the service is `DependencyFailed` then.
    pub async fn start(&self) -> Result<State, LifecycleError> {
        loop {
            let transition = self.transition(|state| match state {
                State::Starting | State::Started | State::Stopping => None,
                _ => Some(State::Starting),
            });

            match transition.to {
                State::Starting if transition.changed() => break,
                State::Starting => return Ok(self.settled().await),
                // Let the running stop finish, then start again
                State::Stopping => {
                    self.settled().await;
                }
                other => return Ok(other),
            }
        }

        tracing::debug!(service = %self.key, "Starting dependencies");
        let dependencies_started = match self.model() {
            Ok(model) => model.start_dependencies_for(&self.key).await,
            Err(error) => Err(error),
        };

        match dependencies_started {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(service = %self.key, "Service not started, a required dependency failed");
                return Ok(self.finish(State::Starting, State::DependencyFailed));
            }
            Err(error) => {
                tracing::warn!(service = %self.key, "Could not resolve dependencies: {error}");
                self.finish(State::Starting, State::DependencyFailed);
                return Err(error);
            }
        }

        let result = AssertUnwindSafe(self.lifecycle.start(self.context()))
            .catch_unwind()
            .await;

        let next = match flatten_panic(result) {
            Ok(()) => {
                tracing::info!(service = %self.key, "Service started");
                State::Started
            }
            Err(error) => {
                tracing::warn!(service = %self.key, "Service failed to start: {error}");
                State::FailedToStart
            }
        };

        Ok(self.finish(State::Starting, next))
    }

    /// Stops this service, after stopping every dependant which always requires it
    ///
    /// Stopping an already stopped service does nothing. Returns the state the
    /// service ends up in.
    pub async fn stop(&self, cause: StopCause) -> State {
        let transition = self.transition(|state| (!state.is_stopped()).then_some(State::Stopping));

        if !transition.changed() {
            return match transition.to {
                State::Stopping => self.settled().await,
                other => other,
            };
        }

        tracing::debug!(service = %self.key, ?cause, "Stopping dependants");
        if let Ok(model) = self.model() {
            model
                .stop_dependants_of(&self.key, cause == StopCause::Failed)
                .await;
        }

        let result = AssertUnwindSafe(self.lifecycle.stop(self.context()))
            .catch_unwind()
            .await;

        let next = match flatten_panic(result) {
            Ok(()) => {
                tracing::info!(service = %self.key, state = %cause.state(), "Service stopped");
                cause.state()
            }
            Err(error) => {
                tracing::warn!(service = %self.key, "Service failed to stop: {error}");
                State::FailedToStop
            }
        };

        self.finish(State::Stopping, next)
    }

    /// Stops the service with [StopCause::Failed]
    pub async fn fail(&self) -> State {
        self.stop(StopCause::Failed).await
    }

    /// Returns a stopped service to `Initial`
    ///
    /// Does nothing while the service is running or changing state.
    pub fn reset(&self) -> State {
        self.transition(|state| {
            (state.is_stopped() && state != State::Stopping).then_some(State::Initial)
        })
        .to
    }

    /// Fails a start or stop whose task was aborted before it could finish
    pub(crate) fn abandon(&self) -> State {
        let transition = self.transition(|state| match state {
            State::Starting => Some(State::FailedToStart),
            State::Stopping => Some(State::FailedToStop),
            _ => None,
        });
        if transition.changed() {
            tracing::warn!(service = %self.key, "Abandoned while {}", transition.from);
        }
        transition.to
    }

    /// Context handed to the lifecycle of this service
    pub fn context(&self) -> ServiceContext {
        ServiceContext {
            key: self.key.clone(),
            model: self.model.clone(),
        }
    }

    fn model(&self) -> Result<ServicesModel, LifecycleError> {
        self.model
            .upgrade()
            .map(ServicesModel)
            .ok_or_else(|| LifecycleError::ModelDropped(self.key.clone()))
    }

    /// Moves from `expected` to `next`, unless another caller changed the state meanwhile
    fn finish(&self, expected: State, next: State) -> State {
        self.transition(|state| (state == expected).then_some(next))
            .to
    }

    /// Applies `change` to the current state and publishes the transition if it changed anything
    fn transition(&self, change: impl FnOnce(State) -> Option<State>) -> Transition {
        let mut transition = Transition {
            from: State::Initial,
            to: State::Initial,
        };
        let _publishing = self.publishing.lock().unwrap_or_else(PoisonError::into_inner);

        self.state.send_if_modified(|state| {
            transition.from = *state;
            if let Some(next) = change(*state) {
                *state = next;
            }
            transition.to = *state;
            transition.changed()
        });

        if transition.changed() {
            tracing::debug!(service = %self.key, "{} -> {}", transition.from, transition.to);
            if let Some(model) = self.model.upgrade() {
                ServicesModel(model).publish(&ServiceStateChange {
                    key: self.key.clone(),
                    from: transition.from,
                    to: transition.to,
                    at: Utc::now(),
                });
            }
        }

        transition
    }

    /// Waits until no start or stop is in progress
    async fn settled(&self) -> State {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(|state| state.is_settled()).await.map(|state| *state);
        // The sender lives as long as self - the receiver can't be closed here
        settled.unwrap_or_else(|_| self.state())
    }
}

fn flatten_panic(
    result: Result<Result<(), DynError>, Box<dyn std::any::Any + Send>>,
) -> Result<(), DynError> {
    match result {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| message.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Service lifecycle panicked: {message}");
            Err(format!("panicked: {message}").into())
        }
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Service {}
impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}
impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.key, f)
    }
}
impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Handed to a [crate::factories::ServiceLifecycle] when it starts or stops
///
/// Gives access to the dependencies of the service, so start logic can check
/// which optional dependencies came up.
#[derive(Clone)]
pub struct ServiceContext {
    key: ServiceKey,
    model: Weak<ServicesModelInner>,
}
impl ServiceContext {
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    pub fn model(&self) -> Option<ServicesModel> {
        self.model.upgrade().map(ServicesModel)
    }

    /// The instance of a dependency of this service, if it is wired up
    pub fn dependency(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        let model = self.model()?;
        let dependant = model.instance(&self.key)?;
        let dependency = model.instance(key)?;
        model
            .instance_graph()
            .has_dependency(&dependant, &dependency)
            .then_some(dependency)
    }

    pub fn dependency_state(&self, key: &ServiceKey) -> Option<State> {
        self.dependency(key).map(|service| service.state())
    }
}
impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("key", &self.key)
            .finish()
    }
}
