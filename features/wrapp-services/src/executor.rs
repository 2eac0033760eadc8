use std::{fmt, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    config::LifecycleConfig,
    model::ServicesModel,
    service::Service,
    state::{State, StopCause},
    types::{DependencyType, Selection, ServiceKey},
};

/// What to do with every service of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop(StopCause),
}
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start => f.write_str("start"),
            Action::Stop(cause) => write!(f, "stop ({})", cause.state()),
        }
    }
}

/// What happened to one service of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The action ran and left the service in this state
    Finished(State),
    /// A stop found the service already stopped
    AlreadyStopped(State),
    /// The task panicked or a configuration error surfaced while starting
    TaskFailed(String),
    /// The batch deadline passed before the task finished
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub key: ServiceKey,
    pub kind: DependencyType,
    pub outcome: Outcome,
    /// Whether the outcome counts as success for the batch
    pub success: bool,
}
impl TargetOutcome {
    fn new(action: Action, key: ServiceKey, kind: DependencyType, outcome: Outcome) -> Self {
        let success = match (action, &outcome) {
            // Optional dependencies never fail a start
            (Action::Start, _) if kind.is_optional() => true,
            (Action::Start, Outcome::Finished(state)) => state.is_started(),
            // Already stopped targets must still be stopped for the right reason
            (Action::Stop(cause), Outcome::Finished(state) | Outcome::AlreadyStopped(state)) => {
                if !state.is_stopped() {
                    tracing::error!(
                        service = %key,
                        "Service is {state} right after being asked to {action}"
                    );
                    debug_assert!(
                        state.is_stopped(),
                        "{key} is {state} right after being asked to {action}"
                    );
                }
                cause.accepts(*state)
            }
            (_, Outcome::TaskFailed(_) | Outcome::TimedOut) => false,
            (Action::Start, Outcome::AlreadyStopped(_)) => false,
        };

        TargetOutcome {
            key,
            kind,
            outcome,
            success,
        }
    }
}

/// Aggregated result of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub action: Action,
    pub results: Vec<TargetOutcome>,
}
impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|result| result.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.results.iter().filter(|result| !result.success)
    }
}

/// Runs one action over a batch of related services concurrently
///
/// Every target gets its own task, the batch owns those tasks and waits for
/// all of them before returning. Nested batches (a started dependency starting
/// its own dependencies) run their own tasks, so they never wait on each other.
pub struct RelatedServices {
    config: LifecycleConfig,
}
impl RelatedServices {
    pub fn new(config: LifecycleConfig) -> Self {
        RelatedServices { config }
    }

    /// Starts every dependency `service` is wired to
    pub async fn start_dependencies_of(
        &self,
        model: &ServicesModel,
        service: &Arc<Service>,
    ) -> BatchOutcome {
        let targets = model
            .instance_graph()
            .find_dependencies_with_kind(service, Selection::All);
        self.execute(Action::Start, targets).await
    }

    /// Stops every dependant which always requires `service`
    pub async fn stop_dependants_of(
        &self,
        model: &ServicesModel,
        service: &Arc<Service>,
        cause: StopCause,
    ) -> BatchOutcome {
        let targets = model
            .instance_graph()
            .find_dependants_with_kind(service, Selection::AlwaysRequired);
        self.execute(Action::Stop(cause), targets).await
    }

    /// Runs `action` on all targets and waits for every one of them
    ///
    /// Failures of single targets (panics, timeouts) are logged and reported in
    /// the outcome, they never abort the rest of the batch.
    pub async fn execute(
        &self,
        action: Action,
        targets: Vec<(Arc<Service>, DependencyType)>,
    ) -> BatchOutcome {
        if targets.is_empty() {
            return BatchOutcome {
                action,
                results: Vec::new(),
            };
        }

        tracing::debug!("Dispatching {action} to {} services", targets.len());
        let deadline = Instant::now() + self.config.task_timeout;

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(service, kind)| {
                let handle = tokio::spawn(run(action, service.clone()));
                (service, kind, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        let mut overdue = Vec::new();

        // Joined in submission order, completion order is arbitrary
        for (service, kind, mut handle) in tasks {
            let joined = tokio::time::timeout_at(deadline, &mut handle).await.ok();

            let outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(error)) => {
                    tracing::error!(service = %service, "Failed to {action}: {error}");
                    Outcome::TaskFailed(error.to_string())
                }
                None => {
                    tracing::warn!(service = %service, "Did not {action} before the deadline");
                    overdue.push((service.clone(), handle));
                    Outcome::TimedOut
                }
            };

            results.push(TargetOutcome::new(action, service.key().clone(), kind, outcome));
        }

        self.shutdown(overdue).await;

        let outcome = BatchOutcome { action, results };
        tracing::debug!(
            "Finished {action} of {} services, succeeded: {}",
            outcome.results.len(),
            outcome.succeeded()
        );
        outcome
    }

    /// Gives overdue tasks the grace period to finish, then aborts them
    ///
    /// Services whose task was aborted mid-transition are marked as failed,
    /// otherwise they would stay `Starting` or `Stopping` forever.
    async fn shutdown(&self, overdue: Vec<(Arc<Service>, JoinHandle<Outcome>)>) {
        if overdue.is_empty() {
            return;
        }

        let (services, mut handles): (Vec<_>, Vec<_>) = overdue.into_iter().unzip();
        let grace = self.config.shutdown_grace;
        let finished =
            tokio::time::timeout(grace, futures::future::join_all(handles.iter_mut())).await;
        if finished.is_ok() {
            return;
        }

        tracing::warn!(
            "{} tasks still running after {grace:?}, aborting them",
            handles.len()
        );
        for handle in &handles {
            handle.abort();
        }
        futures::future::join_all(handles).await;

        for service in services {
            service.abandon();
        }
    }
}

/// The task run for a single target
fn run(action: Action, service: Arc<Service>) -> BoxFuture<'static, Outcome> {
    async move {
        match action {
            Action::Start => match service.start().await {
                Ok(state) => Outcome::Finished(state),
                Err(error) => {
                    tracing::warn!(service = %service, "Could not start: {error}");
                    Outcome::TaskFailed(error.to_string())
                }
            },
            Action::Stop(cause) => {
                let before = service.state();
                let after = service.stop(cause).await;
                match before.is_stopped() {
                    true => Outcome::AlreadyStopped(after),
                    false => Outcome::Finished(after),
                }
            }
        }
    }
    .boxed()
}
