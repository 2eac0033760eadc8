use std::{convert::Infallible, future::Future};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    service::ServiceContext,
    types::{DynError, ServiceKey},
};

/// The start and stop logic of a service
///
/// The state machine around it, including dependency resolution, is handled by
/// [crate::service::Service]. Errors returned here end up as `FailedToStart` or
/// `FailedToStop` states, they are never propagated to the caller.
pub trait ServiceLifecycle: Send + Sync + 'static {
    /// Display description of the service, passed through as-is
    fn description(&self) -> Option<&str> {
        None
    }

    /// Runs once all dependencies required at start have been started
    fn start(
        &self,
        ctx: ServiceContext,
    ) -> impl Future<Output = Result<(), impl Into<DynError>>> + Send + '_;

    /// Runs after all dependants which always require this service have been stopped
    fn stop(
        &self,
        ctx: ServiceContext,
    ) -> impl Future<Output = Result<(), impl Into<DynError>>> + Send + '_ {
        let _ = ctx; // Ignore unused
        async { Ok::<_, Infallible>(()) }
    }
}

/// Wrapper Trait for lifecycles, allowing for dynamic dispatch
pub trait DynLifecycle: Send + Sync {
    fn description(&self) -> Option<&str>;

    fn start(&self, ctx: ServiceContext) -> BoxFuture<'_, Result<(), DynError>>;

    fn stop(&self, ctx: ServiceContext) -> BoxFuture<'_, Result<(), DynError>>;
}
// Impl DynLifecycle for any ServiceLifecycle
impl<L: ServiceLifecycle> DynLifecycle for L {
    fn description(&self) -> Option<&str> {
        ServiceLifecycle::description(self)
    }

    fn start(&self, ctx: ServiceContext) -> BoxFuture<'_, Result<(), DynError>> {
        async move {
            ServiceLifecycle::start(self, ctx)
                .await
                .map_err(|e| e.into())
        }
        .boxed()
    }

    fn stop(&self, ctx: ServiceContext) -> BoxFuture<'_, Result<(), DynError>> {
        async move {
            ServiceLifecycle::stop(self, ctx)
                .await
                .map_err(|e| e.into())
        }
        .boxed()
    }
}

/// A Factory creating the lifecycle of a service slot
///
/// Any `Fn() -> impl ServiceLifecycle` closure is a factory.
pub trait ServiceFactory: Send + Sync + 'static {
    type Provides: ServiceLifecycle;

    /// Creates the lifecycle for the instance identified by `key`
    fn create(&self, key: &ServiceKey) -> Result<Self::Provides, impl Into<DynError>>;
}
impl<Fun, Lifecycle> ServiceFactory for Fun
where
    Fun: Fn() -> Lifecycle + Send + Sync + 'static,
    Lifecycle: ServiceLifecycle,
{
    type Provides = Lifecycle;

    #[allow(refining_impl_trait)]
    fn create(&self, _key: &ServiceKey) -> Result<Lifecycle, Infallible> {
        Ok(self())
    }
}

/// Wrapper Trait for factories, producing boxed lifecycles
pub trait DynServiceFactory: Send + Sync {
    fn create(&self, key: &ServiceKey) -> Result<Box<dyn DynLifecycle>, DynError>;
}
impl<F: ServiceFactory> DynServiceFactory for F {
    fn create(&self, key: &ServiceKey) -> Result<Box<dyn DynLifecycle>, DynError> {
        ServiceFactory::create(self, key)
            .map(|lifecycle| Box::new(lifecycle) as Box<dyn DynLifecycle>)
            .map_err(|e| e.into())
    }
}
