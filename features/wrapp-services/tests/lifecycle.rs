mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{init_tracing, Behaviour, Recorder, TestService};
use wrapp_services::{
    DependencyType, DynError, LifecycleConfig, LifecycleError, RegistrationError, Selection,
    ServiceFactory, ServiceKey, ServiceListener, ServiceStateChange, ServicesModel, State,
    StopCause,
};

fn key(name: &str) -> ServiceKey {
    ServiceKey::new(name)
}

#[tokio::test(flavor = "multi_thread")]
async fn start_runs_dependencies_first() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("a", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("b", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("c", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("a", "b", DependencyType::AlwaysRequired)
        .add_dependency("b", "c", DependencyType::RequiredOnlyAtStart)
        .build()
        .unwrap();

    let a = model.service(&key("a")).unwrap();
    assert_eq!(a.start().await.unwrap(), State::Started);

    for name in ["a", "b", "c"] {
        assert_eq!(model.instance(&key(name)).unwrap().state(), State::Started);
    }
    assert!(recorder.position("start:c") < recorder.position("start:b"));
    assert!(recorder.position("start:b") < recorder.position("start:a"));
}

#[tokio::test(flavor = "multi_thread")]
async fn required_dependency_failure_fails_the_dependant() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("db", TestService::factory(&recorder, Behaviour::failing_start()))
        .add_factory("cache", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("api", "db", DependencyType::RequiredOnlyAtStart)
        .add_dependency("api", "cache", DependencyType::AlwaysRequired)
        .build()
        .unwrap();

    let api = model.service(&key("api")).unwrap();
    assert_eq!(api.start().await.unwrap(), State::DependencyFailed);

    assert_eq!(model.instance(&key("db")).unwrap().state(), State::FailedToStart);
    // Siblings are still awaited, not cancelled
    assert_eq!(model.instance(&key("cache")).unwrap().state(), State::Started);
    assert_eq!(recorder.count("start:api"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn optional_dependency_failure_is_ignored() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("cache", TestService::factory(&recorder, Behaviour::failing_start()))
        .add_dependency("api", "cache", DependencyType::Optional)
        .build()
        .unwrap();

    let api = model.service(&key("api")).unwrap();
    assert_eq!(api.start().await.unwrap(), State::Started);
    assert_eq!(model.instance(&key("cache")).unwrap().state(), State::FailedToStart);
    assert_eq!(recorder.count("start:cache"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_dependency_counts_as_failed_to_start() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("db", TestService::factory(&recorder, Behaviour::panicking_start()))
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .build()
        .unwrap();

    let api = model.service(&key("api")).unwrap();
    assert_eq!(api.start().await.unwrap(), State::DependencyFailed);
    assert_eq!(model.instance(&key("db")).unwrap().state(), State::FailedToStart);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_cascades_only_to_always_required_dependants() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("a", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("b", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("c", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("d", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("a", "b", DependencyType::AlwaysRequired)
        .add_dependency("c", "b", DependencyType::RequiredOnlyAtStart)
        .add_dependency("d", "b", DependencyType::Optional)
        .build()
        .unwrap();

    let services = model.services_for(&[key("a"), key("c"), key("d")]).unwrap();
    for service in &services {
        assert_eq!(service.start().await.unwrap(), State::Started);
    }

    let b = model.instance(&key("b")).unwrap();
    assert_eq!(b.stop(StopCause::Stopped).await, State::Stopped);

    assert_eq!(model.instance(&key("a")).unwrap().state(), State::DependencyStopped);
    assert_eq!(model.instance(&key("c")).unwrap().state(), State::Started);
    assert_eq!(model.instance(&key("d")).unwrap().state(), State::Started);
    // Dependants are stopped before the dependency itself
    assert!(recorder.position("stop:a") < recorder.position("stop:b"));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_stop_are_idempotent() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("a", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("b", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("a", "b", DependencyType::AlwaysRequired)
        .build()
        .unwrap();

    let a = model.service(&key("a")).unwrap();
    assert_eq!(a.start().await.unwrap(), State::Started);
    assert_eq!(a.start().await.unwrap(), State::Started);
    assert_eq!(recorder.count("start:a"), 1);
    assert_eq!(recorder.count("start:b"), 1);

    assert_eq!(a.stop(StopCause::Stopped).await, State::Stopped);
    assert_eq!(a.stop(StopCause::Stopped).await, State::Stopped);
    assert_eq!(a.stop(StopCause::Failed).await, State::Stopped);
    assert_eq!(recorder.count("stop:a"), 1);
    // Stopping a dependant leaves its dependencies running
    assert_eq!(model.instance(&key("b")).unwrap().state(), State::Started);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_starts_run_the_lifecycle_once() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory(
            "db",
            TestService::factory(&recorder, Behaviour::slow(Duration::from_millis(50))),
        )
        .build()
        .unwrap();
    let db = model.service(&key("db")).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { db.start().await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), State::Started);
    }
    assert_eq!(recorder.count("start:db"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_cascades_and_reset_allows_restart() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("db", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .build()
        .unwrap();

    let api = model.service(&key("api")).unwrap();
    let db = model.service(&key("db")).unwrap();
    api.start().await.unwrap();

    // Running services can't be reset
    assert_eq!(api.reset(), State::Started);

    assert_eq!(db.fail().await, State::Failed);
    assert_eq!(api.state(), State::DependencyFailed);

    assert_eq!(api.reset(), State::Initial);
    assert_eq!(api.start().await.unwrap(), State::Started);
    assert_eq!(db.state(), State::Started);
    assert_eq!(recorder.count("start:db"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_stop_is_reported_as_failed_to_stop() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::failing_stop()))
        .add_factory("db", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .build()
        .unwrap();

    let api = model.service(&key("api")).unwrap();
    api.start().await.unwrap();

    let db = model.instance(&key("db")).unwrap();
    assert!(!model.stop_dependants_of(db.key(), false).await);
    assert_eq!(api.state(), State::FailedToStop);
    assert_eq!(db.state(), State::Started);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_factories_are_all_reported() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .add_dependency("api", "cache", DependencyType::Optional)
        .build()
        .unwrap();

    match model.service(&key("api")) {
        Err(RegistrationError::MissingFactory(missing)) => assert_eq!(missing, key("db")),
        other => panic!("expected a missing factory, got {other:?}"),
    }

    let api = model.instance(&key("api")).unwrap();
    match api.start().await {
        Err(LifecycleError::Lookup(error)) => {
            assert_eq!(error.missing, vec![key("db"), key("cache")]);
            assert!(error.to_string().contains("db, cache"));
        }
        other => panic!("expected a lookup error, got {other:?}"),
    }
    assert_eq!(api.state(), State::DependencyFailed);
    assert_eq!(recorder.count("start:api"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_dependency_times_out_the_batch() {
    init_tracing();
    let recorder = Recorder::default();
    let config = LifecycleConfig::default()
        .with_task_timeout(Duration::from_millis(50))
        .with_shutdown_grace(Duration::from_millis(10));
    let model = ServicesModel::builder()
        .config(config)
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory(
            "db",
            TestService::factory(&recorder, Behaviour::slow(Duration::from_secs(30))),
        )
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .build()
        .unwrap();

    let api = model.service(&key("api")).unwrap();
    assert_eq!(api.start().await.unwrap(), State::DependencyFailed);
    assert_eq!(recorder.count("start:api"), 0);
    // The aborted start doesn't leave the database hanging in Starting
    assert_eq!(model.instance(&key("db")).unwrap().state(), State::FailedToStart);
}

#[tokio::test(start_paused = true)]
async fn hung_dependency_does_not_hang_the_caller_by_default() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory(
            "db",
            TestService::factory(&recorder, Behaviour::slow(Duration::from_secs(3600))),
        )
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .build()
        .unwrap();

    let api = model.service(&key("api")).unwrap();
    let started = tokio::time::timeout(Duration::from_secs(60), api.start())
        .await
        .expect("start should give up on the hung dependency");

    assert_eq!(started.unwrap(), State::DependencyFailed);
    assert_eq!(model.instance(&key("db")).unwrap().state(), State::FailedToStart);
}

#[tokio::test(flavor = "multi_thread")]
async fn dependencies_added_after_creation_are_wired() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::default();
    model.register_service_factory(key("api"), TestService::factory(&recorder, Behaviour::ok()));
    model.register_service_factory(key("db"), TestService::factory(&recorder, Behaviour::ok()));

    let api = model.service(&key("api")).unwrap();
    let db = model.service(&key("db")).unwrap();
    assert!(model.find_instance_dependencies(&api).is_empty());

    model
        .add_dependency(key("api"), key("db"), DependencyType::AlwaysRequired)
        .unwrap();
    assert_eq!(
        model.find_instance_dependencies(&api),
        vec![(db.clone(), DependencyType::AlwaysRequired)]
    );
    assert_eq!(model.find_instance_dependants(&db).len(), 1);
    assert_eq!(model.find_dependencies(&key("api"), Selection::All), vec![key("db")]);

    let ctx = api.context();
    assert_eq!(ctx.dependency_state(&key("db")), Some(State::Initial));
    api.start().await.unwrap();
    assert_eq!(ctx.dependency_state(&key("db")), Some(State::Started));
    assert!(ctx.dependency(&key("unknown")).is_none());
}

struct ShardFactory {
    recorder: Recorder,
}
impl ServiceFactory for ShardFactory {
    type Provides = TestService;

    #[allow(refining_impl_trait)]
    fn create(&self, key: &ServiceKey) -> Result<TestService, DynError> {
        if key.instance > 2 {
            return Err(format!("there is no shard {}", key.instance).into());
        }
        Ok(TestService::new(self.recorder.clone(), Behaviour::ok()))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn factories_can_depend_on_the_instance_number() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::default();
    for instance in [1, 3] {
        model.register_service_factory(
            ServiceKey::with_instance("shard", instance),
            ShardFactory {
                recorder: recorder.clone(),
            },
        );
    }

    let shard = model.service(&ServiceKey::with_instance("shard", 1)).unwrap();
    shard.start().await.unwrap();
    assert_eq!(recorder.events(), vec!["start:shard:1".to_string()]);

    match model.service(&ServiceKey::with_instance("shard", 3)) {
        Err(RegistrationError::FactoryFailed { key, error }) => {
            assert_eq!(key.instance, 3);
            assert!(error.to_string().contains("no shard 3"));
        }
        other => panic!("expected the factory to fail, got {other:?}"),
    }
    assert!(model.instance(&ServiceKey::with_instance("shard", 3)).is_none());
}

#[derive(Default)]
struct Transitions {
    seen: Mutex<Vec<(ServiceKey, State, State)>>,
}
impl ServiceListener for Transitions {
    fn on_state_change(&self, change: &ServiceStateChange) {
        self.seen
            .lock()
            .unwrap()
            .push((change.key.clone(), change.from, change.to));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn listeners_see_every_transition() {
    init_tracing();
    let recorder = Recorder::default();
    let transitions = Arc::new(Transitions::default());
    let model = ServicesModel::builder()
        .add_factory("db", TestService::factory(&recorder, Behaviour::ok()))
        .add_listener(transitions.clone())
        .build()
        .unwrap();

    let db = model.service(&key("db")).unwrap();
    db.start().await.unwrap();
    db.stop(StopCause::Stopped).await;
    db.reset();

    let seen = transitions.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (key("db"), State::Initial, State::Starting),
            (key("db"), State::Starting, State::Started),
            (key("db"), State::Started, State::Stopping),
            (key("db"), State::Stopping, State::Stopped),
            (key("db"), State::Stopped, State::Initial),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_all_services_stops_everything() {
    init_tracing();
    let recorder = Recorder::default();
    let model = ServicesModel::builder()
        .add_factory("api", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("db", TestService::factory(&recorder, Behaviour::ok()))
        .add_factory("cache", TestService::factory(&recorder, Behaviour::ok()))
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .add_dependency("api", "cache", DependencyType::Optional)
        .build()
        .unwrap();

    model.service(&key("api")).unwrap().start().await.unwrap();
    model.stop_all_services().await;

    for service in model.services() {
        assert!(service.state().is_stopped(), "{service} is still {}", service.state());
        assert_ne!(service.state(), State::Stopping);
    }
    assert_eq!(recorder.count("stop:api"), 1);
}
