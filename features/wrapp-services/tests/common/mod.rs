#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use wrapp_services::{DynError, ServiceContext, ServiceLifecycle};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Shared log of every start and stop call, as "start:db" / "stop:db"
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}
impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|recorded| *recorded == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|recorded| recorded == event)
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Clone, Copy, Default)]
pub struct Behaviour {
    pub fail_start: bool,
    pub fail_stop: bool,
    pub panic_start: bool,
    pub delay: Duration,
}
impl Behaviour {
    pub fn ok() -> Self {
        Behaviour::default()
    }

    pub fn failing_start() -> Self {
        Behaviour {
            fail_start: true,
            ..Default::default()
        }
    }

    pub fn failing_stop() -> Self {
        Behaviour {
            fail_stop: true,
            ..Default::default()
        }
    }

    pub fn panicking_start() -> Self {
        Behaviour {
            panic_start: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Behaviour {
            delay,
            ..Default::default()
        }
    }
}

pub struct TestService {
    recorder: Recorder,
    behaviour: Behaviour,
}
impl TestService {
    pub fn new(recorder: Recorder, behaviour: Behaviour) -> Self {
        TestService {
            recorder,
            behaviour,
        }
    }

    /// Factory closure creating a fresh TestService for every instance
    pub fn factory(
        recorder: &Recorder,
        behaviour: Behaviour,
    ) -> impl Fn() -> TestService + Send + Sync + 'static {
        let recorder = recorder.clone();
        move || TestService::new(recorder.clone(), behaviour)
    }
}
impl ServiceLifecycle for TestService {
    #[allow(refining_impl_trait)]
    async fn start(&self, ctx: ServiceContext) -> Result<(), DynError> {
        self.recorder.push(format!("start:{}", ctx.key()));
        if !self.behaviour.delay.is_zero() {
            tokio::time::sleep(self.behaviour.delay).await;
        }
        if self.behaviour.panic_start {
            panic!("{} blew up", ctx.key());
        }
        if self.behaviour.fail_start {
            return Err(format!("{} refused to start", ctx.key()).into());
        }
        Ok(())
    }

    #[allow(refining_impl_trait)]
    async fn stop(&self, ctx: ServiceContext) -> Result<(), DynError> {
        self.recorder.push(format!("stop:{}", ctx.key()));
        if self.behaviour.fail_stop {
            return Err(format!("{} refused to stop", ctx.key()).into());
        }
        Ok(())
    }
}
