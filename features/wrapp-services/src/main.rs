use std::{sync::Arc, time::Duration};

use wrapp_services::{
    DependencyType, DynError, LifecycleConfig, ServiceContext, ServiceKey, ServiceLifecycle,
    ServiceMonitor, ServicesModel,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let monitor = Arc::new(ServiceMonitor::new());
    let model = ServicesModel::builder()
        .config(LifecycleConfig::default().with_task_timeout(Duration::from_secs(10)))
        .add_factory("db", || Demo::new("database"))
        .add_factory("cache", || Demo::new("cache").failing())
        .add_factory("api", || Demo::new("http api"))
        .add_dependency("api", "db", DependencyType::AlwaysRequired)
        .add_dependency("api", "cache", DependencyType::Optional)
        .add_listener(monitor.clone())
        .build()?;

    let api = model.service(&ServiceKey::new("api"))?;
    let state = api.start().await?;
    println!("api is {state}");
    println!("{model:?}");

    let db = model.service(&ServiceKey::new("db"))?;
    let state = db.fail().await;
    println!("db is {state}, api is {}", api.state());

    for key in monitor.monitored_services() {
        if let Some(status) = monitor.service_status(&key) {
            println!(
                "{key}: {} (was {:?}), changed at {}",
                status.current_state, status.previous_state, status.status_change_time
            );
        }
    }

    model.stop_all_services().await;
    Ok(())
}

struct Demo {
    description: &'static str,
    fails: bool,
}
impl Demo {
    fn new(description: &'static str) -> Self {
        Demo {
            description,
            fails: false,
        }
    }

    fn failing(mut self) -> Self {
        self.fails = true;
        self
    }
}
impl ServiceLifecycle for Demo {
    fn description(&self) -> Option<&str> {
        Some(self.description)
    }

    #[allow(refining_impl_trait)]
    async fn start(&self, ctx: ServiceContext) -> Result<(), DynError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.fails {
            return Err(format!("{} is not reachable", ctx.key()).into());
        }
        Ok(())
    }
}
