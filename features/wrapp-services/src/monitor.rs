use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::{
    state::{ServiceListener, ServiceStateChange, State},
    types::ServiceKey,
};

/// Last known status of one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub current_state: State,
    pub previous_state: Option<State>,
    pub last_start_time: Option<DateTime<Utc>>,
    pub last_stop_time: Option<DateTime<Utc>>,
    pub status_change_time: DateTime<Utc>,
}
impl ServiceStatus {
    fn new(at: DateTime<Utc>) -> Self {
        ServiceStatus {
            current_state: State::Initial,
            previous_state: None,
            last_start_time: None,
            last_stop_time: None,
            status_change_time: at,
        }
    }
}

/// Records the state of every service it is notified about
///
/// Read-only towards the services, register it with
/// [crate::model::ServicesModel::add_listener].
#[derive(Default)]
pub struct ServiceMonitor {
    statuses: RwLock<IndexMap<ServiceKey, ServiceStatus>>,
}
impl ServiceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn monitored_services(&self) -> Vec<ServiceKey> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn service_status(&self, key: &ServiceKey) -> Option<ServiceStatus> {
        self.statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

impl ServiceListener for ServiceMonitor {
    fn on_state_change(&self, change: &ServiceStateChange) {
        let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
        let status = statuses
            .entry(change.key.clone())
            .or_insert_with(|| ServiceStatus::new(change.at));

        status.previous_state = Some(change.from);
        status.current_state = change.to;
        status.status_change_time = change.at;

        match change.to {
            State::Started => status.last_start_time = Some(change.at),
            State::Stopping => {}
            state if state.is_stopped() => status.last_stop_time = Some(change.at),
            _ => {}
        }
    }

    fn on_service_created(&self, key: &ServiceKey) {
        self.statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| ServiceStatus::new(Utc::now()));
    }
}
