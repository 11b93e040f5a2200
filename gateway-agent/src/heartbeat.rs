//! Service heartbeat registry
//!
//! Co-located services announce themselves on `heartbeat.<name>.<type>`. The
//! first heartbeat creates the entry, later ones refresh it, and a periodic
//! sweep demotes entries whose last heartbeat is older than the timeout.
//! Entries are never removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::state::{new_state, Shared};
use crate::transport::parse_heartbeat_subject;

/// Sweep period of the registry-wide ticker
pub const SWEEP_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Online,
    Offline,
}

/// Liveness entry of one service, keyed by name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub last_seen: DateTime<Utc>,
    pub status: ServiceStatus,
    #[serde(rename = "type")]
    pub service_type: String,
    /// Active terminal sessions attributed to the service
    pub terminal: usize,
}

/// What a heartbeat did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Unknown -> Online (entry created)
    Registered,
    /// Online -> Online
    Refreshed,
    /// Offline -> Online
    Revived,
}

#[derive(Clone)]
pub struct HeartbeatRegistry {
    services: Shared<BTreeMap<String, ServiceInfo>>,
    timeout: Shared<chrono::Duration>,
}

impl HeartbeatRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            services: new_state(BTreeMap::new()),
            timeout: new_state(to_chrono(timeout)),
        }
    }

    /// Applies a new liveness timeout from the next sweep on.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = to_chrono(timeout);
    }

    /// Handles a broker heartbeat subject. Subjects without a name and a type are ignored.
    pub fn handle_subject(&self, subject: &str) -> Option<Transition> {
        let Some((name, kind)) = parse_heartbeat_subject(subject) else {
            warn!("Ignoring heartbeat with malformed subject {}", subject);
            return None;
        };
        Some(self.heartbeat(name, kind))
    }

    pub fn heartbeat(&self, name: &str, service_type: &str) -> Transition {
        self.record_at(name, service_type, Utc::now())
    }

    /// Upsert with an explicit observation time.
    pub fn record_at(&self, name: &str, service_type: &str, at: DateTime<Utc>) -> Transition {
        let mut services = self.services.lock();
        match services.get_mut(name) {
            Some(info) => {
                info.last_seen = at;
                if info.status == ServiceStatus::Offline {
                    info.status = ServiceStatus::Online;
                    info!("Service '{}' back online", name);
                    Transition::Revived
                } else {
                    Transition::Refreshed
                }
            }
            None => {
                services.insert(
                    name.to_string(),
                    ServiceInfo {
                        name: name.to_string(),
                        last_seen: at,
                        status: ServiceStatus::Online,
                        service_type: service_type.to_string(),
                        terminal: 0,
                    },
                );
                info!("Service '{}-{}' registered", name, service_type);
                Transition::Registered
            }
        }
    }

    /// Demotes every online entry whose last heartbeat is at least `timeout` old.
    /// Returns the names that went offline during this sweep.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = *self.timeout.lock();
        let mut went_offline = Vec::new();
        let mut services = self.services.lock();
        for info in services.values_mut() {
            if info.status == ServiceStatus::Online && now - info.last_seen >= timeout {
                info.status = ServiceStatus::Offline;
                went_offline.push(info.name.clone());
            }
        }
        drop(services);

        for name in &went_offline {
            info!("Service '{}' went offline", name);
        }
        went_offline
    }

    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Utc::now())
    }

    /// Point-in-time copy ordered by service name.
    pub fn snapshot(&self) -> Vec<ServiceInfo> {
        self.services.lock().values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<ServiceInfo> {
        self.services.lock().get(name).cloned()
    }

    /// Runs the sweep on a fixed period for the lifetime of the process.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                registry.sweep();
            }
        })
    }
}

fn to_chrono(timeout: Duration) -> chrono::Duration {
    chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX)
}
