use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the long-running loops of the probe.
///
/// The process hosts several asynchronous loops (queue coordinator, Kafka
/// producer/consumer streams, HTTP server) and can only be trusted to run
/// tests if all of them are alive. Each loop registers a component and must
/// report a heartbeat more often than its deadline:
///   - a component that never reported yet keeps the process unhealthy
///   - a component whose heartbeat expired is considered stalled
///   - a component may also explicitly report itself as failed
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no heartbeat received yet.
    Pending,
    /// Heartbeat received, trusted until the embedded instant.
    AliveUntil(time::OffsetDateTime),
    /// Deadline elapsed without a heartbeat.
    Stalled,
    /// Component reported an unrecoverable failure.
    Failed,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::SERVICE_UNAVAILABLE, body),
        }
        .into_response()
    }
}

struct Heartbeat {
    component: String,
    status: ComponentStatus,
}

/// Handle given to a registered component so it can report its liveness.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<Heartbeat>,
}

impl HealthHandle {
    /// Report a heartbeat. Must be called more often than the deadline.
    pub async fn beat(&self) {
        self.send(ComponentStatus::AliveUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Blocking variant for callers outside the async runtime, like the
    /// rdkafka statistics callback thread.
    pub fn beat_blocking(&self) {
        let beat = Heartbeat {
            component: self.component.clone(),
            status: ComponentStatus::AliveUntil(
                time::OffsetDateTime::now_utc().add(self.deadline),
            ),
        };
        if let Err(err) = self.sender.blocking_send(beat) {
            warn!("failed to report heartbeat: {}", err)
        }
    }

    /// Mark this component as permanently failed.
    pub async fn report_failed(&self) {
        self.send(ComponentStatus::Failed).await
    }

    async fn send(&self, status: ComponentStatus) {
        let beat = Heartbeat {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(beat).await {
            warn!("failed to report heartbeat: {}", err)
        }
    }
}

/// Process-wide registry of components that must stay alive.
#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<Heartbeat>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<Heartbeat>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(beat) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        let _unused = map.insert(beat.component, beat.status);
                    }
                    // Poisoned lock: the probes will fail and the process restart
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// Register a component. The handle should be moved into the component's
    /// loop so it can report heartbeats against its deadline.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.send(ComponentStatus::Pending).await;
        handle
    }

    /// Compute the process status from all registered components. Usable as
    /// an axum handler through `IntoResponse`.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");
        let now = time::OffsetDateTime::now_utc();

        let mut status = HealthStatus {
            // unhealthy until at least one component registered
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, component) in components.iter() {
            let reported = match component {
                ComponentStatus::AliveUntil(until) if until.gt(&now) => component.clone(),
                ComponentStatus::AliveUntil(_) => {
                    status.healthy = false;
                    ComponentStatus::Stalled
                }
                other => {
                    status.healthy = false;
                    other.clone()
                }
            };
            let _unused = status.components.insert(name.clone(), reported);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }

    /// True when every registered component is within its deadline.
    pub fn healthy(&self) -> bool {
        self.get_status().healthy
    }
}

#[cfg(test)]
mod tests {
    use std::ops::{Add, Sub};

    use time::{Duration, OffsetDateTime};

    use crate::{ComponentStatus, HealthRegistry};

    async fn eventually<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.healthy());
    }

    #[tokio::test]
    async fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("consumer", Duration::seconds(30)).await;

        // Pending components keep the process unhealthy
        eventually(|| registry.get_status().components.len() == 1).await;
        assert_eq!(
            registry.get_status().components.get("consumer"),
            Some(&ComponentStatus::Pending)
        );
        assert!(!registry.healthy());

        // First heartbeat brings it up
        handle.beat().await;
        eventually(|| registry.healthy()).await;

        // An explicit failure takes it down for good
        handle.report_failed().await;
        eventually(|| !registry.healthy()).await;
        assert_eq!(
            registry.get_status().components.get("consumer"),
            Some(&ComponentStatus::Failed)
        );
    }

    #[tokio::test]
    async fn expired_heartbeat_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("producer", Duration::seconds(30)).await;

        handle.beat().await;
        eventually(|| registry.healthy()).await;

        handle
            .send(ComponentStatus::AliveUntil(
                OffsetDateTime::now_utc().sub(Duration::seconds(1)),
            ))
            .await;
        eventually(|| !registry.healthy()).await;
        assert_eq!(
            registry.get_status().components.get("producer"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn all_components_must_be_alive() {
        let registry = HealthRegistry::new("liveness");
        let one = registry.register("one", Duration::seconds(30)).await;
        let two = registry.register("two", Duration::seconds(30)).await;
        eventually(|| registry.get_status().components.len() == 2).await;

        one.beat().await;
        eventually(|| {
            registry.get_status().components.get("one") != Some(&ComponentStatus::Pending)
        })
        .await;
        assert!(!registry.healthy());

        two.beat().await;
        eventually(|| registry.healthy()).await;
    }
}
