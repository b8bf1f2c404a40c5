//! Root of the supervision tree: assembles the process-wide collaborators,
//! spawns the queue coordinator under a restart policy, and exposes a
//! stable address for it that survives restarts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, TimeoutConfig};
use crate::coordinator::{CoordMsg, CoordinatorHandle, QueueCoordinator};
use crate::execution::{Children, ChildSpawner, FsmMsg};
use crate::memfs::MemFs;
use crate::model::TestId;
use crate::registry::{ConsumedIndex, EventRegistry};
use crate::scenario::{PlanRunner, SuiteRunner};
use crate::schema::SerdeFactory;
use crate::storage::ObjectStore;
use crate::streams::consumer::ConsumerWorker;
use crate::streams::producer::ProducerWorker;
use crate::workers::scenario::ScenarioWorker;
use crate::workers::storage::StorageWorker;
use crate::workers::vault::{HttpVaultInvoker, VaultInvoker, VaultSpec, VaultWorker};

const COORDINATOR_RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Address of the current coordinator incarnation. The gateway holds this
/// instead of a raw handle so a restarted coordinator keeps serving asks.
#[derive(Clone)]
pub struct CoordinatorRef {
    inner: Arc<RwLock<CoordinatorHandle>>,
}

impl CoordinatorRef {
    pub fn new(handle: CoordinatorHandle) -> Self {
        Self {
            inner: Arc::new(RwLock::new(handle)),
        }
    }

    pub async fn send(&self, msg: CoordMsg) -> Result<(), mpsc::error::SendError<CoordMsg>> {
        let handle = self.inner.read().await.clone();
        handle.tx.send(msg).await
    }

    async fn replace(&self, handle: CoordinatorHandle) {
        *self.inner.write().await = handle;
    }
}

/// Builds the real five children for every admitted test.
pub struct ProbeChildSpawner {
    config: Config,
    store: Arc<dyn ObjectStore>,
    invoker: Arc<dyn VaultInvoker>,
    vault_spec: VaultSpec,
    serde: Arc<SerdeFactory>,
    registry: Arc<EventRegistry>,
    runner: Arc<dyn SuiteRunner>,
}

impl ProbeChildSpawner {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        serde: Arc<SerdeFactory>,
        registry: Arc<EventRegistry>,
    ) -> anyhow::Result<Self> {
        let vault_spec = VaultSpec::from_config(&config.vault)
            .map_err(|e| anyhow::anyhow!("vault configuration: {e}"))?;
        let invoker: Arc<dyn VaultInvoker> = Arc::new(
            HttpVaultInvoker::new(&config.vault.function_url, config.vault.call_timeout.0)
                .map_err(|e| anyhow::anyhow!("vault client: {e}"))?,
        );
        Ok(Self {
            config,
            store,
            invoker,
            vault_spec,
            serde,
            registry,
            runner: Arc::new(PlanRunner),
        })
    }
}

impl ChildSpawner for ProbeChildSpawner {
    fn spawn_children(&self, test_id: TestId, fsm: mpsc::Sender<FsmMsg>) -> Children {
        let memfs = MemFs::new();
        let consumed = Arc::new(ConsumedIndex::default());

        let (storage, storage_join) =
            StorageWorker::spawn(test_id, self.store.clone(), memfs.clone(), fsm.clone());
        let (vault, vault_join) = VaultWorker::spawn(
            test_id,
            self.vault_spec.clone(),
            self.invoker.clone(),
            fsm.clone(),
        );
        let (scenario, scenario_join) = ScenarioWorker::spawn(
            test_id,
            self.runner.clone(),
            self.registry.clone(),
            memfs,
            self.config.timeouts.fetch_budget.0,
            fsm.clone(),
        );
        let (producer, producer_join) = ProducerWorker::spawn(
            test_id,
            self.config.kafka.clone(),
            self.serde.clone(),
            fsm.clone(),
        );
        let (consumer, consumer_join) = ConsumerWorker::spawn(
            test_id,
            self.config.kafka.clone(),
            self.serde.clone(),
            fsm,
            consumed.clone(),
        );

        Children {
            storage,
            vault,
            scenario,
            producer,
            consumer,
            consumed,
            joins: vec![
                storage_join,
                vault_join,
                scenario_join,
                producer_join,
                consumer_join,
            ],
        }
    }
}

/// Why the supervision loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The coordinator mailbox drained normally (process shutdown).
    Finished,
    /// The restart budget was exceeded; the process should exit non-zero.
    RestartBudgetExceeded,
}

/// Spawn the queue coordinator and keep it alive: one restart per window,
/// a second crash inside the window ends the supervision loop.
pub fn supervise_coordinator(
    registry: Arc<EventRegistry>,
    spawner: Arc<dyn ChildSpawner>,
    timeouts: TimeoutConfig,
) -> (CoordinatorRef, JoinHandle<SupervisorOutcome>) {
    let (handle, first_join) = QueueCoordinator::spawn(registry.clone(), spawner.clone(), timeouts.clone());
    let coordinator = CoordinatorRef::new(handle);

    let supervised = coordinator.clone();
    let join = tokio::spawn(async move {
        let mut join = first_join;
        let mut last_restart: Option<Instant> = None;
        loop {
            match join.await {
                Ok(()) => {
                    info!("queue coordinator finished");
                    return SupervisorOutcome::Finished;
                }
                Err(e) => {
                    let now = Instant::now();
                    if let Some(previous) = last_restart {
                        if now.duration_since(previous) < COORDINATOR_RESTART_WINDOW {
                            error!("queue coordinator crashed twice within the window: {e}");
                            return SupervisorOutcome::RestartBudgetExceeded;
                        }
                    }
                    warn!("queue coordinator crashed, restarting: {e}");
                    last_restart = Some(now);
                    let (handle, next_join) =
                        QueueCoordinator::spawn(registry.clone(), spawner.clone(), timeouts.clone());
                    supervised.replace(handle).await;
                    join = next_join;
                }
            }
        }
    });

    (coordinator, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::tests::{test_timeouts, ScriptedSpawner};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn coordinator_ref_serves_asks() {
        let registry = Arc::new(EventRegistry::new(Duration::from_millis(200)));
        let (coordinator, _join) = supervise_coordinator(
            registry,
            Arc::new(ScriptedSpawner::default()),
            test_timeouts(),
        );

        let (reply, rx) = oneshot::channel();
        coordinator
            .send(CoordMsg::InitializeTest { reply })
            .await
            .unwrap();
        let test_id = rx.await.unwrap();
        assert!(!test_id.is_nil());
    }
}
