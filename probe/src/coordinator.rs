//! Admission and queueing: one coordinator per process owns every test's
//! execution state machine, enforces the single-in-flight rule over a FIFO
//! of loaded tests, and reaps machines once they terminate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TimeoutConfig;
use crate::execution::{
    AskReject, CancelAck, ChildSpawner, FsmEvent, FsmHandle, FsmMsg, StartAck, TestExecution,
};
use crate::model::{QueueSnapshot, TestId, TestState, TestStatus};
use crate::registry::EventRegistry;

/// How many times a crashed state machine is restarted within the window
/// before the test is given up on.
const MAX_FSM_RESTARTS: usize = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(60);

pub enum CoordMsg {
    InitializeTest {
        reply: oneshot::Sender<TestId>,
    },
    StartTest {
        test_id: TestId,
        bucket: String,
        test_type: Option<String>,
        reply: oneshot::Sender<Result<StartAck, AskReject>>,
    },
    TestStatus {
        test_id: TestId,
        reply: oneshot::Sender<Result<TestStatus, AskReject>>,
    },
    QueueStatus {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    Cancel {
        test_id: TestId,
        reply: oneshot::Sender<Result<CancelAck, AskReject>>,
    },
    Fsm {
        test_id: TestId,
        event: FsmEvent,
    },
}

impl std::fmt::Debug for CoordMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CoordMsg::InitializeTest { .. } => write!(f, "InitializeTest"),
            CoordMsg::StartTest { test_id, .. } => write!(f, "StartTest({test_id})"),
            CoordMsg::TestStatus { test_id, .. } => write!(f, "TestStatus({test_id})"),
            CoordMsg::QueueStatus { .. } => write!(f, "QueueStatus"),
            CoordMsg::Cancel { test_id, .. } => write!(f, "Cancel({test_id})"),
            CoordMsg::Fsm { test_id, event } => write!(f, "Fsm({test_id}, {event:?})"),
        }
    }
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    pub tx: mpsc::Sender<CoordMsg>,
}

struct Entry {
    handle: FsmHandle,
    state: TestState,
    restarts: Vec<Instant>,
}

pub struct QueueCoordinator {
    registry: Arc<EventRegistry>,
    spawner: Arc<dyn ChildSpawner>,
    timeouts: TimeoutConfig,
    self_tx: mpsc::Sender<CoordMsg>,
    entries: HashMap<TestId, Entry>,
    loaded_fifo: VecDeque<TestId>,
    testing: Option<TestId>,
}

impl QueueCoordinator {
    pub fn spawn(
        registry: Arc<EventRegistry>,
        spawner: Arc<dyn ChildSpawner>,
        timeouts: TimeoutConfig,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(128);
        let coordinator = Self {
            registry,
            spawner,
            timeouts,
            self_tx: tx.clone(),
            entries: HashMap::new(),
            loaded_fifo: VecDeque::new(),
            testing: None,
        };
        let join = tokio::spawn(coordinator.run(rx));
        (CoordinatorHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<CoordMsg>) {
        info!("queue coordinator started");
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
        debug!("queue coordinator stopped");
    }

    async fn handle(&mut self, msg: CoordMsg) {
        match msg {
            CoordMsg::InitializeTest { reply } => {
                let test_id = uuid::Uuid::now_v7();
                let handle = self.spawn_fsm(test_id);
                self.entries.insert(
                    test_id,
                    Entry {
                        handle: handle.clone(),
                        state: TestState::Setup,
                        restarts: Vec::new(),
                    },
                );
                counter!("probe_tests_admitted_total").increment(1);
                info!(%test_id, "test admitted");
                let _unused = handle.tx.send(FsmMsg::Admit { reply }).await;
            }

            CoordMsg::StartTest {
                test_id,
                bucket,
                test_type,
                reply,
            } => match self.entries.get(&test_id) {
                Some(entry) => {
                    let _unused = entry
                        .handle
                        .tx
                        .send(FsmMsg::Start {
                            bucket,
                            test_type,
                            reply,
                        })
                        .await;
                }
                None => {
                    let _unused = reply.send(Err(AskReject::UnknownTest));
                }
            },

            CoordMsg::TestStatus { test_id, reply } => match self.entries.get(&test_id) {
                Some(entry) => {
                    let _unused = entry.handle.tx.send(FsmMsg::Status { reply }).await;
                }
                None => {
                    let _unused = reply.send(Err(AskReject::UnknownTest));
                }
            },

            CoordMsg::QueueStatus { reply } => {
                let _unused = reply.send(self.snapshot());
            }

            CoordMsg::Cancel { test_id, reply } => match self.entries.get(&test_id) {
                Some(entry) => {
                    let _unused = entry.handle.tx.send(FsmMsg::Cancel { reply }).await;
                }
                None => {
                    let _unused = reply.send(Err(AskReject::UnknownTest));
                }
            },

            CoordMsg::Fsm { test_id, event } => self.handle_fsm_event(test_id, event).await,
        }
    }

    async fn handle_fsm_event(&mut self, test_id: TestId, event: FsmEvent) {
        debug!(%test_id, ?event, "fsm event");
        match event {
            FsmEvent::Initialized => {}
            FsmEvent::Loading => self.set_state(test_id, TestState::Loading),
            FsmEvent::Loaded => {
                self.set_state(test_id, TestState::Loaded);
                self.loaded_fifo.push_back(test_id);
                self.dispatch_next().await;
            }
            FsmEvent::Started => self.set_state(test_id, TestState::Testing),
            FsmEvent::Completed(_) => {
                counter!("probe_tests_completed_total").increment(1);
                self.set_state(test_id, TestState::Completed);
                self.release_testing_slot(test_id).await;
            }
            FsmEvent::Exception(error) => {
                counter!("probe_tests_failed_total").increment(1);
                warn!(%test_id, "test raised an exception: {error}");
                self.set_state(test_id, TestState::Exception);
                self.release_testing_slot(test_id).await;
            }
            FsmEvent::Stopping => {
                self.set_state(test_id, TestState::ShuttingDown);
                self.loaded_fifo.retain(|id| *id != test_id);
                self.release_testing_slot(test_id).await;
            }
            FsmEvent::Terminated => {
                info!(%test_id, "test reaped");
                self.entries.remove(&test_id);
                self.loaded_fifo.retain(|id| *id != test_id);
                self.release_testing_slot(test_id).await;
            }
            FsmEvent::Crashed => self.handle_crash(test_id).await,
        }
    }

    /// A panicked machine is restarted from Setup within the budget; past
    /// it, the test is reported failed and reaped.
    async fn handle_crash(&mut self, test_id: TestId) {
        self.loaded_fifo.retain(|id| *id != test_id);
        self.release_testing_slot(test_id).await;
        self.registry.unregister(&test_id);

        let Some(entry) = self.entries.get_mut(&test_id) else {
            return;
        };
        let now = Instant::now();
        entry
            .restarts
            .retain(|at| now.duration_since(*at) < RESTART_WINDOW);
        entry.restarts.push(now);
        let restarts_len = entry.restarts.len();
        if restarts_len <= MAX_FSM_RESTARTS {
            warn!(%test_id, attempt = restarts_len, "execution crashed, restarting");
            counter!("probe_fsm_restarts_total").increment(1);
            let handle = self.spawn_fsm(test_id);
            if let Some(entry) = self.entries.get_mut(&test_id) {
                entry.handle = handle;
                entry.state = TestState::Setup;
            }
        } else {
            error!(%test_id, "execution crash budget exhausted, giving up");
            counter!("probe_tests_failed_total").increment(1);
            self.entries.remove(&test_id);
        }
    }

    fn spawn_fsm(&self, test_id: TestId) -> FsmHandle {
        let (handle, join) = TestExecution::spawn(
            test_id,
            self.self_tx.clone(),
            self.spawner.as_ref(),
            self.registry.clone(),
            self.timeouts.clone(),
        );
        let watcher_tx = self.self_tx.clone();
        tokio::spawn(async move {
            if join.await.is_err() {
                let _unused = watcher_tx
                    .send(CoordMsg::Fsm {
                        test_id,
                        event: FsmEvent::Crashed,
                    })
                    .await;
            }
        });
        handle
    }

    fn set_state(&mut self, test_id: TestId, state: TestState) {
        if let Some(entry) = self.entries.get_mut(&test_id) {
            entry.state = state;
        }
    }

    async fn release_testing_slot(&mut self, test_id: TestId) {
        if self.testing == Some(test_id) {
            self.testing = None;
        }
        self.dispatch_next().await;
    }

    /// Pop the head of the loaded FIFO into the testing slot whenever the
    /// slot is free. Dispatch order is admission order.
    async fn dispatch_next(&mut self) {
        if self.testing.is_some() {
            return;
        }
        while let Some(next) = self.loaded_fifo.pop_front() {
            let Some(entry) = self.entries.get(&next) else {
                continue;
            };
            if entry.state != TestState::Loaded {
                continue;
            }
            let tx = entry.handle.tx.clone();
            self.testing = Some(next);
            info!(test_id = %next, "granting the testing slot");
            let _unused = tx.send(FsmMsg::StartTesting).await;
            return;
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        let mut snapshot = QueueSnapshot::default();
        for entry in self.entries.values() {
            snapshot.bump(entry.state);
        }
        snapshot.testing_test_id = self.testing;
        snapshot
    }
}
