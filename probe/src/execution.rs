//! The per-test execution state machine.
//!
//! One task per admitted test sequences the five child workers through
//! `Setup → Loading → Loaded → Testing → Completed | Exception`, with
//! `ShuttingDown` reachable from anywhere. All bookkeeping happens inside
//! the single message loop: child completions, poison-pill timers and
//! coordinator commands are all mailbox messages, so every state entry is
//! one atomic handler and there are no race windows.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TimeoutConfig;
use crate::coordinator::CoordMsg;
use crate::model::{
    BlockStorageDirective, ExecError, KafkaSecurityDirective, TestExecutionResult, TestId,
    TestState, TestStatus,
};
use crate::registry::{ConsumedIndex, EventRegistry};
use crate::streams::consumer::ConsumerHandle;
use crate::streams::producer::ProducerHandle;
use crate::workers::scenario::ScenarioHandle;
use crate::workers::storage::StorageHandle;
use crate::workers::vault::VaultHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Storage,
    Vault,
    Scenario,
    Producer,
    Consumer,
}

/// Typed rejection for asks routed through the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskReject {
    UnknownTest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAck {
    pub test_id: TestId,
    pub accepted: bool,
    pub test_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAck {
    pub test_id: TestId,
    pub cancelled: bool,
    pub message: Option<String>,
}

/// Everything that can land in a state machine's mailbox.
pub enum FsmMsg {
    /// Admission handshake: the machine learns its reply channel.
    Admit {
        reply: oneshot::Sender<TestId>,
    },
    Start {
        bucket: String,
        test_type: Option<String>,
        reply: oneshot::Sender<Result<StartAck, AskReject>>,
    },
    Status {
        reply: oneshot::Sender<Result<TestStatus, AskReject>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<CancelAck, AskReject>>,
    },
    /// Single-in-flight grant from the coordinator.
    StartTesting,
    ChildReady(ChildKind),
    ChildFailed(ChildKind, ExecError),
    ManifestFetched(Box<BlockStorageDirective>),
    SecurityFetched(Vec<KafkaSecurityDirective>),
    EvidenceUploaded,
    SuiteFinished(Box<TestExecutionResult>),
    /// Deferred self-message from a poison-pill timer.
    StateTimeout {
        armed_in: TestState,
        generation: u64,
    },
    /// Deferred self-message from the child stop watcher.
    ChildrenStopped,
}

impl fmt::Debug for FsmMsg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FsmMsg::Admit { .. } => write!(f, "Admit"),
            FsmMsg::Start { bucket, .. } => write!(f, "Start({bucket})"),
            FsmMsg::Status { .. } => write!(f, "Status"),
            FsmMsg::Cancel { .. } => write!(f, "Cancel"),
            FsmMsg::StartTesting => write!(f, "StartTesting"),
            FsmMsg::ChildReady(kind) => write!(f, "ChildReady({kind:?})"),
            FsmMsg::ChildFailed(kind, e) => write!(f, "ChildFailed({kind:?}, {e})"),
            FsmMsg::ManifestFetched(_) => write!(f, "ManifestFetched"),
            FsmMsg::SecurityFetched(d) => write!(f, "SecurityFetched(len={})", d.len()),
            FsmMsg::EvidenceUploaded => write!(f, "EvidenceUploaded"),
            FsmMsg::SuiteFinished(r) => write!(f, "SuiteFinished(passed={})", r.passed),
            FsmMsg::StateTimeout { armed_in, .. } => write!(f, "StateTimeout({armed_in})"),
            FsmMsg::ChildrenStopped => write!(f, "ChildrenStopped"),
        }
    }
}

/// Progress notifications from a state machine to the coordinator.
#[derive(Debug)]
pub enum FsmEvent {
    Initialized,
    Loading,
    Loaded,
    Started,
    Completed(Box<TestExecutionResult>),
    Exception(String),
    Stopping,
    Terminated,
    /// Emitted by the coordinator's watcher when the task panicked.
    Crashed,
}

#[derive(Clone)]
pub struct FsmHandle {
    pub tx: mpsc::Sender<FsmMsg>,
}

/// The five children plus the shared pieces the machine wires together.
pub struct Children {
    pub storage: StorageHandle,
    pub vault: VaultHandle,
    pub scenario: ScenarioHandle,
    pub producer: ProducerHandle,
    pub consumer: ConsumerHandle,
    pub consumed: Arc<ConsumedIndex>,
    pub joins: Vec<JoinHandle<()>>,
}

/// Construction seam for the five children, so tests can script them.
pub trait ChildSpawner: Send + Sync {
    fn spawn_children(&self, test_id: TestId, fsm: mpsc::Sender<FsmMsg>) -> Children;
}

pub struct TestExecution {
    test_id: TestId,
    parent: mpsc::Sender<CoordMsg>,
    registry: Arc<EventRegistry>,
    timeouts: TimeoutConfig,
    self_tx: mpsc::Sender<FsmMsg>,
    children: Children,
    status: TestStatus,
    directive: Option<BlockStorageDirective>,
    security: Option<Vec<KafkaSecurityDirective>>,
    ready: HashSet<ChildKind>,
    loaded_announced: bool,
    /// Terminal state awaiting its evidence-upload tail.
    pending_terminal: Option<TestState>,
    result: Option<TestExecutionResult>,
    timer_generation: u64,
    stopping: bool,
}

enum Flow {
    Continue,
    Stop,
}

impl TestExecution {
    pub fn spawn(
        test_id: TestId,
        parent: mpsc::Sender<CoordMsg>,
        spawner: &dyn ChildSpawner,
        registry: Arc<EventRegistry>,
        timeouts: TimeoutConfig,
    ) -> (FsmHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let children = spawner.spawn_children(test_id, tx.clone());
        let fsm = Self {
            test_id,
            parent,
            registry,
            timeouts,
            self_tx: tx.clone(),
            children,
            status: TestStatus::new(test_id),
            directive: None,
            security: None,
            ready: HashSet::new(),
            loaded_announced: false,
            pending_terminal: None,
            result: None,
            timer_generation: 0,
            stopping: false,
        };
        let join = tokio::spawn(fsm.run(rx));
        (FsmHandle { tx }, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<FsmMsg>) {
        self.arm_timer(TestState::Setup, self.timeouts.setup_state.0);
        while let Some(msg) = rx.recv().await {
            debug!(test_id = %self.test_id, state = %self.status.state, ?msg, "handling");
            if let Flow::Stop = self.handle(msg).await {
                break;
            }
        }
        debug!(test_id = %self.test_id, "execution task finished");
    }

    async fn handle(&mut self, msg: FsmMsg) -> Flow {
        match msg {
            FsmMsg::Admit { reply } => {
                let _unused = reply.send(self.test_id);
                self.emit(FsmEvent::Initialized).await;
            }

            FsmMsg::Start {
                bucket,
                test_type,
                reply,
            } => {
                if self.status.state == TestState::Setup {
                    self.status.bucket = Some(bucket.clone());
                    self.status.test_type = test_type.clone();
                    self.status.start_time = Some(Utc::now());
                    let _unused = reply.send(Ok(StartAck {
                        test_id: self.test_id,
                        accepted: true,
                        test_type,
                    }));
                    self.status.state = TestState::Loading;
                    self.arm_timer(TestState::Loading, self.timeouts.loading_state.0);
                    self.emit(FsmEvent::Loading).await;
                    self.children.storage.initialize(bucket).await;
                } else {
                    let _unused = reply.send(Ok(StartAck {
                        test_id: self.test_id,
                        accepted: false,
                        test_type,
                    }));
                }
            }

            FsmMsg::Status { reply } => {
                let _unused = reply.send(Ok(self.status.clone()));
            }

            FsmMsg::Cancel { reply } => {
                if self.status.state.is_terminal() {
                    let _unused = reply.send(Ok(CancelAck {
                        test_id: self.test_id,
                        cancelled: false,
                        message: Some(format!("already {}", self.status.state)),
                    }));
                } else {
                    let _unused = reply.send(Ok(CancelAck {
                        test_id: self.test_id,
                        cancelled: true,
                        message: None,
                    }));
                    info!(test_id = %self.test_id, "cancelled by request");
                    self.begin_shutdown().await;
                }
            }

            FsmMsg::StartTesting => {
                if self.status.state == TestState::Loaded && self.loaded_announced {
                    self.status.state = TestState::Testing;
                    self.registry.register(
                        self.test_id,
                        self.children.producer.clone(),
                        self.children.consumed.clone(),
                    );
                    self.children.scenario.start_test().await;
                    self.emit(FsmEvent::Started).await;
                } else {
                    warn!(test_id = %self.test_id, state = %self.status.state,
                          "StartTesting outside Loaded, ignored");
                }
            }

            FsmMsg::ChildReady(kind) => {
                if matches!(self.status.state, TestState::Loading | TestState::Loaded) {
                    if self.ready.insert(kind) {
                        self.try_announce_loaded().await;
                    } else {
                        debug!(test_id = %self.test_id, ?kind, "duplicate ready ack ignored");
                    }
                } else {
                    debug!(test_id = %self.test_id, state = %self.status.state, ?kind,
                           "unexpected ready ack, ignored");
                }
            }

            FsmMsg::ManifestFetched(directive) => {
                if self.status.state == TestState::Loading {
                    self.status.state = TestState::Loaded;
                    self.directive = Some(*directive.clone());
                    self.children.vault.initialize(*directive).await;
                } else {
                    debug!(test_id = %self.test_id, state = %self.status.state,
                           "unexpected manifest, ignored");
                }
            }

            FsmMsg::SecurityFetched(directives) => {
                if self.status.state == TestState::Loaded && self.security.is_none() {
                    self.security = Some(directives.clone());
                    let directive = self
                        .directive
                        .clone()
                        .expect("Loaded implies a stored directive");
                    self.children.scenario.initialize(directive.clone()).await;
                    self.children
                        .producer
                        .initialize(directive.clone(), directives.clone())
                        .await;
                    self.children
                        .consumer
                        .initialize(directive, directives)
                        .await;
                } else {
                    debug!(test_id = %self.test_id, state = %self.status.state,
                           "unexpected security directives, ignored");
                }
            }

            FsmMsg::ChildFailed(kind, error) => {
                if self.pending_terminal.is_some() {
                    // the evidence tail failed; keep the original outcome
                    warn!(test_id = %self.test_id, ?kind, "evidence tail failed: {error}");
                    self.finalize_terminal().await;
                } else if !self.status.state.is_terminal() {
                    warn!(test_id = %self.test_id, ?kind, "child failed: {error}");
                    self.to_exception(error).await;
                }
            }

            FsmMsg::SuiteFinished(result) => {
                if self.status.state == TestState::Testing {
                    let passed = result.passed;
                    self.status.success = Some(passed);
                    self.status.end_time = Some(Utc::now());
                    if !passed {
                        self.status.error = Some(
                            result
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "scenario suite failed".to_string()),
                        );
                    }
                    self.result = Some(*result);
                    let target = if passed {
                        TestState::Completed
                    } else {
                        TestState::Exception
                    };
                    self.start_terminal_tail(target).await;
                } else {
                    debug!(test_id = %self.test_id, state = %self.status.state,
                           "unexpected suite result, ignored");
                }
            }

            FsmMsg::EvidenceUploaded => {
                if self.pending_terminal.is_some() {
                    self.finalize_terminal().await;
                }
            }

            FsmMsg::StateTimeout {
                armed_in,
                generation,
            } => {
                if generation != self.timer_generation {
                    // a late timer after the state moved on is expected
                    debug!(test_id = %self.test_id, %armed_in, "stale state timer ignored");
                } else {
                    match armed_in {
                        TestState::Setup => {
                            self.to_exception(ExecError::StateTimeout("setup")).await
                        }
                        TestState::Loading => {
                            self.to_exception(ExecError::StateTimeout("loading")).await
                        }
                        _ => {
                            info!(test_id = %self.test_id, state = %self.status.state,
                                  "terminal state timer, shutting down");
                            self.begin_shutdown().await;
                        }
                    }
                }
            }

            FsmMsg::ChildrenStopped => {
                self.emit(FsmEvent::Terminated).await;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// The coordinator is told the test is Loaded once the directive and
    /// security are stored and vault, scenario, producer and consumer have
    /// all acked their Initialize (storage acked during Loading).
    async fn try_announce_loaded(&mut self) {
        const REQUIRED: [ChildKind; 4] = [
            ChildKind::Vault,
            ChildKind::Scenario,
            ChildKind::Producer,
            ChildKind::Consumer,
        ];
        if self.loaded_announced
            || self.stopping
            || self.status.state != TestState::Loaded
            || self.directive.is_none()
            || self.security.is_none()
            || !REQUIRED.iter().all(|k| self.ready.contains(k))
        {
            return;
        }
        self.loaded_announced = true;
        // no pill while queued for the single-in-flight slot
        self.timer_generation += 1;
        info!(test_id = %self.test_id, "loaded, awaiting the testing slot");
        self.emit(FsmEvent::Loaded).await;
    }

    async fn to_exception(&mut self, error: ExecError) {
        if self.stopping || self.pending_terminal.is_some() {
            return;
        }
        self.status.success = Some(false);
        self.status.error = Some(error.to_string());
        self.status.end_time = Some(Utc::now());
        self.start_terminal_tail(TestState::Exception).await;
    }

    /// Enter the terminal tail: upload evidence when there is anything
    /// staged, then finalize.
    async fn start_terminal_tail(&mut self, target: TestState) {
        self.timer_generation += 1;
        self.pending_terminal = Some(target);
        if self.directive.is_some() {
            self.children.storage.upload_evidence().await;
        } else {
            self.finalize_terminal().await;
        }
    }

    async fn finalize_terminal(&mut self) {
        let Some(target) = self.pending_terminal.take() else {
            return;
        };
        self.status.state = target;
        let pill = match target {
            TestState::Completed => self.timeouts.completed_state.0,
            _ => self.timeouts.exception_state.0,
        };
        self.arm_timer(target, pill);
        match target {
            TestState::Completed => {
                let result = self
                    .result
                    .clone()
                    .expect("Completed implies a suite result");
                info!(test_id = %self.test_id, "test completed");
                self.emit(FsmEvent::Completed(Box::new(result))).await;
            }
            _ => {
                let error = self
                    .status
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string());
                info!(test_id = %self.test_id, "test failed: {error}");
                self.emit(FsmEvent::Exception(error)).await;
            }
        }
    }

    /// Fire-and-forget Stop to every child, then wait (bounded) for them to
    /// terminate before reporting ourselves reaped.
    async fn begin_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.timer_generation += 1;
        self.pending_terminal = None;
        self.status.state = TestState::ShuttingDown;
        self.registry.unregister(&self.test_id);
        self.emit(FsmEvent::Stopping).await;

        self.children.storage.stop().await;
        self.children.vault.stop().await;
        self.children.scenario.stop().await;
        self.children.producer.stop().await;
        self.children.consumer.stop().await;

        let joins = std::mem::take(&mut self.children.joins);
        let grace = self.timeouts.shutdown_grace.0;
        let self_tx = self.self_tx.clone();
        let test_id = self.test_id;
        tokio::spawn(async move {
            let drain = async {
                for join in joins {
                    let _unused = join.await;
                }
            };
            if tokio::time::timeout(grace, drain).await.is_err() {
                warn!(%test_id, "children did not stop within the grace period");
            }
            let _unused = self_tx.send(FsmMsg::ChildrenStopped).await;
        });
    }

    fn arm_timer(&mut self, state: TestState, duration: Duration) {
        self.timer_generation += 1;
        let generation = self.timer_generation;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _unused = tx
                .send(FsmMsg::StateTimeout {
                    armed_in: state,
                    generation,
                })
                .await;
        });
    }

    async fn emit(&self, event: FsmEvent) {
        let _unused = self
            .parent
            .send(CoordMsg::Fsm {
                test_id: self.test_id,
                event,
            })
            .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::EnvMsDuration;
    use crate::streams::consumer::ConsumerMsg;
    use crate::streams::producer::{ProduceOutcome, ProducerMsg};
    use crate::workers::scenario::ScenarioMsg;
    use crate::workers::storage::StorageMsg;
    use crate::workers::vault::VaultMsg;

    pub(crate) fn test_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            setup_state: EnvMsDuration(Duration::from_secs(5)),
            loading_state: EnvMsDuration(Duration::from_secs(5)),
            completed_state: EnvMsDuration(Duration::from_millis(500)),
            exception_state: EnvMsDuration(Duration::from_millis(500)),
            shutdown_grace: EnvMsDuration(Duration::from_secs(2)),
            ask: EnvMsDuration(Duration::from_secs(1)),
            produce_ack: EnvMsDuration(Duration::from_secs(1)),
            fetch_budget: EnvMsDuration(Duration::from_millis(200)),
        }
    }

    pub(crate) fn sample_directive() -> BlockStorageDirective {
        serde_json::from_value(serde_json::json!({
            "bucket": "b",
            "staging-root": "/staging/t",
            "evidence-dir": "evidence",
            "topics": [
                {"topic": "orders", "role": "producer", "client-principal": "svc"},
                {"topic": "payments", "role": "consumer", "client-principal": "svc",
                 "filters": [{"event-type": "PaymentProcessed", "payload-version": "1.0"}]}
            ]
        }))
        .unwrap()
    }

    fn passing_result(test_id: TestId) -> TestExecutionResult {
        TestExecutionResult {
            test_id,
            passed: true,
            scenario_count: 1,
            scenarios_passed: 1,
            scenarios_failed: 0,
            scenarios_skipped: 0,
            step_count: 3,
            steps_passed: 3,
            steps_failed: 0,
            steps_skipped: 0,
            steps_undefined: 0,
            duration_millis: 10,
            error_message: None,
            failed_scenarios: vec![],
        }
    }

    /// Scripted children for state machine tests: every child acks its
    /// Initialize, optionally after a configured delay, and the scenario
    /// child answers StartTest with a canned result.
    pub(crate) struct ScriptedSpawner {
        pub storage_delay: Duration,
        pub vault_delay: Duration,
        pub suite_passes: bool,
    }

    impl Default for ScriptedSpawner {
        fn default() -> Self {
            Self {
                storage_delay: Duration::ZERO,
                vault_delay: Duration::ZERO,
                suite_passes: true,
            }
        }
    }

    impl ChildSpawner for ScriptedSpawner {
        fn spawn_children(&self, test_id: TestId, fsm: mpsc::Sender<FsmMsg>) -> Children {
            let mut joins = Vec::new();

            let (storage_tx, mut storage_rx) = mpsc::channel(8);
            let storage_fsm = fsm.clone();
            let storage_delay = self.storage_delay;
            joins.push(tokio::spawn(async move {
                while let Some(msg) = storage_rx.recv().await {
                    match msg {
                        StorageMsg::Initialize { .. } => {
                            tokio::time::sleep(storage_delay).await;
                            let _unused = storage_fsm
                                .send(FsmMsg::ManifestFetched(Box::new(sample_directive())))
                                .await;
                            let _unused = storage_fsm.send(FsmMsg::ChildReady(ChildKind::Storage)).await;
                        }
                        StorageMsg::UploadEvidence => {
                            let _unused = storage_fsm.send(FsmMsg::EvidenceUploaded).await;
                        }
                        StorageMsg::Stop => break,
                    }
                }
            }));

            let (vault_tx, mut vault_rx) = mpsc::channel(8);
            let vault_fsm = fsm.clone();
            let vault_delay = self.vault_delay;
            joins.push(tokio::spawn(async move {
                while let Some(msg) = vault_rx.recv().await {
                    match msg {
                        VaultMsg::Initialize { .. } => {
                            tokio::time::sleep(vault_delay).await;
                            let _unused = vault_fsm.send(FsmMsg::SecurityFetched(vec![])).await;
                            let _unused = vault_fsm.send(FsmMsg::ChildReady(ChildKind::Vault)).await;
                        }
                        VaultMsg::Stop => break,
                    }
                }
            }));

            let (scenario_tx, mut scenario_rx) = mpsc::channel(8);
            let scenario_fsm = fsm.clone();
            let suite_passes = self.suite_passes;
            joins.push(tokio::spawn(async move {
                while let Some(msg) = scenario_rx.recv().await {
                    match msg {
                        ScenarioMsg::Initialize { .. } => {
                            let _unused = scenario_fsm
                                .send(FsmMsg::ChildReady(ChildKind::Scenario))
                                .await;
                        }
                        ScenarioMsg::StartTest => {
                            let mut result = passing_result(test_id);
                            if !suite_passes {
                                result.passed = false;
                                result.scenarios_passed = 0;
                                result.scenarios_failed = 1;
                                result.error_message = Some("assertion failed".to_string());
                                result.failed_scenarios = vec!["happy path".to_string()];
                            }
                            let _unused = scenario_fsm
                                .send(FsmMsg::SuiteFinished(Box::new(result)))
                                .await;
                        }
                        ScenarioMsg::Stop => break,
                    }
                }
            }));

            let (producer_tx, mut producer_rx) = mpsc::channel(8);
            let producer_fsm = fsm.clone();
            joins.push(tokio::spawn(async move {
                while let Some(msg) = producer_rx.recv().await {
                    match msg {
                        ProducerMsg::Initialize { .. } => {
                            let _unused = producer_fsm
                                .send(FsmMsg::ChildReady(ChildKind::Producer))
                                .await;
                        }
                        ProducerMsg::Produce(request) => {
                            let _unused = request.reply.send(ProduceOutcome::Ack);
                        }
                        ProducerMsg::Stop => break,
                    }
                }
            }));

            let (consumer_tx, mut consumer_rx) = mpsc::channel(8);
            let consumer_fsm = fsm.clone();
            joins.push(tokio::spawn(async move {
                while let Some(msg) = consumer_rx.recv().await {
                    match msg {
                        ConsumerMsg::Initialize { .. } => {
                            let _unused = consumer_fsm
                                .send(FsmMsg::ChildReady(ChildKind::Consumer))
                                .await;
                        }
                        ConsumerMsg::Stop => break,
                    }
                }
            }));

            Children {
                storage: StorageHandle::new(storage_tx),
                vault: VaultHandle::new(vault_tx),
                scenario: ScenarioHandle::new(scenario_tx),
                producer: ProducerHandle::for_tests(producer_tx),
                consumer: ConsumerHandle::for_tests(consumer_tx),
                consumed: Arc::new(ConsumedIndex::default()),
                joins,
            }
        }
    }

    struct Harness {
        test_id: TestId,
        handle: FsmHandle,
        events: mpsc::Receiver<CoordMsg>,
        registry: Arc<EventRegistry>,
    }

    impl Harness {
        fn spawn(spawner: ScriptedSpawner, timeouts: TimeoutConfig) -> Self {
            let (parent_tx, events) = mpsc::channel(64);
            let registry = Arc::new(EventRegistry::new(Duration::from_millis(200)));
            let test_id = uuid::Uuid::now_v7();
            let (handle, _join) = TestExecution::spawn(
                test_id,
                parent_tx,
                &spawner,
                registry.clone(),
                timeouts,
            );
            Self {
                test_id,
                handle,
                events,
                registry,
            }
        }

        async fn next_event(&mut self) -> FsmEvent {
            match tokio::time::timeout(Duration::from_secs(5), self.events.recv()).await {
                Ok(Some(CoordMsg::Fsm { event, .. })) => event,
                Ok(Some(other)) => panic!("unexpected coordinator message {other:?}"),
                Ok(None) => panic!("event channel closed"),
                Err(_) => panic!("timed out waiting for an event"),
            }
        }

        async fn start(&self, bucket: &str) -> StartAck {
            let (reply, rx) = oneshot::channel();
            self.handle
                .tx
                .send(FsmMsg::Start {
                    bucket: bucket.to_string(),
                    test_type: Some("e2e".to_string()),
                    reply,
                })
                .await
                .unwrap();
            rx.await.unwrap().unwrap()
        }

        async fn status(&self) -> TestStatus {
            let (reply, rx) = oneshot::channel();
            self.handle
                .tx
                .send(FsmMsg::Status { reply })
                .await
                .unwrap();
            rx.await.unwrap().unwrap()
        }

        async fn cancel(&self) -> CancelAck {
            let (reply, rx) = oneshot::channel();
            self.handle
                .tx
                .send(FsmMsg::Cancel { reply })
                .await
                .unwrap();
            rx.await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_completed_and_terminates() {
        let mut h = Harness::spawn(ScriptedSpawner::default(), test_timeouts());

        let ack = h.start("b").await;
        assert!(ack.accepted);
        assert!(matches!(h.next_event().await, FsmEvent::Loading));
        assert!(matches!(h.next_event().await, FsmEvent::Loaded));

        // the coordinator grants the testing slot
        h.handle.tx.send(FsmMsg::StartTesting).await.unwrap();
        assert!(matches!(h.next_event().await, FsmEvent::Started));

        match h.next_event().await {
            FsmEvent::Completed(result) => {
                assert!(result.passed);
                assert_eq!(result.scenarios_passed, 1);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        let status = h.status().await;
        assert_eq!(status.state, TestState::Completed);
        assert_eq!(status.success, Some(true));
        assert!(status.start_time.is_some() && status.end_time.is_some());

        // terminal pill drives the machine to reap itself
        assert!(matches!(h.next_event().await, FsmEvent::Stopping));
        assert!(matches!(h.next_event().await, FsmEvent::Terminated));
    }

    #[tokio::test]
    async fn failed_suite_lands_in_exception() {
        let mut h = Harness::spawn(
            ScriptedSpawner {
                suite_passes: false,
                ..Default::default()
            },
            test_timeouts(),
        );

        h.start("b").await;
        assert!(matches!(h.next_event().await, FsmEvent::Loading));
        assert!(matches!(h.next_event().await, FsmEvent::Loaded));
        h.handle.tx.send(FsmMsg::StartTesting).await.unwrap();
        assert!(matches!(h.next_event().await, FsmEvent::Started));

        match h.next_event().await {
            FsmEvent::Exception(error) => assert_eq!(error, "assertion failed"),
            other => panic!("expected Exception, got {other:?}"),
        }
        let status = h.status().await;
        assert_eq!(status.state, TestState::Exception);
        assert_eq!(status.success, Some(false));
    }

    #[tokio::test]
    async fn cancel_during_loading_skips_evidence_and_terminates() {
        let mut h = Harness::spawn(
            ScriptedSpawner {
                storage_delay: Duration::from_secs(10),
                ..Default::default()
            },
            test_timeouts(),
        );

        h.start("b").await;
        assert!(matches!(h.next_event().await, FsmEvent::Loading));

        let ack = h.cancel().await;
        assert!(ack.cancelled);
        assert!(matches!(h.next_event().await, FsmEvent::Stopping));
        assert_eq!(h.status().await.state, TestState::ShuttingDown);
        assert!(matches!(h.next_event().await, FsmEvent::Terminated));
    }

    #[tokio::test]
    async fn setup_timer_expiry_is_fatal() {
        let mut timeouts = test_timeouts();
        timeouts.setup_state = EnvMsDuration(Duration::from_millis(50));
        let mut h = Harness::spawn(ScriptedSpawner::default(), timeouts);

        match h.next_event().await {
            FsmEvent::Exception(error) => assert_eq!(error, "setup timeout"),
            other => panic!("expected Exception, got {other:?}"),
        }
        assert_eq!(h.status().await.state, TestState::Exception);
    }

    #[tokio::test]
    async fn slow_vault_hits_the_loading_timeout() {
        let mut timeouts = test_timeouts();
        timeouts.loading_state = EnvMsDuration(Duration::from_millis(100));
        let mut h = Harness::spawn(
            ScriptedSpawner {
                vault_delay: Duration::from_secs(10),
                ..Default::default()
            },
            timeouts,
        );

        h.start("b").await;
        assert!(matches!(h.next_event().await, FsmEvent::Loading));
        match h.next_event().await {
            FsmEvent::Exception(error) => assert_eq!(error, "loading timeout"),
            other => panic!("expected Exception, got {other:?}"),
        }
        let status = h.status().await;
        assert_eq!(status.state, TestState::Exception);
        assert_eq!(status.error.as_deref(), Some("loading timeout"));
    }

    #[tokio::test]
    async fn cancel_after_terminal_returns_false() {
        let mut h = Harness::spawn(ScriptedSpawner::default(), test_timeouts());

        h.start("b").await;
        assert!(matches!(h.next_event().await, FsmEvent::Loading));
        assert!(matches!(h.next_event().await, FsmEvent::Loaded));
        h.handle.tx.send(FsmMsg::StartTesting).await.unwrap();
        assert!(matches!(h.next_event().await, FsmEvent::Started));
        assert!(matches!(h.next_event().await, FsmEvent::Completed(_)));

        let ack = h.cancel().await;
        assert!(!ack.cancelled);
        assert!(ack.message.unwrap().starts_with("already"));
    }

    #[tokio::test]
    async fn registry_entry_lives_only_while_testing() {
        let mut h = Harness::spawn(ScriptedSpawner::default(), test_timeouts());

        h.start("b").await;
        assert!(matches!(h.next_event().await, FsmEvent::Loading));
        assert!(matches!(h.next_event().await, FsmEvent::Loaded));
        assert!(!h.registry.is_registered(&h.test_id));

        h.handle.tx.send(FsmMsg::StartTesting).await.unwrap();
        assert!(matches!(h.next_event().await, FsmEvent::Started));
        assert!(h.registry.is_registered(&h.test_id));

        assert!(matches!(h.next_event().await, FsmEvent::Completed(_)));
        assert!(matches!(h.next_event().await, FsmEvent::Stopping));
        assert!(!h.registry.is_registered(&h.test_id));
        assert!(matches!(h.next_event().await, FsmEvent::Terminated));
    }

    #[tokio::test]
    async fn ready_acks_outside_loading_are_ignored() {
        let mut h = Harness::spawn(ScriptedSpawner::default(), test_timeouts());

        // still in Setup: ready acks must not count toward Loaded
        for kind in [
            ChildKind::Storage,
            ChildKind::Vault,
            ChildKind::Scenario,
            ChildKind::Producer,
            ChildKind::Consumer,
        ] {
            h.handle.tx.send(FsmMsg::ChildReady(kind)).await.unwrap();
        }
        assert!(
            tokio::time::timeout(Duration::from_millis(200), h.events.recv())
                .await
                .is_err(),
            "a ready ack in Setup produced a progress event"
        );
        assert_eq!(h.status().await.state, TestState::Setup);

        // the normal path still announces Loaded after the real acks
        h.start("b").await;
        assert!(matches!(h.next_event().await, FsmEvent::Loading));
        assert!(matches!(h.next_event().await, FsmEvent::Loaded));
    }

    #[tokio::test]
    async fn second_start_is_not_accepted() {
        let mut h = Harness::spawn(ScriptedSpawner::default(), test_timeouts());
        assert!(h.start("b").await.accepted);
        assert!(matches!(h.next_event().await, FsmEvent::Loading));
        assert!(!h.start("b").await.accepted);
    }
}
