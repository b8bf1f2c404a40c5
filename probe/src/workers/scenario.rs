use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::execution::{ChildKind, FsmMsg};
use crate::memfs::MemFs;
use crate::model::{BlockStorageDirective, ExecError, TestId};
use crate::registry::EventRegistry;
use crate::scenario::{ScenarioPlan, StepContext, SuitePlan, SuiteRunner};

pub enum ScenarioMsg {
    Initialize {
        directive: Box<BlockStorageDirective>,
    },
    StartTest,
    Stop,
}

#[derive(Clone)]
pub struct ScenarioHandle {
    tx: mpsc::Sender<ScenarioMsg>,
}

impl ScenarioHandle {
    pub(crate) fn new(tx: mpsc::Sender<ScenarioMsg>) -> Self {
        Self { tx }
    }

    pub async fn initialize(&self, directive: BlockStorageDirective) {
        let _unused = self
            .tx
            .send(ScenarioMsg::Initialize {
                directive: Box::new(directive),
            })
            .await;
    }

    pub async fn start_test(&self) {
        let _unused = self.tx.send(ScenarioMsg::StartTest).await;
    }

    pub async fn stop(&self) {
        let _unused = self.tx.send(ScenarioMsg::Stop).await;
    }
}

/// Runs the staged suite through the engine on the blocking worker pool and
/// reports the aggregated result. The engine call itself is a black box;
/// this worker owns staging, thread registration, and the evidence report.
pub struct ScenarioWorker {
    test_id: TestId,
    runner: Arc<dyn SuiteRunner>,
    registry: Arc<EventRegistry>,
    memfs: MemFs,
    fsm: mpsc::Sender<FsmMsg>,
    fetch_budget: Duration,
    loaded: Option<Loaded>,
}

struct Loaded {
    plan: SuitePlan,
    evidence_dir: String,
}

impl ScenarioWorker {
    pub fn spawn(
        test_id: TestId,
        runner: Arc<dyn SuiteRunner>,
        registry: Arc<EventRegistry>,
        memfs: MemFs,
        fetch_budget: Duration,
        fsm: mpsc::Sender<FsmMsg>,
    ) -> (ScenarioHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(8);
        let worker = Self {
            test_id,
            runner,
            registry,
            memfs,
            fsm,
            fetch_budget,
            loaded: None,
        };
        let join = tokio::spawn(worker.run(rx));
        (ScenarioHandle::new(tx), join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ScenarioMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ScenarioMsg::Initialize { directive } => {
                    if self.loaded.is_some() {
                        // second Initialize is a no-op, no duplicate ready ack
                        continue;
                    }
                    match self.load(&directive) {
                        Ok(loaded) => {
                            info!(test_id = %self.test_id,
                                  scenarios = loaded.plan.scenarios.len(), "suite staged");
                            self.loaded = Some(loaded);
                            let _unused = self
                                .fsm
                                .send(FsmMsg::ChildReady(ChildKind::Scenario))
                                .await;
                        }
                        Err(e) => {
                            error!(test_id = %self.test_id, "suite staging failed: {e}");
                            let _unused = self
                                .fsm
                                .send(FsmMsg::ChildFailed(ChildKind::Scenario, e))
                                .await;
                        }
                    }
                }
                ScenarioMsg::StartTest => {
                    let Some(loaded) = &self.loaded else {
                        let _unused = self
                            .fsm
                            .send(FsmMsg::ChildFailed(
                                ChildKind::Scenario,
                                ExecError::ScenarioFailed("start before staging".to_string()),
                            ))
                            .await;
                        continue;
                    };
                    self.start_suite(loaded.plan.clone(), loaded.evidence_dir.clone());
                }
                ScenarioMsg::Stop => break,
            }
        }
        debug!(test_id = %self.test_id, "scenario worker stopped");
    }

    fn load(&self, directive: &BlockStorageDirective) -> Result<Loaded, ExecError> {
        let root = directive.staging_root.trim_end_matches('/');
        let mut plan = SuitePlan::default();
        for (path, contents) in self.memfs.read_dir(&format!("{root}/scenarios")) {
            let scenario: ScenarioPlan = serde_json::from_slice(&contents).map_err(|e| {
                ExecError::ScenarioFailed(format!("unparseable scenario {path}: {e}"))
            })?;
            plan.scenarios.push(scenario);
        }
        Ok(Loaded {
            plan,
            evidence_dir: format!("{root}/{}", directive.evidence_dir.trim_matches('/')),
        })
    }

    /// Dispatch the blocking engine run to the dedicated blocking pool; the
    /// result re-enters the state machine as a message.
    fn start_suite(&self, plan: SuitePlan, evidence_dir: String) {
        let runner = self.runner.clone();
        let registry = self.registry.clone();
        let test_id = self.test_id;
        let fetch_budget = self.fetch_budget;
        let memfs = self.memfs.clone();
        let fsm = self.fsm.clone();
        let runtime = tokio::runtime::Handle::current();

        tokio::spawn(async move {
            let suite_registry = registry.clone();
            let join = tokio::task::spawn_blocking(move || {
                let ctx = StepContext {
                    registry: suite_registry.clone(),
                    test_id,
                    runtime,
                    fetch_budget,
                };
                // bind this worker thread to the test so no-arg step
                // listeners can find it, and unbind however the run ends
                suite_registry.enter_suite(test_id);
                let report = runner.run(&plan, &ctx);
                suite_registry.exit_suite();
                report
            });

            match join.await {
                Ok(report) => {
                    if let Ok(rendered) = serde_json::to_vec_pretty(&report) {
                        memfs.write(&format!("{evidence_dir}/report.json"), rendered);
                    }
                    let result = report.into_result(test_id);
                    let _unused = fsm.send(FsmMsg::SuiteFinished(Box::new(result))).await;
                }
                Err(e) => {
                    error!(%test_id, "suite run aborted: {e}");
                    let _unused = fsm
                        .send(FsmMsg::ChildFailed(
                            ChildKind::Scenario,
                            ExecError::ScenarioFailed("suite run aborted".to_string()),
                        ))
                        .await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::SuiteReport;

    struct CannedRunner {
        report: SuiteReport,
    }

    impl SuiteRunner for CannedRunner {
        fn run(&self, _plan: &SuitePlan, ctx: &StepContext) -> SuiteReport {
            // the thread registration must be visible during the run
            assert_eq!(ctx.registry.current_test(), Some(ctx.test_id));
            self.report.clone()
        }
    }

    fn directive() -> BlockStorageDirective {
        serde_json::from_value(serde_json::json!({
            "bucket": "b",
            "staging-root": "/staging/t",
            "evidence-dir": "evidence",
            "topics": []
        }))
        .unwrap()
    }

    fn staged_memfs() -> MemFs {
        let memfs = MemFs::new();
        memfs.write(
            "/staging/t/scenarios/happy.json",
            serde_json::json!({
                "name": "happy",
                "steps": []
            })
            .to_string(),
        );
        memfs
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn suite_runs_and_reports_through_the_fsm() {
        let report = SuiteReport {
            scenario_count: 1,
            scenarios_passed: 1,
            step_count: 0,
            duration_millis: 1,
            ..Default::default()
        };
        let registry = Arc::new(EventRegistry::new(Duration::from_millis(100)));
        let memfs = staged_memfs();
        let test_id = uuid::Uuid::now_v7();
        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let (handle, _join) = ScenarioWorker::spawn(
            test_id,
            Arc::new(CannedRunner { report }),
            registry.clone(),
            memfs.clone(),
            Duration::from_millis(100),
            fsm_tx,
        );

        handle.initialize(directive()).await;
        assert!(matches!(
            fsm_rx.recv().await.unwrap(),
            FsmMsg::ChildReady(ChildKind::Scenario)
        ));

        handle.start_test().await;
        match fsm_rx.recv().await.unwrap() {
            FsmMsg::SuiteFinished(result) => {
                assert!(result.passed);
                assert_eq!(result.test_id, test_id);
                assert_eq!(result.scenarios_passed, 1);
            }
            other => panic!("expected SuiteFinished, got {other:?}"),
        }

        // the report landed in the evidence directory
        assert!(memfs.read("/staging/t/evidence/report.json").is_some());
        // and the thread binding was popped after the run
        assert!(registry.current_test().is_none());
    }

    #[tokio::test]
    async fn start_before_initialize_fails_the_child() {
        let registry = Arc::new(EventRegistry::new(Duration::from_millis(100)));
        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let (handle, _join) = ScenarioWorker::spawn(
            uuid::Uuid::now_v7(),
            Arc::new(CannedRunner {
                report: SuiteReport::default(),
            }),
            registry,
            MemFs::new(),
            Duration::from_millis(100),
            fsm_tx,
        );

        handle.start_test().await;
        assert!(matches!(
            fsm_rx.recv().await.unwrap(),
            FsmMsg::ChildFailed(ChildKind::Scenario, ExecError::ScenarioFailed(_))
        ));
    }

    #[tokio::test]
    async fn malformed_scenario_file_fails_staging() {
        let registry = Arc::new(EventRegistry::new(Duration::from_millis(100)));
        let memfs = MemFs::new();
        memfs.write("/staging/t/scenarios/broken.json", &b"not json"[..]);
        let (fsm_tx, mut fsm_rx) = mpsc::channel(8);
        let (handle, _join) = ScenarioWorker::spawn(
            uuid::Uuid::now_v7(),
            Arc::new(CannedRunner {
                report: SuiteReport::default(),
            }),
            registry,
            memfs,
            Duration::from_millis(100),
            fsm_tx,
        );

        handle.initialize(directive()).await;
        assert!(matches!(
            fsm_rx.recv().await.unwrap(),
            FsmMsg::ChildFailed(ChildKind::Scenario, ExecError::ScenarioFailed(_))
        ));
    }
}
