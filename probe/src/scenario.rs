//! Scenario suites and the engine seam.
//!
//! The behaviour-driven engine itself is a collaborator behind the
//! [`SuiteRunner`] trait: a blocking callable that receives the staged suite
//! plan and returns an aggregated report. The built-in [`PlanRunner`]
//! executes declarative produce/expect steps against the event registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cloudevent::CloudEvent;
use crate::model::{TestExecutionResult, TestId};
use crate::registry::{EventRegistry, FetchOutcome};
use crate::streams::producer::ProduceOutcome;

/// Event source attribute stamped on every produced CloudEvent.
const EVENT_SOURCE: &str = "urn:probe:harness";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuitePlan {
    pub scenarios: Vec<ScenarioPlan>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScenarioPlan {
    pub name: String,
    pub steps: Vec<StepPlan>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "step", rename_all = "kebab-case")]
pub enum StepPlan {
    /// Produce one event keyed by a fresh CloudEvent.
    Produce {
        topic: String,
        event_type: String,
        payload_version: String,
        correlation_id: String,
        data: serde_json::Value,
    },
    /// Assert that a matching event was consumed for the correlation id.
    /// `expect` is matched as a subset of the consumed document.
    Expect {
        topic: String,
        correlation_id: String,
        #[serde(default)]
        expect: Option<serde_json::Value>,
    },
    /// Anything the engine does not know; fails its scenario.
    #[serde(other)]
    Undefined,
}

/// Aggregated result of one suite run, as returned by the engine.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuiteReport {
    pub scenario_count: usize,
    pub scenarios_passed: usize,
    pub scenarios_failed: usize,
    pub scenarios_skipped: usize,
    pub step_count: usize,
    pub steps_passed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub steps_undefined: usize,
    pub duration_millis: u64,
    pub failed_scenarios: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.scenarios_failed == 0 && self.error_message.is_none()
    }

    pub fn into_result(self, test_id: TestId) -> TestExecutionResult {
        TestExecutionResult {
            test_id,
            passed: self.passed(),
            scenario_count: self.scenario_count,
            scenarios_passed: self.scenarios_passed,
            scenarios_failed: self.scenarios_failed,
            scenarios_skipped: self.scenarios_skipped,
            step_count: self.step_count,
            steps_passed: self.steps_passed,
            steps_failed: self.steps_failed,
            steps_skipped: self.steps_skipped,
            steps_undefined: self.steps_undefined,
            duration_millis: self.duration_millis,
            error_message: self.error_message,
            failed_scenarios: self.failed_scenarios,
        }
    }
}

/// What a step needs to reach the harness from the engine's worker thread.
#[derive(Clone)]
pub struct StepContext {
    pub registry: Arc<EventRegistry>,
    pub test_id: TestId,
    pub runtime: tokio::runtime::Handle,
    pub fetch_budget: Duration,
}

/// The engine: runs blocking on a dedicated worker and returns a report.
pub trait SuiteRunner: Send + Sync {
    fn run(&self, plan: &SuitePlan, ctx: &StepContext) -> SuiteReport;
}

/// Built-in engine executing declarative plans.
pub struct PlanRunner;

impl SuiteRunner for PlanRunner {
    fn run(&self, plan: &SuitePlan, ctx: &StepContext) -> SuiteReport {
        let started = Instant::now();
        let mut report = SuiteReport {
            scenario_count: plan.scenarios.len(),
            ..Default::default()
        };

        for scenario in &plan.scenarios {
            debug!(test_id = %ctx.test_id, scenario = %scenario.name, "running scenario");
            let mut failed: Option<String> = None;
            for step in &scenario.steps {
                report.step_count += 1;
                if failed.is_some() {
                    report.steps_skipped += 1;
                    continue;
                }
                match run_step(step, ctx) {
                    StepOutcome::Passed => report.steps_passed += 1,
                    StepOutcome::Failed(reason) => {
                        report.steps_failed += 1;
                        failed = Some(reason);
                    }
                    StepOutcome::Undefined => {
                        report.steps_undefined += 1;
                        failed = Some("undefined step".to_string());
                    }
                }
            }
            match failed {
                None => report.scenarios_passed += 1,
                Some(reason) => {
                    report.scenarios_failed += 1;
                    report.failed_scenarios.push(scenario.name.clone());
                    info!(test_id = %ctx.test_id, scenario = %scenario.name,
                          "scenario failed: {reason}");
                }
            }
        }

        report.duration_millis = started.elapsed().as_millis() as u64;
        report
    }
}

enum StepOutcome {
    Passed,
    Failed(String),
    Undefined,
}

fn run_step(step: &StepPlan, ctx: &StepContext) -> StepOutcome {
    match step {
        StepPlan::Produce {
            topic,
            event_type,
            payload_version,
            correlation_id,
            data,
        } => {
            let key = CloudEvent::new(
                EVENT_SOURCE,
                event_type,
                topic,
                correlation_id,
                payload_version,
            );
            let outcome = ctx.runtime.block_on(ctx.registry.produce_event(
                ctx.test_id,
                topic,
                key,
                data.clone(),
            ));
            match outcome {
                ProduceOutcome::Ack => StepOutcome::Passed,
                ProduceOutcome::Nack(cause) => {
                    StepOutcome::Failed(format!("produce to {topic} nacked: {cause:?}"))
                }
            }
        }
        StepPlan::Expect {
            topic,
            correlation_id,
            expect,
        } => {
            let outcome = ctx.runtime.block_on(ctx.registry.fetch_consumed(
                ctx.test_id,
                topic,
                correlation_id,
                ctx.fetch_budget,
            ));
            match outcome {
                FetchOutcome::Found(event) => match expect {
                    Some(expected) if !json_contains(&event.value, expected) => {
                        StepOutcome::Failed(format!(
                            "event {correlation_id} on {topic} did not match expectation"
                        ))
                    }
                    _ => StepOutcome::Passed,
                },
                FetchOutcome::NotAvailable => StepOutcome::Failed(format!(
                    "no event {correlation_id} consumed on {topic} within budget"
                )),
            }
        }
        StepPlan::Undefined => StepOutcome::Undefined,
    }
}

/// Subset match: every leaf of `expected` must be present and equal in
/// `actual`; extra fields in `actual` are fine.
fn json_contains(actual: &serde_json::Value, expected: &serde_json::Value) -> bool {
    match (actual, expected) {
        (serde_json::Value::Object(a), serde_json::Value::Object(e)) => e
            .iter()
            .all(|(k, v)| a.get(k).map_or(false, |av| json_contains(av, v))),
        (serde_json::Value::Array(a), serde_json::Value::Array(e)) => {
            a.len() == e.len() && a.iter().zip(e).all(|(av, ev)| json_contains(av, ev))
        }
        (a, e) => a == e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_from_kebab_case_json() {
        let raw = r#"{
            "scenarios": [{
                "name": "payment follows order",
                "steps": [
                    {"step": "produce", "topic": "orders", "event-type": "OrderEvent",
                     "payload-version": "1.0", "correlation-id": "corr-1",
                     "data": {"order-id": "o-1"}},
                    {"step": "expect", "topic": "payments", "correlation-id": "corr-1",
                     "expect": {"status": "done"}}
                ]
            }]
        }"#;
        let plan: SuitePlan = serde_json::from_str(raw).unwrap();
        assert_eq!(plan.scenarios.len(), 1);
        assert_eq!(plan.scenarios[0].steps.len(), 2);
        assert!(matches!(plan.scenarios[0].steps[0], StepPlan::Produce { .. }));
    }

    #[test]
    fn unknown_step_kinds_parse_as_undefined() {
        let raw = r#"{"step": "teleport", "where": "moon"}"#;
        let step: StepPlan = serde_json::from_str(raw).unwrap();
        assert!(matches!(step, StepPlan::Undefined));
    }

    #[test]
    fn subset_matching() {
        let actual = serde_json::json!({"a": 1, "b": {"c": "x", "d": 2}, "e": [1, 2]});
        assert!(json_contains(&actual, &serde_json::json!({"a": 1})));
        assert!(json_contains(&actual, &serde_json::json!({"b": {"c": "x"}})));
        assert!(json_contains(&actual, &serde_json::json!({"e": [1, 2]})));
        assert!(!json_contains(&actual, &serde_json::json!({"a": 2})));
        assert!(!json_contains(&actual, &serde_json::json!({"missing": 1})));
        assert!(!json_contains(&actual, &serde_json::json!({"e": [1]})));
    }

    #[test]
    fn report_aggregates_into_execution_result() {
        let report = SuiteReport {
            scenario_count: 2,
            scenarios_passed: 1,
            scenarios_failed: 1,
            step_count: 5,
            steps_passed: 3,
            steps_failed: 1,
            steps_skipped: 1,
            duration_millis: 12,
            failed_scenarios: vec!["second".to_string()],
            ..Default::default()
        };
        let test_id = uuid::Uuid::now_v7();
        let result = report.into_result(test_id);
        assert!(!result.passed);
        assert_eq!(result.failed_scenarios, vec!["second"]);
        assert_eq!(result.scenarios_passed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn plan_runner_counts_undefined_steps() {
        let registry = Arc::new(EventRegistry::new(Duration::from_millis(100)));
        let plan = SuitePlan {
            scenarios: vec![ScenarioPlan {
                name: "undefined".to_string(),
                steps: vec![StepPlan::Undefined],
            }],
        };
        let ctx = StepContext {
            registry,
            test_id: uuid::Uuid::now_v7(),
            runtime: tokio::runtime::Handle::current(),
            fetch_budget: Duration::from_millis(100),
        };
        let report = tokio::task::spawn_blocking(move || PlanRunner.run(&plan, &ctx))
            .await
            .unwrap();
        assert_eq!(report.steps_undefined, 1);
        assert_eq!(report.scenarios_failed, 1);
        assert!(!report.passed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn expect_step_fails_when_nothing_was_consumed() {
        let registry = Arc::new(EventRegistry::new(Duration::from_millis(100)));
        let test_id = uuid::Uuid::now_v7();
        let plan = SuitePlan {
            scenarios: vec![ScenarioPlan {
                name: "missing event".to_string(),
                steps: vec![StepPlan::Expect {
                    topic: "payments".to_string(),
                    correlation_id: "corr-x".to_string(),
                    expect: None,
                }],
            }],
        };
        let ctx = StepContext {
            registry,
            test_id,
            runtime: tokio::runtime::Handle::current(),
            fetch_budget: Duration::from_millis(50),
        };
        let report = tokio::task::spawn_blocking(move || PlanRunner.run(&plan, &ctx))
            .await
            .unwrap();
        assert_eq!(report.scenarios_failed, 1);
        assert_eq!(report.failed_scenarios, vec!["missing event"]);
    }
}
