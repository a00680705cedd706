mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{persona, scenario, with_criteria, FnManager, PatientClient};
use dialogbench::{
    AgentContext, AgentInvocationError, AgentVersion, BenchmarkConfig, BenchmarkError,
    BenchmarkRunner, EngineConfig, EventRecorder, Evaluator, ManagerAgent, ManagerReply,
    MemoryRecorder, RecordedEvent, ScenarioCase, TerminalState, ToolCall, ToolResult, Turn,
};
use serde_json::json;
use tokio::sync::Notify;

fn cases(ids: &[&str]) -> Vec<ScenarioCase> {
    ids.iter()
        .map(|id| {
            ScenarioCase::new(
                with_criteria(scenario(id, 3, 60), &[("products_shown", true)]),
                persona(),
            )
        })
        .collect()
}

fn versions(labels: &[&str]) -> Vec<AgentVersion> {
    labels
        .iter()
        .map(|label| AgentVersion::new(*label, format!("http://unused/{label}")))
        .collect()
}

fn runner(concurrency: usize) -> BenchmarkRunner {
    BenchmarkRunner::new(
        &BenchmarkConfig::default().with_concurrency(concurrency),
        EngineConfig::default(),
        Arc::new(Evaluator::default()),
    )
}

fn client() -> Arc<PatientClient> {
    Arc::new(PatientClient { satisfied_after: 1 })
}

fn catalog_reply() -> ManagerReply {
    ManagerReply::new("Вот букеты до 10000 тенге").with_tool_call(ToolCall::new(
        "list_products",
        json!({"max_price": 10000}),
        ToolResult::ok(json!({"items": [{"name": "Тюльпаны", "price": 8500}]})),
    ))
}

/// `v1` always looks the catalog up, `v2` only does so for `s1`. Scenario
/// `s1` is the slowest so completion order differs from input order.
fn grid_manager(version: &AgentVersion) -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
    let label = version.label.clone();
    let manager = FnManager::new(move |ctx: &AgentContext, _history: &[Turn]| {
        if label == "v1" || ctx.scenario_id == "s1" {
            Ok(catalog_reply())
        } else {
            Ok(ManagerReply::new("Могу я вам чем-то помочь?"))
        }
    })
    .with_delay(|ctx| match ctx.scenario_id.as_str() {
        "s1" => Duration::from_millis(300),
        "s2" => Duration::from_millis(50),
        _ => Duration::ZERO,
    });
    Ok(Arc::new(manager))
}

#[tokio::test(start_paused = true)]
async fn grid_keeps_input_order_and_scores_each_version() {
    let report = runner(2)
        .run(&cases(&["s1", "s2", "s3"]), &versions(&["v1", "v2"]), &grid_manager, client())
        .await
        .expect("benchmark runs");

    assert!(!report.aborted);
    assert_eq!(report.scenarios, vec!["s1", "s2", "s3"]);
    assert_eq!(report.versions, vec!["v1", "v2"]);

    let order: Vec<_> = report
        .entries
        .iter()
        .map(|e| (e.scenario_id.as_str(), e.version.as_str()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("s1", "v1"),
            ("s1", "v2"),
            ("s2", "v1"),
            ("s2", "v2"),
            ("s3", "v1"),
            ("s3", "v2"),
        ]
    );

    let v1 = report.summary("v1").expect("v1 summary");
    assert_eq!((v1.runs, v1.passed), (3, 3));
    assert_eq!(v1.success_rate, 1.0);

    let v2 = report.summary("v2").expect("v2 summary");
    assert_eq!((v2.runs, v2.passed), (3, 1));
    assert!((v2.success_rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(v2.total_errors, 0);

    let row = &report.rows[1];
    assert_eq!(row.scenario_id, "s2");
    let cells: Vec<_> = row
        .cells
        .iter()
        .map(|cell| cell.as_ref().map(|c| c.passed))
        .collect();
    assert_eq!(cells, vec![Some(true), Some(false)]);
    assert!(report.entry("s3", "v1").and_then(|e| e.record.as_ref()).is_some());
}

struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct GaugedManager(Arc<Gauge>);

#[async_trait]
impl ManagerAgent for GaugedManager {
    async fn respond(
        &self,
        _ctx: &AgentContext,
        _history: &[Turn],
    ) -> Result<ManagerReply, AgentInvocationError> {
        let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(catalog_reply())
    }
}

#[tokio::test(start_paused = true)]
async fn concurrency_limit_bounds_pairs_in_flight() {
    let gauge = Arc::new(Gauge {
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let shared = gauge.clone();
    let factory = move |_: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        Ok(Arc::new(GaugedManager(shared.clone())))
    };

    let report = runner(2)
        .run(
            &cases(&["a", "b", "c", "d"]),
            &versions(&["v1", "v2"]),
            &factory,
            client(),
        )
        .await
        .expect("benchmark runs");

    assert_eq!(report.entries.len(), 8);
    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in flight was {peak}");
}

#[tokio::test(start_paused = true)]
async fn panicking_pair_does_not_affect_its_neighbours() {
    let factory = |version: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        let label = version.label.clone();
        Ok(Arc::new(FnManager::new(
            move |ctx: &AgentContext, _history: &[Turn]| {
                if label == "v1" && ctx.scenario_id == "s2" {
                    panic!("manager crashed on s2");
                }
                Ok(catalog_reply())
            },
        )))
    };

    let report = runner(3)
        .run(&cases(&["s1", "s2", "s3"]), &versions(&["v1", "v2"]), &factory, client())
        .await
        .expect("benchmark runs");

    assert_eq!(report.entries.len(), 6);
    let crashed = report.entry("s2", "v1").expect("crashed pair is reported");
    assert_eq!(crashed.terminal_state, TerminalState::Error);
    assert!(!crashed.passed());
    let reason = crashed
        .record
        .as_ref()
        .and_then(|r| r.error.as_deref())
        .unwrap_or_default();
    assert!(reason.contains("manager crashed on s2"), "{reason}");

    let v1 = report.summary("v1").expect("v1 summary");
    assert_eq!((v1.passed, v1.total_errors), (2, 1));
    assert_eq!(report.summary("v2").map(|s| s.passed), Some(3));
}

#[tokio::test]
async fn unbuildable_version_fails_its_pairs_only() {
    let factory = |version: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        if version.label == "broken" {
            return Err(AgentInvocationError::malformed("no such endpoint"));
        }
        Ok(Arc::new(FnManager::new(|_: &AgentContext, _: &[Turn]| Ok(catalog_reply()))))
    };

    let report = runner(4)
        .run(&cases(&["s1", "s2"]), &versions(&["good", "broken"]), &factory, client())
        .await
        .expect("benchmark runs");

    let good = report.summary("good").expect("good summary");
    assert_eq!(good.passed, 2);
    let broken = report.summary("broken").expect("broken summary");
    assert_eq!((broken.runs, broken.passed, broken.total_errors), (2, 0, 2));
    let error = report
        .entry("s1", "broken")
        .and_then(|e| e.record.as_ref())
        .and_then(|r| r.error.clone())
        .unwrap_or_default();
    assert!(error.contains("failed to build manager agent"), "{error}");
}

#[tokio::test(start_paused = true)]
async fn abort_returns_the_pairs_that_finished() {
    let factory = |_: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        Ok(Arc::new(
            FnManager::new(|_: &AgentContext, _: &[Turn]| Ok(catalog_reply())).with_delay(|ctx| {
                if ctx.scenario_id == "slow" {
                    Duration::from_secs(30)
                } else {
                    Duration::from_millis(10)
                }
            }),
        ))
    };

    let report = runner(6)
        .run_until(
            &cases(&["fast", "slow", "steady"]),
            &versions(&["v1", "v2"]),
            &factory,
            client(),
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await
        .expect("benchmark runs");

    assert!(report.aborted);
    assert_eq!(report.entries.len(), 4);
    assert!(report.entry("slow", "v1").is_none());
    assert_eq!(report.rows[1].scenario_id, "slow");
    assert!(report.rows[1].cells.iter().all(Option::is_none));
    assert!(report.rows[0].cells.iter().all(Option::is_some));
    assert_eq!(report.summary("v1").map(|s| s.runs), Some(2));
}

#[tokio::test]
async fn abort_keeps_a_pair_that_finished_in_the_same_wakeup() {
    let finished = Arc::new(Notify::new());
    let signal = finished.clone();
    let factory = move |_: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        let signal = signal.clone();
        Ok(Arc::new(FnManager::new(move |_: &AgentContext, _: &[Turn]| {
            signal.notify_one();
            Ok(catalog_reply())
        })))
    };

    let report = runner(1)
        .run_until(
            &cases(&["s1"]),
            &versions(&["v1"]),
            &factory,
            client(),
            finished.notified(),
        )
        .await
        .expect("benchmark runs");

    assert!(report.aborted);
    assert_eq!(report.entries.len(), 1);
    let entry = report.entry("s1", "v1").expect("finished pair is kept");
    assert_eq!(entry.terminal_state, TerminalState::GoalAchieved);
    assert!(report.rows[0].cells[0].is_some());
    assert_eq!(report.summary("v1").map(|s| s.runs), Some(1));
}

/// Refuses every outcome event.
struct FullDiskRecorder;

impl EventRecorder for FullDiskRecorder {
    fn append(&self, event: RecordedEvent) {
        if matches!(event, RecordedEvent::Outcome { .. }) {
            panic!("disk full");
        }
    }
}

#[tokio::test]
async fn panic_outside_the_dialogue_still_yields_an_entry() {
    let factory = |_: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        Ok(Arc::new(FnManager::new(|_: &AgentContext, _: &[Turn]| Ok(catalog_reply()))))
    };

    let report = runner(2)
        .with_recorder(Arc::new(FullDiskRecorder))
        .run(&cases(&["s1", "s2"]), &versions(&["v1"]), &factory, client())
        .await
        .expect("benchmark runs");

    assert_eq!(report.entries.len(), 2);
    assert!(report.rows.iter().all(|row| row.cells[0].is_some()));
    let summary = report.summary("v1").expect("v1 summary");
    assert_eq!((summary.runs, summary.passed, summary.total_errors), (2, 0, 2));
    let reason = report
        .entry("s1", "v1")
        .and_then(|e| e.record.as_ref())
        .and_then(|r| r.error.clone())
        .unwrap_or_default();
    assert!(reason.contains("disk full"), "{reason}");
}

#[tokio::test]
async fn every_pair_records_one_outcome() {
    let recorder = Arc::new(MemoryRecorder::new());
    let factory = |version: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        if version.label == "broken" {
            return Err(AgentInvocationError::malformed("unreachable"));
        }
        Ok(Arc::new(FnManager::new(|_: &AgentContext, _: &[Turn]| Ok(catalog_reply()))))
    };

    runner(2)
        .with_recorder(recorder.clone())
        .without_records()
        .run(&cases(&["s1", "s2"]), &versions(&["ok", "broken"]), &factory, client())
        .await
        .expect("benchmark runs");

    let outcomes: Vec<_> = recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, RecordedEvent::Outcome { .. }))
        .collect();
    assert_eq!(outcomes.len(), 4);
}

#[tokio::test]
async fn invalid_inputs_are_rejected_before_running() {
    let factory = |_: &AgentVersion| -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        Ok(Arc::new(FnManager::new(|_: &AgentContext, _: &[Turn]| Ok(catalog_reply()))))
    };
    let scenarios = cases(&["s1"]);

    let error = runner(2)
        .run(&scenarios, &versions(&["v1", "v1"]), &factory, client())
        .await
        .unwrap_err();
    assert_eq!(error, BenchmarkError::DuplicateVersion("v1".into()));

    let error = runner(2)
        .run(&scenarios, &[], &factory, client())
        .await
        .unwrap_err();
    assert_eq!(error, BenchmarkError::NoVersions);

    let error = runner(0)
        .run(&scenarios, &versions(&["v1"]), &factory, client())
        .await
        .unwrap_err();
    assert_eq!(error, BenchmarkError::ZeroConcurrency);

    let doubled = [scenarios[0].clone(), scenarios[0].clone()];
    let error = runner(1)
        .run(&doubled, &versions(&["v1"]), &factory, client())
        .await
        .unwrap_err();
    assert_eq!(error, BenchmarkError::DuplicateScenario("s1".into()));

    let error = BenchmarkRunner::new(
        &BenchmarkConfig::default(),
        EngineConfig::default().with_tool_failure_ceiling(0),
        Arc::new(Evaluator::default()),
    )
    .run(&scenarios, &versions(&["v1"]), &factory, client())
    .await
    .unwrap_err();
    assert!(matches!(error, BenchmarkError::InvalidEngine(ref m) if m.contains("tool_failure_ceiling")));
}
