//! Runs every scenario against every manager agent version and aggregates
//! the results into a comparison.

use std::{
    collections::BTreeSet,
    future::{self, Future},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};

use crate::{
    agents::{ClientAgent, HttpManagerAgent, ManagerAgent},
    config::{AgentVersion, BenchmarkConfig, EngineConfig},
    conversation::{ConversationRecord, Speaker, TerminalState, Turn},
    engine::DialogueEngine,
    error::{panic_message, AgentInvocationError},
    evaluator::{EvaluationResult, Evaluator},
    metrics::{mean, RunMetrics},
    recorder::{EventRecorder, NullRecorder},
    scenario::{Scenario, ScenarioCase},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BenchmarkError {
    #[error("scenario '{0}' appears more than once")]
    DuplicateScenario(String),
    #[error("agent version '{0}' appears more than once")]
    DuplicateVersion(String),
    #[error("no agent versions to benchmark")]
    NoVersions,
    #[error("concurrency limit must be at least 1")]
    ZeroConcurrency,
    #[error("{0}")]
    InvalidEngine(String),
}

/// Builds the manager agent for one version.
pub trait ManagerAgentFactory: Send + Sync {
    fn build(&self, version: &AgentVersion) -> Result<Arc<dyn ManagerAgent>, AgentInvocationError>;
}

impl<F> ManagerAgentFactory for F
where
    F: Fn(&AgentVersion) -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> + Send + Sync,
{
    fn build(&self, version: &AgentVersion) -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        self(version)
    }
}

/// Builds an [`HttpManagerAgent`] from each version's endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpManagerFactory;

impl ManagerAgentFactory for HttpManagerFactory {
    fn build(&self, version: &AgentVersion) -> Result<Arc<dyn ManagerAgent>, AgentInvocationError> {
        Ok(Arc::new(HttpManagerAgent::from_version(version)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    pub scenario_id: String,
    pub version: String,
    pub terminal_state: TerminalState,
    pub evaluation: EvaluationResult,
    pub metrics: RunMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<ConversationRecord>,
}

impl BenchmarkEntry {
    pub fn passed(&self) -> bool {
        self.evaluation.passed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub label: String,
    pub runs: usize,
    pub passed: usize,
    /// `passed / runs`, 0 when nothing ran.
    pub success_rate: f64,
    pub avg_response_ms: Option<f64>,
    pub avg_turns: Option<f64>,
    /// Runs that ended in `error` or `timeout`.
    pub total_errors: usize,
    pub total_tool_errors: usize,
    pub total_cost_usd: f64,
    pub avg_cache_hit_ratio: Option<f64>,
}

impl VersionSummary {
    pub fn from_entries<'a>(label: &str, entries: impl IntoIterator<Item = &'a BenchmarkEntry>) -> Self {
        let entries: Vec<&BenchmarkEntry> = entries.into_iter().collect();
        let runs = entries.len();
        let passed = entries.iter().filter(|e| e.passed()).count();

        Self {
            label: label.to_string(),
            runs,
            passed,
            success_rate: if runs == 0 { 0.0 } else { passed as f64 / runs as f64 },
            avg_response_ms: mean(entries.iter().filter_map(|e| e.metrics.avg_response_ms)),
            avg_turns: mean(entries.iter().map(|e| e.metrics.turns as f64)),
            total_errors: entries
                .iter()
                .filter(|e| e.terminal_state.is_incomplete())
                .count(),
            total_tool_errors: entries.iter().map(|e| e.metrics.tool_errors).sum(),
            total_cost_usd: entries.iter().map(|e| e.metrics.estimated_cost_usd).sum(),
            avg_cache_hit_ratio: mean(entries.iter().filter_map(|e| e.metrics.cache_hit_ratio)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutcome {
    pub passed: bool,
    pub terminal_state: TerminalState,
    pub turns: usize,
    pub elapsed_ms: u64,
}

/// One scenario across all versions, cells in version input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRow {
    pub scenario_id: String,
    /// `None` when the pair never finished (aborted sweep).
    pub cells: Vec<Option<CellOutcome>>,
}

/// A scenario document left out of the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedScenario {
    /// File path or scenario id.
    pub source: String,
    pub reason: String,
}

impl RejectedScenario {
    pub fn new(source: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            source: source.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub versions: Vec<String>,
    pub scenarios: Vec<String>,
    pub summaries: Vec<VersionSummary>,
    pub rows: Vec<ScenarioRow>,
    /// Completed pairs, scenario-major in input order.
    pub entries: Vec<BenchmarkEntry>,
    pub aborted: bool,
    /// Scenarios that never made it into the grid.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedScenario>,
}

impl BenchmarkReport {
    pub fn summary(&self, label: &str) -> Option<&VersionSummary> {
        self.summaries.iter().find(|s| s.label == label)
    }

    pub fn entry(&self, scenario_id: &str, version: &str) -> Option<&BenchmarkEntry> {
        self.entries
            .iter()
            .find(|e| e.scenario_id == scenario_id && e.version == version)
    }

    fn assemble(
        scenarios: &[ScenarioCase],
        versions: &[AgentVersion],
        grid: Vec<Vec<Option<BenchmarkEntry>>>,
        aborted: bool,
    ) -> Self {
        let rows = scenarios
            .iter()
            .zip(&grid)
            .map(|(case, cells)| ScenarioRow {
                scenario_id: case.scenario.id.clone(),
                cells: cells
                    .iter()
                    .map(|cell| {
                        cell.as_ref().map(|entry| CellOutcome {
                            passed: entry.passed(),
                            terminal_state: entry.terminal_state,
                            turns: entry.metrics.turns,
                            elapsed_ms: entry.metrics.elapsed_ms,
                        })
                    })
                    .collect(),
            })
            .collect();

        let entries: Vec<BenchmarkEntry> = grid.into_iter().flatten().flatten().collect();
        let summaries = versions
            .iter()
            .map(|version| {
                VersionSummary::from_entries(
                    &version.label,
                    entries.iter().filter(|e| e.version == version.label),
                )
            })
            .collect();

        Self {
            versions: versions.iter().map(|v| v.label.clone()).collect(),
            scenarios: scenarios.iter().map(|c| c.scenario.id.clone()).collect(),
            summaries,
            rows,
            entries,
            aborted,
            rejected: Vec::new(),
        }
    }

    pub fn with_rejected(mut self, rejected: Vec<RejectedScenario>) -> Self {
        self.rejected = rejected;
        self
    }
}

/// Runs the scenario × version grid with bounded concurrency. Each pair gets
/// its own engine run; pairs share only the client agent and the recorder.
pub struct BenchmarkRunner {
    engine: EngineConfig,
    concurrency: usize,
    evaluator: Arc<Evaluator>,
    recorder: Arc<dyn EventRecorder>,
    keep_records: bool,
}

impl BenchmarkRunner {
    pub fn new(config: &BenchmarkConfig, engine: EngineConfig, evaluator: Arc<Evaluator>) -> Self {
        Self {
            engine,
            concurrency: config.concurrency,
            evaluator,
            recorder: Arc::new(NullRecorder),
            keep_records: true,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Drop full conversation records from entries once they are scored.
    pub fn without_records(mut self) -> Self {
        self.keep_records = false;
        self
    }

    pub async fn run(
        &self,
        scenarios: &[ScenarioCase],
        versions: &[AgentVersion],
        factory: &dyn ManagerAgentFactory,
        client: Arc<dyn ClientAgent>,
    ) -> Result<BenchmarkReport, BenchmarkError> {
        self.run_until(scenarios, versions, factory, client, future::pending())
            .await
    }

    /// Like [`run`](Self::run), but stops when `abort` resolves. In-flight
    /// pairs are cancelled and the report holds only what completed.
    pub async fn run_until(
        &self,
        scenarios: &[ScenarioCase],
        versions: &[AgentVersion],
        factory: &dyn ManagerAgentFactory,
        client: Arc<dyn ClientAgent>,
        abort: impl Future<Output = ()>,
    ) -> Result<BenchmarkReport, BenchmarkError> {
        self.validate(scenarios, versions)?;

        let managers: Vec<Result<Arc<dyn ManagerAgent>, String>> = versions
            .iter()
            .map(|version| {
                factory.build(version).map_err(|error| {
                    tracing::warn!(version = %version.label, %error, "could not build manager agent");
                    format!("failed to build manager agent: {error}")
                })
            })
            .collect();

        tracing::info!(
            scenarios = scenarios.len(),
            versions = versions.len(),
            concurrency = self.concurrency,
            "starting benchmark"
        );

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut pairs = JoinSet::new();
        for (si, case) in scenarios.iter().enumerate() {
            for (vi, version) in versions.iter().enumerate() {
                let pair = Pair {
                    scenario_index: si,
                    version_index: vi,
                    case: case.clone(),
                    version: version.clone(),
                    manager: managers[vi].clone(),
                    client: client.clone(),
                    engine: self.engine.clone(),
                    evaluator: self.evaluator.clone(),
                    recorder: self.recorder.clone(),
                    keep_records: self.keep_records,
                };
                let slots = slots.clone();
                pairs.spawn(async move {
                    let _permit = slots.acquire_owned().await.ok();
                    pair.execute().await
                });
            }
        }

        let mut grid: Vec<Vec<Option<BenchmarkEntry>>> = vec![vec![None; versions.len()]; scenarios.len()];
        let mut aborted = false;
        let mut abort = std::pin::pin!(abort);
        loop {
            tokio::select! {
                biased;
                _ = &mut abort => {
                    tracing::warn!(in_flight = pairs.len(), "benchmark aborted");
                    pairs.abort_all();
                    aborted = true;
                    break;
                }
                joined = pairs.join_next() => match joined {
                    Some(joined) => settle_slot(&mut grid, joined),
                    None => break,
                },
            }
        }
        // Pairs that finished before the abort took effect still count.
        while let Some(joined) = pairs.join_next().await {
            settle_slot(&mut grid, joined);
        }

        let report = BenchmarkReport::assemble(scenarios, versions, grid, aborted);
        for summary in &report.summaries {
            tracing::info!(
                version = %summary.label,
                runs = summary.runs,
                passed = summary.passed,
                success_rate = summary.success_rate,
                "version summary"
            );
        }
        Ok(report)
    }

    fn validate(&self, scenarios: &[ScenarioCase], versions: &[AgentVersion]) -> Result<(), BenchmarkError> {
        if self.concurrency == 0 {
            return Err(BenchmarkError::ZeroConcurrency);
        }
        self.engine
            .validate()
            .map_err(|error| BenchmarkError::InvalidEngine(error.to_string()))?;
        if versions.is_empty() {
            return Err(BenchmarkError::NoVersions);
        }
        let mut seen = BTreeSet::new();
        for case in scenarios {
            if !seen.insert(case.scenario.id.as_str()) {
                return Err(BenchmarkError::DuplicateScenario(case.scenario.id.clone()));
            }
        }
        let mut seen = BTreeSet::new();
        for version in versions {
            if !seen.insert(version.label.as_str()) {
                return Err(BenchmarkError::DuplicateVersion(version.label.clone()));
            }
        }
        Ok(())
    }
}

/// Everything one spawned pair needs, owned.
struct Pair {
    scenario_index: usize,
    version_index: usize,
    case: ScenarioCase,
    version: AgentVersion,
    manager: Result<Arc<dyn ManagerAgent>, String>,
    client: Arc<dyn ClientAgent>,
    engine: EngineConfig,
    evaluator: Arc<Evaluator>,
    recorder: Arc<dyn EventRecorder>,
    keep_records: bool,
}

impl Pair {
    /// Never unwinds: a panic anywhere in the run, the recorder or the
    /// evaluator becomes a failed `error` entry for this pair.
    async fn execute(self) -> (usize, usize, BenchmarkEntry) {
        let slot = (self.scenario_index, self.version_index);
        let scenario = self.case.scenario.clone();
        let label = self.version.label.clone();
        let evaluator = self.evaluator.clone();
        let recorder = self.recorder.clone();
        let keep_records = self.keep_records;

        let entry = match AssertUnwindSafe(self.settle()).catch_unwind().await {
            Ok(entry) => entry,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(scenario = %scenario.id, version = %label, %message, "pair panicked");
                let record = failed_record(&scenario, &label, format!("run panicked: {message}"));
                if catch_unwind(AssertUnwindSafe(|| recorder.record_outcome(&record))).is_err() {
                    tracing::error!(run_id = %record.run_id, "recorder panicked on failure outcome");
                }
                score(&evaluator, &scenario, label, record, keep_records)
            }
        };
        (slot.0, slot.1, entry)
    }

    async fn settle(self) -> BenchmarkEntry {
        let scenario = &self.case.scenario;
        let label = self.version.label.clone();

        let record = match &self.manager {
            Ok(manager) => {
                DialogueEngine::new(self.engine.clone(), self.recorder.clone())
                    .with_version(label.clone())
                    .with_pricing(self.version.pricing.clone())
                    .run(scenario, &self.case.persona, manager.as_ref(), self.client.as_ref())
                    .await
            }
            Err(reason) => failed_record(scenario, &label, reason.clone()),
        };
        // Engine runs already recorded their outcome; this covers failed pairs.
        self.recorder.record_outcome(&record);

        score(&self.evaluator, scenario, label, record, self.keep_records)
    }
}

fn score(
    evaluator: &Evaluator,
    scenario: &Scenario,
    version: String,
    record: ConversationRecord,
    keep_records: bool,
) -> BenchmarkEntry {
    let evaluation = evaluator
        .evaluate(scenario, &record)
        .unwrap_or_else(|error| EvaluationResult::unevaluated(&record, error.to_string()));
    BenchmarkEntry {
        scenario_id: scenario.id.clone(),
        version,
        terminal_state: evaluation.terminal_state,
        metrics: RunMetrics::from_record(&record),
        evaluation,
        record: keep_records.then_some(record),
    }
}

fn settle_slot(
    grid: &mut [Vec<Option<BenchmarkEntry>>],
    joined: Result<(usize, usize, BenchmarkEntry), JoinError>,
) {
    match joined {
        Ok((si, vi, entry)) => grid[si][vi] = Some(entry),
        Err(error) if error.is_cancelled() => {}
        Err(error) => tracing::error!(%error, "benchmark task did not finish"),
    }
}

/// A finalized `error` record for a pair that never got a real run.
fn failed_record(scenario: &Scenario, version: &str, reason: String) -> ConversationRecord {
    let mut record = ConversationRecord::new(
        format!("failed-{}-{version}", scenario.id),
        scenario.id.clone(),
        version,
    );
    let seeded = record
        .push_turn(Turn::new(0, Speaker::Client, scenario.initial_message.clone()))
        .map(|_| ());
    if let Err(error) =
        seeded.and_then(|()| record.finalize(TerminalState::Error, Some(reason), 0, 0.0))
    {
        tracing::error!(%error, "could not build failure record");
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Usage;

    fn entry(version: &str, state: TerminalState, passed: bool, turns: usize) -> BenchmarkEntry {
        let mut record = ConversationRecord::new("r", "s", version);
        for index in 0..turns {
            let speaker = if index % 2 == 0 { Speaker::Client } else { Speaker::Manager };
            let mut turn = Turn::new(index, speaker, "x");
            if speaker == Speaker::Manager {
                turn = turn
                    .with_latency_ms(100 * index as u64)
                    .with_usage(Some(Usage::new(100, 10).with_cached(50)));
            }
            record.push_turn(turn).unwrap();
        }
        record.finalize(state, None, 10, 0.5).unwrap();
        let mut evaluation = EvaluationResult::unevaluated(&record, "test");
        evaluation.passed = passed;
        BenchmarkEntry {
            scenario_id: "s".into(),
            version: version.into(),
            terminal_state: state,
            metrics: RunMetrics::from_record(&record),
            evaluation,
            record: None,
        }
    }

    #[test]
    fn summary_aggregates_entries() {
        let entries = vec![
            entry("v1", TerminalState::GoalAchieved, true, 4),
            entry("v1", TerminalState::Timeout, false, 2),
            entry("v1", TerminalState::MaxTurnsExceeded, false, 6),
        ];
        let summary = VersionSummary::from_entries("v1", &entries);

        assert_eq!(summary.runs, 3);
        assert_eq!(summary.passed, 1);
        assert!((summary.success_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.avg_turns, Some(4.0));
        assert_eq!(summary.total_errors, 1);
        assert!((summary.total_cost_usd - 1.5).abs() < 1e-9);
        assert_eq!(summary.avg_cache_hit_ratio, Some(0.5));
    }

    #[test]
    fn empty_summary_has_zero_rate() {
        let summary = VersionSummary::from_entries("v2", std::iter::empty());
        assert_eq!(summary.runs, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.avg_turns, None);
    }

    #[test]
    fn failed_record_is_finalized_error() {
        let scenario: Scenario = serde_json::from_value(serde_json::json!({
            "id": "s1", "name": "s1", "persona": "p", "initial_message": "hello"
        }))
        .unwrap();
        let record = failed_record(&scenario, "v9", "connection refused".into());
        assert_eq!(record.terminal_state(), Some(TerminalState::Error));
        assert_eq!(record.error.as_deref(), Some("connection refused"));
        assert!(record.validate().is_ok());
    }
}
