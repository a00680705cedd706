//! Narrative (Markdown) and structured (JSON) reports.
//!
//! Output depends only on the inputs and the explicit `generated_at`
//! timestamp, so rendering the same run twice yields the same bytes.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, SecondsFormat, Utc};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    benchmark::{BenchmarkReport, CellOutcome},
    conversation::{ConversationRecord, RecordError, ToolResult},
    evaluator::EvaluationResult,
};

pub const FORMAT_VERSION: u32 = 1;

const RUN_TEMPLATE: &str = "run";
const BENCHMARK_TEMPLATE: &str = "benchmark";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("template error: {0}")]
    Template(#[from] handlebars::TemplateError),
    #[error("template render error: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported report format version {0}")]
    UnsupportedVersion(u32),
    #[error("report holds an invalid record: {0}")]
    InvalidRecord(#[from] RecordError),
    #[error("evaluation belongs to run {evaluation}, record is {record}")]
    MismatchedRun { record: String, evaluation: String },
}

/// Structured report for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub format_version: u32,
    pub generated_at: DateTime<Utc>,
    pub record: ConversationRecord,
    pub evaluation: EvaluationResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkDocument {
    pub format_version: u32,
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: BenchmarkReport,
}

#[derive(Serialize)]
struct ToolCallView {
    name: String,
    arguments: String,
    outcome: String,
}

#[derive(Serialize)]
struct TurnView {
    index: usize,
    speaker: String,
    latency: Option<String>,
    message: String,
    reasoning: Option<String>,
    tool_calls: Vec<ToolCallView>,
}

#[derive(Serialize)]
struct CriterionView {
    name: String,
    expected: String,
    observed: String,
    result: String,
    rationale: String,
}

#[derive(Serialize)]
struct RunView {
    run_id: String,
    scenario_id: String,
    version: String,
    generated_at: String,
    started_at: String,
    terminal_state: String,
    error: Option<String>,
    duration: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    cached_tokens: u64,
    cost: String,
    verdict: &'static str,
    summary: String,
    turns: Vec<TurnView>,
    criteria: Vec<CriterionView>,
}

#[derive(Serialize)]
struct SummaryView {
    label: String,
    runs: usize,
    passed: usize,
    success_rate: String,
    avg_response: String,
    avg_turns: String,
    errors: usize,
    tool_errors: usize,
    cost: String,
    cache_hit: String,
}

#[derive(Serialize)]
struct RowView {
    scenario: String,
    cells: Vec<String>,
}

#[derive(Serialize)]
struct BenchmarkView {
    generated_at: String,
    scenario_count: usize,
    version_list: String,
    aborted: bool,
    versions: Vec<String>,
    summaries: Vec<SummaryView>,
    rows: Vec<RowView>,
    rejected: Vec<RejectedView>,
}

#[derive(Serialize)]
struct RejectedView {
    source: String,
    reason: String,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Makes text safe inside a Markdown table cell.
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace("\r\n", "<br>").replace('\n', "<br>")
}

fn millis(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{ms:.0}ms")
    }
}

fn optional(value: Option<f64>, render: impl Fn(f64) -> String) -> String {
    value.map(render).unwrap_or_else(|| "n/a".to_string())
}

fn percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

fn tool_outcome(result: &ToolResult) -> String {
    match result {
        ToolResult::Ok { payload } => format!("ok `{payload}`"),
        ToolResult::Err { detail } => match &detail.code {
            Some(code) => format!("**error** {} ({code})", detail.message),
            None => format!("**error** {}", detail.message),
        },
    }
}

fn cell_outcome(outcome: &Option<CellOutcome>) -> String {
    match outcome {
        Some(outcome) => format!(
            "{} ({}, {} turns, {})",
            if outcome.passed { "PASS" } else { "FAIL" },
            outcome.terminal_state,
            outcome.turns,
            millis(outcome.elapsed_ms as f64)
        ),
        None => "not run".to_string(),
    }
}

pub struct ReportGenerator {
    templates: Handlebars<'static>,
}

impl ReportGenerator {
    pub fn new() -> Result<Self, ReportError> {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        templates.set_strict_mode(true);
        templates.register_template_string(RUN_TEMPLATE, include_str!("run.md.hbs"))?;
        templates.register_template_string(BENCHMARK_TEMPLATE, include_str!("benchmark.md.hbs"))?;
        Ok(Self { templates })
    }

    pub fn render_narrative(
        &self,
        record: &ConversationRecord,
        evaluation: &EvaluationResult,
        generated_at: DateTime<Utc>,
    ) -> Result<String, ReportError> {
        check_pair(record, evaluation)?;

        let turns = record
            .turns
            .iter()
            .map(|turn| TurnView {
                index: turn.index,
                speaker: turn.speaker.to_string(),
                latency: turn.latency_ms.map(|ms| millis(ms as f64)),
                message: turn.message.clone(),
                reasoning: turn.reasoning.clone(),
                tool_calls: turn
                    .tool_calls
                    .iter()
                    .map(|call| ToolCallView {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                        outcome: tool_outcome(&call.result),
                    })
                    .collect(),
            })
            .collect();

        let criteria = evaluation
            .criteria
            .iter()
            .map(|outcome| CriterionView {
                name: if outcome.advisory {
                    format!("{} (advisory)", cell(&outcome.name))
                } else {
                    cell(&outcome.name)
                },
                expected: outcome.expected.to_string(),
                observed: outcome
                    .observed
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| "n/a".to_string()),
                result: if outcome.satisfied { "met" } else { "not met" }.to_string(),
                rationale: cell(&outcome.rationale),
            })
            .collect();

        let view = RunView {
            run_id: record.run_id.clone(),
            scenario_id: record.scenario_id.clone(),
            version: record.version.clone(),
            generated_at: timestamp(&generated_at),
            started_at: timestamp(&record.started_at),
            terminal_state: evaluation.terminal_state.to_string(),
            error: record.error.clone(),
            duration: millis(record.duration_ms as f64),
            prompt_tokens: record.usage.prompt_tokens,
            completion_tokens: record.usage.completion_tokens,
            cached_tokens: record.usage.cached_prompt_tokens,
            cost: format!("{:.4}", record.cost_usd),
            verdict: if evaluation.passed { "PASS" } else { "FAIL" },
            summary: evaluation.summary.clone(),
            turns,
            criteria,
        };
        Ok(self.templates.render(RUN_TEMPLATE, &view)?)
    }

    pub fn render_structured(
        &self,
        record: &ConversationRecord,
        evaluation: &EvaluationResult,
        generated_at: DateTime<Utc>,
    ) -> Result<String, ReportError> {
        check_pair(record, evaluation)?;
        let report = RunReport {
            format_version: FORMAT_VERSION,
            generated_at,
            record: record.clone(),
            evaluation: evaluation.clone(),
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }

    pub fn render_benchmark_markdown(
        &self,
        report: &BenchmarkReport,
        generated_at: DateTime<Utc>,
    ) -> Result<String, ReportError> {
        let view = BenchmarkView {
            generated_at: timestamp(&generated_at),
            scenario_count: report.scenarios.len(),
            version_list: report.versions.join(", "),
            aborted: report.aborted,
            versions: report.versions.iter().map(|v| cell(v)).collect(),
            summaries: report
                .summaries
                .iter()
                .map(|summary| SummaryView {
                    label: cell(&summary.label),
                    runs: summary.runs,
                    passed: summary.passed,
                    success_rate: percent(summary.success_rate),
                    avg_response: optional(summary.avg_response_ms, millis),
                    avg_turns: optional(summary.avg_turns, |turns| format!("{turns:.1}")),
                    errors: summary.total_errors,
                    tool_errors: summary.total_tool_errors,
                    cost: format!("{:.4}", summary.total_cost_usd),
                    cache_hit: optional(summary.avg_cache_hit_ratio, percent),
                })
                .collect(),
            rows: report
                .rows
                .iter()
                .map(|row| RowView {
                    scenario: cell(&row.scenario_id),
                    cells: row.cells.iter().map(cell_outcome).collect(),
                })
                .collect(),
            rejected: report
                .rejected
                .iter()
                .map(|rejected| RejectedView {
                    source: cell(&rejected.source),
                    reason: cell(&rejected.reason),
                })
                .collect(),
        };
        Ok(self.templates.render(BENCHMARK_TEMPLATE, &view)?)
    }

    pub fn render_benchmark_json(
        &self,
        report: &BenchmarkReport,
        generated_at: DateTime<Utc>,
    ) -> Result<String, ReportError> {
        let document = BenchmarkDocument {
            format_version: FORMAT_VERSION,
            generated_at,
            report: report.clone(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Writes `<scenario>__<version>__<run_id>.md` and `.json` into `dir`.
    pub fn write_run_reports(
        &self,
        dir: impl AsRef<Path>,
        record: &ConversationRecord,
        evaluation: &EvaluationResult,
        generated_at: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, ReportError> {
        let dir = dir.as_ref();
        let stem = format!(
            "{}__{}__{}",
            file_safe(&record.scenario_id),
            file_safe(&record.version),
            file_safe(&record.run_id)
        );
        let markdown = self.render_narrative(record, evaluation, generated_at)?;
        let json = self.render_structured(record, evaluation, generated_at)?;
        Ok(vec![
            write_file(dir, &format!("{stem}.md"), &markdown)?,
            write_file(dir, &format!("{stem}.json"), &json)?,
        ])
    }

    /// Writes `benchmark.md`, `benchmark.json` and a run report pair for every
    /// entry that still carries its record.
    pub fn write_benchmark_reports(
        &self,
        dir: impl AsRef<Path>,
        report: &BenchmarkReport,
        generated_at: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, ReportError> {
        let dir = dir.as_ref();
        let mut written = vec![
            write_file(dir, "benchmark.md", &self.render_benchmark_markdown(report, generated_at)?)?,
            write_file(dir, "benchmark.json", &self.render_benchmark_json(report, generated_at)?)?,
        ];
        for entry in &report.entries {
            if let Some(record) = &entry.record {
                written.extend(self.write_run_reports(dir, record, &entry.evaluation, generated_at)?);
            }
        }
        Ok(written)
    }
}

/// Reads a structured run report back, re-checking the record invariants.
pub fn parse_run_report(raw: &str) -> Result<RunReport, ReportError> {
    let report: RunReport = serde_json::from_str(raw)?;
    if report.format_version != FORMAT_VERSION {
        return Err(ReportError::UnsupportedVersion(report.format_version));
    }
    report.record.validate()?;
    check_pair(&report.record, &report.evaluation)?;
    Ok(report)
}

fn check_pair(record: &ConversationRecord, evaluation: &EvaluationResult) -> Result<(), ReportError> {
    if record.run_id != evaluation.run_id {
        return Err(ReportError::MismatchedRun {
            record: record.run_id.clone(),
            evaluation: evaluation.run_id.clone(),
        });
    }
    Ok(())
}

fn file_safe(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

fn write_file(dir: &Path, name: &str, contents: &str) -> Result<PathBuf, ReportError> {
    let path = dir.join(name);
    fs::create_dir_all(dir)
        .and_then(|_| fs::write(&path, contents))
        .map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}
