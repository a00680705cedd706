//! Scores a finished conversation against its scenario's success criteria.
//!
//! Every criterion name resolves to a [`Predicate`]: first among the
//! scenario's own `criteria_definitions`, then among the evaluator's
//! registry of built-ins. A predicate observes a boolean; the criterion is
//! satisfied when the observation equals the expected value.

mod predicates;

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    conversation::{ConversationRecord, TerminalState},
    error::panic_message,
    scenario::Scenario,
};

pub use predicates::value_is_subset;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("conversation {run_id} has no terminal state yet")]
    NotFinalized { run_id: String },
    #[error("criterion '{criterion}' failed to evaluate: {message}")]
    Predicate { criterion: String, message: String },
    #[error("unknown criterion '{name}'{}", .hint.as_ref().map(|h| format!(" (did you mean '{h}'?)")).unwrap_or_default())]
    UnknownCriterion { name: String, hint: Option<String> },
}

impl EvaluationError {
    pub fn predicate(criterion: impl Into<String>, message: impl ToString) -> Self {
        Self::Predicate {
            criterion: criterion.into(),
            message: message.to_string(),
        }
    }
}

/// Tool names and phrasing the built-in criteria look for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub product_tools: Vec<String>,
    pub price_filter_keys: Vec<String>,
    pub tracking_tools: Vec<String>,
    pub order_tools: Vec<String>,
    /// Case-insensitive regex a reply must match to count as acknowledging a
    /// failure.
    pub apology_pattern: String,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        let names = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            product_tools: names(&["list_products", "search_products", "get_products", "get_catalog"]),
            price_filter_keys: names(&["max_price", "price_max", "budget", "price_to"]),
            tracking_tools: names(&["track_order", "get_order_status", "get_tracking"]),
            order_tools: names(&["create_order", "place_order"]),
            apology_pattern: concat!(
                r"sorry|apolog|unfortunately|alternative|instead|",
                r"извин|к сожалению|прошу прощения|не удалось|не найден|попробуйте"
            )
            .to_string(),
        }
    }
}

/// What a predicate sees.
pub struct EvalContext<'a> {
    pub scenario: &'a Scenario,
    pub record: &'a ConversationRecord,
    pub config: &'a EvaluatorConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub value: bool,
    pub rationale: String,
}

impl Observation {
    pub fn new(value: bool, rationale: impl Into<String>) -> Self {
        Self {
            value,
            rationale: rationale.into(),
        }
    }
}

pub trait Predicate: Send + Sync {
    fn observe(&self, ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError>;
}

impl<F> Predicate for F
where
    F: Fn(&EvalContext<'_>) -> Result<Observation, EvaluationError> + Send + Sync,
{
    fn observe(&self, ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
        self(ctx)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReplyScope {
    #[default]
    Final,
    Any,
}

fn default_min_calls() -> usize {
    1
}

/// A criterion declared inline in a scenario document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CriterionSpec {
    ToolInvoked {
        tool: String,
        #[serde(default = "default_min_calls")]
        min_calls: usize,
        #[serde(default)]
        successful_only: bool,
    },
    ToolArguments {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subset: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<Value>,
    },
    ReplyMatches {
        pattern: String,
        #[serde(default)]
        scope: ReplyScope,
    },
    MaxTurns {
        limit: usize,
    },
    TerminalState {
        state: TerminalState,
    },
    Expression {
        expr: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionOutcome {
    pub name: String,
    pub expected: bool,
    /// `None` when the predicate could not be evaluated.
    pub observed: Option<bool>,
    pub satisfied: bool,
    pub advisory: bool,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub run_id: String,
    pub scenario_id: String,
    pub version: String,
    pub terminal_state: TerminalState,
    /// Ordered by criterion name.
    pub criteria: Vec<CriterionOutcome>,
    pub passed: bool,
    pub summary: String,
}

impl EvaluationResult {
    /// A failing result for a record the evaluator could not score.
    pub fn unevaluated(record: &ConversationRecord, reason: impl Into<String>) -> Self {
        Self {
            run_id: record.run_id.clone(),
            scenario_id: record.scenario_id.clone(),
            version: record.version.clone(),
            terminal_state: record.terminal_state().unwrap_or(TerminalState::Error),
            criteria: Vec::new(),
            passed: false,
            summary: format!("FAIL: not evaluated, {}", reason.into()),
        }
    }

    pub fn failed_criteria(&self) -> impl Iterator<Item = &CriterionOutcome> {
        self.criteria.iter().filter(|c| !c.satisfied)
    }
}

pub struct Evaluator {
    config: EvaluatorConfig,
    registry: BTreeMap<String, Arc<dyn Predicate>>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(EvaluatorConfig::default())
    }
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        let mut evaluator = Self {
            config,
            registry: BTreeMap::new(),
        };
        predicates::register_builtins(&mut evaluator);
        evaluator
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Registers (or replaces) a named predicate.
    pub fn with_predicate(mut self, name: impl Into<String>, predicate: impl Predicate + 'static) -> Self {
        self.register(name, predicate);
        self
    }

    pub fn register(&mut self, name: impl Into<String>, predicate: impl Predicate + 'static) {
        self.registry.insert(name.into(), Arc::new(predicate));
    }

    pub fn criterion_names(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    pub fn evaluate(
        &self,
        scenario: &Scenario,
        record: &ConversationRecord,
    ) -> Result<EvaluationResult, EvaluationError> {
        let terminal_state = record
            .terminal_state()
            .ok_or_else(|| EvaluationError::NotFinalized {
                run_id: record.run_id.clone(),
            })?;

        let ctx = EvalContext {
            scenario,
            record,
            config: &self.config,
        };

        let mut criteria = Vec::with_capacity(scenario.success_criteria.len());
        for (name, expected) in &scenario.success_criteria {
            let advisory = scenario.is_advisory(name);
            let outcome = match self.observe(name, &ctx) {
                Ok(observation) => CriterionOutcome {
                    name: name.clone(),
                    expected: *expected,
                    observed: Some(observation.value),
                    satisfied: observation.value == *expected,
                    advisory,
                    rationale: observation.rationale,
                },
                Err(error) => {
                    tracing::warn!(run_id = %record.run_id, criterion = %name, %error, "criterion not evaluated");
                    CriterionOutcome {
                        name: name.clone(),
                        expected: *expected,
                        observed: None,
                        satisfied: false,
                        advisory,
                        rationale: error.to_string(),
                    }
                }
            };
            criteria.push(outcome);
        }

        let required_met = criteria.iter().filter(|c| !c.advisory).all(|c| c.satisfied);
        let passed = required_met && !terminal_state.is_incomplete();
        let summary = summarize(terminal_state, &criteria, passed);

        Ok(EvaluationResult {
            run_id: record.run_id.clone(),
            scenario_id: record.scenario_id.clone(),
            version: record.version.clone(),
            terminal_state,
            criteria,
            passed,
            summary,
        })
    }

    fn observe(&self, name: &str, ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
        let observed = if let Some(spec) = ctx.scenario.criteria_definitions.get(name) {
            catch_unwind(AssertUnwindSafe(|| spec.observe(name, ctx)))
        } else if let Some(predicate) = self.registry.get(name) {
            catch_unwind(AssertUnwindSafe(|| predicate.observe(ctx)))
        } else {
            return Err(EvaluationError::UnknownCriterion {
                name: name.to_string(),
                hint: self.closest_criterion(name, ctx.scenario),
            });
        };

        observed.unwrap_or_else(|panic| {
            Err(EvaluationError::predicate(
                name,
                format!("predicate panicked: {}", panic_message(panic.as_ref())),
            ))
        })
    }

    fn closest_criterion(&self, name: &str, scenario: &Scenario) -> Option<String> {
        self.registry
            .keys()
            .chain(scenario.criteria_definitions.keys())
            .map(|candidate| (strsim::levenshtein(name, candidate), candidate))
            .filter(|(distance, _)| *distance <= 3)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, candidate)| candidate.clone())
    }
}

fn summarize(state: TerminalState, criteria: &[CriterionOutcome], passed: bool) -> String {
    let required: Vec<_> = criteria.iter().filter(|c| !c.advisory).collect();
    let met = required.iter().filter(|c| c.satisfied).count();
    let verdict = if passed { "PASS" } else { "FAIL" };

    let mut summary = format!(
        "{verdict}: {met}/{} required criteria satisfied, terminal state {state}",
        required.len()
    );
    if state.is_incomplete() {
        summary.push_str(" (run did not complete)");
    }
    let advisory_missed: Vec<&str> = criteria
        .iter()
        .filter(|c| c.advisory && !c.satisfied)
        .map(|c| c.name.as_str())
        .collect();
    if !advisory_missed.is_empty() {
        summary.push_str(&format!("; advisory not met: {}", advisory_missed.join(", ")));
    }
    summary
}
