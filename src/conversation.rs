use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ToolExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Manager,
    Client,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::Manager => f.write_str("manager"),
            Speaker::Client => f.write_str("client"),
        }
    }
}

/// How a conversation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    GoalAchieved,
    MaxTurnsExceeded,
    Timeout,
    Error,
}

impl TerminalState {
    /// `error` and `timeout` mean the dialogue never got the chance to finish.
    pub fn is_incomplete(self) -> bool {
        matches!(self, TerminalState::Error | TerminalState::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminalState::GoalAchieved => "goal_achieved",
            TerminalState::MaxTurnsExceeded => "max_turns_exceeded",
            TerminalState::Timeout => "timeout",
            TerminalState::Error => "error",
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolResult {
    Ok { payload: Value },
    Err { detail: ToolExecutionError },
}

impl ToolResult {
    pub fn ok(payload: Value) -> Self {
        Self::Ok { payload }
    }

    pub fn err(detail: ToolExecutionError) -> Self {
        Self::Err { detail }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, ToolResult::Err { .. })
    }
}

/// One tool invocation made by the manager agent while producing a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    pub result: ToolResult,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value, result: ToolResult) -> Self {
        Self {
            name: name.into(),
            arguments,
            result,
            latency_ms: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn is_err(&self) -> bool {
        self.result.is_err()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cached_prompt_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            cached_prompt_tokens: 0,
        }
    }

    pub fn with_cached(mut self, cached_prompt_tokens: u64) -> Self {
        self.cached_prompt_tokens = cached_prompt_tokens;
        self
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Share of prompt tokens served from the provider's prompt cache.
    pub fn cache_hit_ratio(&self) -> Option<f64> {
        if self.prompt_tokens == 0 {
            None
        } else {
            Some(self.cached_prompt_tokens as f64 / self.prompt_tokens as f64)
        }
    }

    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cached_prompt_tokens += other.cached_prompt_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub speaker: Speaker,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Turn {
    pub fn new(index: usize, speaker: Speaker, message: impl Into<String>) -> Self {
        Self {
            index,
            speaker,
            message: message.into(),
            reasoning: None,
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
            latency_ms: None,
            usage: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning = reasoning.filter(|text| !text.trim().is_empty());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("conversation {run_id} is already finalized")]
    AlreadyFinalized { run_id: String },
    #[error("turn index {found} breaks the sequence, expected {expected}")]
    NonContiguous { expected: usize, found: usize },
    #[error("tool calls are only valid on manager turns (turn {index})")]
    ToolCallsOnClientTurn { index: usize },
    #[error("conversation {run_id} has no terminal state")]
    NotFinalized { run_id: String },
}

/// The full trail of one scenario run against one agent version.
///
/// Turns can only be appended, in index order, until a terminal state is
/// assigned; after that the record is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub run_id: String,
    pub scenario_id: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
    #[serde(default)]
    terminal_state: Option<TerminalState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub cost_usd: f64,
}

impl ConversationRecord {
    pub fn new(
        run_id: impl Into<String>,
        scenario_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scenario_id: scenario_id.into(),
            version: version.into(),
            started_at: Utc::now(),
            turns: Vec::new(),
            terminal_state: None,
            error: None,
            duration_ms: 0,
            usage: Usage::default(),
            cost_usd: 0.0,
        }
    }

    pub fn next_index(&self) -> usize {
        self.turns.len()
    }

    pub fn terminal_state(&self) -> Option<TerminalState> {
        self.terminal_state
    }

    pub fn is_finalized(&self) -> bool {
        self.terminal_state.is_some()
    }

    pub fn push_turn(&mut self, turn: Turn) -> Result<&Turn, RecordError> {
        if self.is_finalized() {
            return Err(RecordError::AlreadyFinalized {
                run_id: self.run_id.clone(),
            });
        }
        let expected = self.next_index();
        if turn.index != expected {
            return Err(RecordError::NonContiguous {
                expected,
                found: turn.index,
            });
        }
        if turn.speaker == Speaker::Client && !turn.tool_calls.is_empty() {
            return Err(RecordError::ToolCallsOnClientTurn { index: turn.index });
        }

        if let Some(usage) = &turn.usage {
            self.usage.add(usage);
        }
        self.turns.push(turn);
        Ok(&self.turns[expected])
    }

    /// Assigns the terminal state. Succeeds exactly once.
    pub fn finalize(
        &mut self,
        state: TerminalState,
        error: Option<String>,
        duration_ms: u64,
        cost_usd: f64,
    ) -> Result<(), RecordError> {
        if self.is_finalized() {
            return Err(RecordError::AlreadyFinalized {
                run_id: self.run_id.clone(),
            });
        }
        self.terminal_state = Some(state);
        self.error = error;
        self.duration_ms = duration_ms;
        self.cost_usd = cost_usd;
        Ok(())
    }

    /// Re-checks the invariants on a record that came from outside, e.g. a
    /// parsed report.
    pub fn validate(&self) -> Result<(), RecordError> {
        for (expected, turn) in self.turns.iter().enumerate() {
            if turn.index != expected {
                return Err(RecordError::NonContiguous {
                    expected,
                    found: turn.index,
                });
            }
            if turn.speaker == Speaker::Client && !turn.tool_calls.is_empty() {
                return Err(RecordError::ToolCallsOnClientTurn { index: turn.index });
            }
        }
        if !self.is_finalized() {
            return Err(RecordError::NotFinalized {
                run_id: self.run_id.clone(),
            });
        }
        Ok(())
    }

    pub fn manager_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|turn| turn.speaker == Speaker::Manager)
    }

    pub fn client_turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter().filter(|turn| turn.speaker == Speaker::Client)
    }

    /// Every tool call in conversation order, paired with its owning turn.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&Turn, &ToolCall)> {
        self.turns
            .iter()
            .flat_map(|turn| turn.tool_calls.iter().map(move |call| (turn, call)))
    }

    pub fn tool_error_count(&self) -> usize {
        self.tool_calls().filter(|(_, call)| call.is_err()).count()
    }

    pub fn final_manager_reply(&self) -> Option<&Turn> {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.speaker == Speaker::Manager)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn seeded() -> ConversationRecord {
        let mut record = ConversationRecord::new("run-1", "budget_bouquet", "v1");
        record
            .push_turn(Turn::new(0, Speaker::Client, "hello"))
            .expect("seed turn");
        record
    }

    #[test]
    fn rejects_gaps_in_turn_indices() {
        let mut record = seeded();
        let error = record
            .push_turn(Turn::new(2, Speaker::Manager, "skipped one"))
            .unwrap_err();
        assert_eq!(error, RecordError::NonContiguous { expected: 1, found: 2 });
        assert_eq!(record.turns.len(), 1);
    }

    #[test]
    fn terminal_state_is_write_once() {
        let mut record = seeded();
        record
            .finalize(TerminalState::GoalAchieved, None, 10, 0.0)
            .expect("first finalize");

        let again = record.finalize(TerminalState::Error, Some("late".into()), 20, 0.0);
        assert!(matches!(again, Err(RecordError::AlreadyFinalized { .. })));
        assert_eq!(record.terminal_state(), Some(TerminalState::GoalAchieved));
        assert_eq!(record.duration_ms, 10);

        let append = record.push_turn(Turn::new(1, Speaker::Manager, "too late"));
        assert!(matches!(append, Err(RecordError::AlreadyFinalized { .. })));
        assert_eq!(record.turns.len(), 1);
    }

    #[test]
    fn client_turns_cannot_carry_tool_calls() {
        let mut record = seeded();
        record
            .push_turn(Turn::new(1, Speaker::Manager, "let me check"))
            .expect("manager turn");
        let call = ToolCall::new("track_order", json!({"id": "X"}), ToolResult::ok(json!({})));
        let error = record
            .push_turn(Turn::new(2, Speaker::Client, "ok").with_tool_calls(vec![call]))
            .unwrap_err();
        assert_eq!(error, RecordError::ToolCallsOnClientTurn { index: 2 });
    }

    #[test]
    fn usage_accumulates_across_turns() {
        let mut record = seeded();
        record
            .push_turn(
                Turn::new(1, Speaker::Manager, "a")
                    .with_usage(Some(Usage::new(100, 20).with_cached(50))),
            )
            .expect("turn 1");
        record
            .push_turn(Turn::new(2, Speaker::Client, "b").with_usage(Some(Usage::new(30, 5))))
            .expect("turn 2");

        assert_eq!(record.usage.prompt_tokens, 130);
        assert_eq!(record.usage.total_tokens(), 155);
        assert_eq!(record.usage.cached_prompt_tokens, 50);
    }

    #[test]
    fn tool_result_serializes_as_tagged_union() {
        let ok = ToolResult::ok(json!([1, 2]));
        let err = ToolResult::err(ToolExecutionError::new("not found").with_code("404"));

        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "payload": [1, 2]})
        );
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"status": "err", "detail": {"message": "not found", "code": "404"}})
        );
    }

    #[test]
    fn validate_catches_unfinalized_records() {
        let record = seeded();
        assert!(matches!(
            record.validate(),
            Err(RecordError::NotFinalized { .. })
        ));
    }
}
