//! The two sides of a dialogue: the manager agent under test and the
//! persona-driven customer simulator.

mod client;
mod manager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    conversation::{ToolCall, Turn, Usage},
    error::AgentInvocationError,
    scenario::Persona,
};

pub use client::{build_client_agent, HttpClientAgent, LlmClientAgent, DEFAULT_PERSONA_PROMPT};
pub use manager::HttpManagerAgent;

/// Identifies the run an agent call belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentContext {
    pub run_id: String,
    pub scenario_id: String,
    pub version: String,
    /// Scenario description, handed to the customer as its goal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl AgentContext {
    pub fn new(
        run_id: impl Into<String>,
        scenario_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            scenario_id: scenario_id.into(),
            version: version.into(),
            goal: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        let goal = goal.into();
        self.goal = (!goal.trim().is_empty()).then_some(goal);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerReply {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ManagerReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The system under test.
#[async_trait]
pub trait ManagerAgent: Send + Sync {
    async fn respond(
        &self,
        ctx: &AgentContext,
        history: &[Turn],
    ) -> Result<ManagerReply, AgentInvocationError>;
}

/// Whether the customer wants to keep talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    Continue,
    Complete,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReply {
    #[serde(rename = "status")]
    pub signal: CompletionSignal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ClientReply {
    pub fn proceed(message: impl Into<String>) -> Self {
        Self {
            signal: CompletionSignal::Continue,
            message: Some(message.into()),
            reason: None,
            usage: None,
        }
    }

    pub fn complete(closing: Option<String>) -> Self {
        Self {
            signal: CompletionSignal::Complete,
            message: closing,
            reason: None,
            usage: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            signal: CompletionSignal::Error,
            message: None,
            reason: Some(reason.into()),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Message text when present and not blank.
    pub fn text(&self) -> Option<&str> {
        self.message.as_deref().filter(|m| !m.trim().is_empty())
    }

    /// A `continue` without anything to say is not a usable reply.
    pub fn validate(self) -> Result<Self, AgentInvocationError> {
        if self.signal == CompletionSignal::Continue && self.text().is_none() {
            return Err(AgentInvocationError::malformed(
                "client signalled continue without a message",
            ));
        }
        Ok(self)
    }
}

/// The simulated customer.
#[async_trait]
pub trait ClientAgent: Send + Sync {
    async fn respond(
        &self,
        ctx: &AgentContext,
        persona: &Persona,
        history: &[Turn],
    ) -> Result<ClientReply, AgentInvocationError>;
}
