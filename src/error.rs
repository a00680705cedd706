use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(String),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

/// Failure talking to either the manager or the client agent.
///
/// The dialogue engine retries these up to the configured ceiling before the
/// conversation ends in the `error` state.
#[derive(Debug, Error)]
pub enum AgentInvocationError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("agent endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed agent response: {0}")]
    MalformedResponse(String),

    #[error("persona prompt error: {0}")]
    Prompt(String),

    #[error(transparent)]
    Provider(#[from] LLMError),
}

impl AgentInvocationError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }
}

/// A tool invoked by the manager agent failed. Carried inside
/// [`ToolResult::Err`](crate::conversation::ToolResult) and never propagated.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolExecutionError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ToolExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Errors surfaced by the command line front end.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    ScenarioLoad(#[from] crate::scenario::ScenarioLoadError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Agent(#[from] AgentInvocationError),

    #[error(transparent)]
    Benchmark(#[from] crate::benchmark::BenchmarkError),

    #[error(transparent)]
    Evaluation(#[from] crate::evaluator::EvaluationError),

    #[error(transparent)]
    Report(#[from] crate::report::ReportError),

    #[error(transparent)]
    Provider(#[from] LLMError),
}

/// Text carried by a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
