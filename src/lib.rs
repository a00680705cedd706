pub mod agents;
pub mod benchmark;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod providers;
pub mod recorder;
pub mod report;
pub mod scenario;

pub use agents::{
    build_client_agent, AgentContext, ClientAgent, ClientReply, CompletionSignal, HttpClientAgent,
    HttpManagerAgent, LlmClientAgent, ManagerAgent, ManagerReply,
};
pub use benchmark::{
    BenchmarkEntry, BenchmarkError, BenchmarkReport, BenchmarkRunner, HttpManagerFactory,
    ManagerAgentFactory, RejectedScenario, ScenarioRow, VersionSummary,
};
pub use config::{
    AgentVersion, BenchmarkConfig, ClientAgentConfig, ConfigError, EngineConfig, HarnessConfig,
    RetryPolicy,
};
pub use conversation::{
    ConversationRecord, RecordError, Speaker, TerminalState, ToolCall, ToolResult, Turn, Usage,
};
pub use engine::DialogueEngine;
pub use error::{AgentInvocationError, HarnessError, LLMError, ToolExecutionError};
pub use evaluator::{
    CriterionOutcome, CriterionSpec, EvalContext, EvaluationError, EvaluationResult, Evaluator,
    EvaluatorConfig, Observation, Predicate,
};
pub use metrics::{Pricing, RunMetrics};
pub use providers::LLMProvider;
pub use recorder::{EventRecorder, JsonlRecorder, MemoryRecorder, NullRecorder, RecordedEvent};
pub use report::{parse_run_report, ReportError, ReportGenerator, RunReport};
pub use scenario::{Persona, PersonaCatalog, Scenario, ScenarioCase, ScenarioLoadError, ScenarioSet};
pub use schemars::JsonSchema;
