//! Drives one scenario against one manager agent until a terminal state.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::Instrument;

use crate::{
    agents::{AgentContext, ClientAgent, ClientReply, CompletionSignal, ManagerAgent},
    config::EngineConfig,
    conversation::{ConversationRecord, RecordError, Speaker, TerminalState, Turn},
    error::AgentInvocationError,
    metrics::{ExecutionTimer, Pricing},
    recorder::{EventRecorder, NullRecorder},
    scenario::{Persona, Scenario},
};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_run_id(scenario_id: &str, version: &str) -> String {
    let sequence = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{scenario_id}-{version}-{sequence:04}",
        Utc::now().format("%Y%m%dT%H%M%S%3f")
    )
}

/// Why an agent call produced nothing usable.
enum CallFailure {
    Deadline,
    Exhausted(AgentInvocationError),
}

/// How the loop ended, before it is written into the record.
struct Ending {
    state: TerminalState,
    error: Option<String>,
}

impl Ending {
    fn new(state: TerminalState) -> Self {
        Self { state, error: None }
    }

    fn failed(state: TerminalState, error: impl Into<String>) -> Self {
        Self {
            state,
            error: Some(error.into()),
        }
    }
}

impl From<CallFailure> for Ending {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Deadline => Ending::failed(TerminalState::Timeout, "scenario timeout elapsed"),
            CallFailure::Exhausted(error) => Ending::failed(TerminalState::Error, error.to_string()),
        }
    }
}

impl From<RecordError> for Ending {
    fn from(error: RecordError) -> Self {
        Ending::failed(TerminalState::Error, error.to_string())
    }
}

/// Alternates manager and client turns for a single run.
///
/// The engine holds no per-run state; one instance can drive any number of
/// runs, sequentially or concurrently.
pub struct DialogueEngine {
    config: EngineConfig,
    recorder: Arc<dyn EventRecorder>,
    version: String,
    pricing: Pricing,
}

impl DialogueEngine {
    /// `config` is expected to have passed [`EngineConfig::validate`]; a
    /// tool failure ceiling of 0 is treated as 1.
    pub fn new(config: EngineConfig, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            config,
            recorder,
            version: "default".to_string(),
            pricing: Pricing::default(),
        }
    }

    /// An engine that records nothing outside the returned record.
    pub fn unrecorded(config: EngineConfig) -> Self {
        Self::new(config, Arc::new(NullRecorder))
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Runs the scenario to completion. The returned record is always
    /// finalized; failures end up in its terminal state, never as an `Err`.
    pub async fn run(
        &self,
        scenario: &Scenario,
        persona: &Persona,
        manager: &dyn ManagerAgent,
        client: &dyn ClientAgent,
    ) -> ConversationRecord {
        let run_id = next_run_id(&scenario.id, &self.version);
        let span = tracing::info_span!(
            "dialogue",
            run_id = %run_id,
            scenario = %scenario.id,
            version = %self.version
        );
        self.run_with_id(run_id, scenario, persona, manager, client)
            .instrument(span)
            .await
    }

    async fn run_with_id(
        &self,
        run_id: String,
        scenario: &Scenario,
        persona: &Persona,
        manager: &dyn ManagerAgent,
        client: &dyn ClientAgent,
    ) -> ConversationRecord {
        let timer = ExecutionTimer::new();
        let deadline = Instant::now() + scenario.timeout();
        let ctx = AgentContext::new(run_id.clone(), scenario.id.clone(), self.version.clone())
            .with_goal(scenario.description.clone());
        let mut record = ConversationRecord::new(run_id, scenario.id.clone(), self.version.clone());

        let ending = self
            .drive(&ctx, scenario, persona, manager, client, deadline, &mut record)
            .await;

        let cost = self.pricing.estimate(&record.usage);
        if let Err(error) = record.finalize(ending.state, ending.error.clone(), timer.elapsed_ms(), cost) {
            tracing::error!(%error, "record finalized twice");
        }
        self.recorder.record_outcome(&record);

        match &ending.error {
            Some(error) => tracing::info!(
                terminal_state = %ending.state,
                turns = record.turns.len(),
                %error,
                "dialogue finished"
            ),
            None => tracing::info!(
                terminal_state = %ending.state,
                turns = record.turns.len(),
                "dialogue finished"
            ),
        }
        record
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        ctx: &AgentContext,
        scenario: &Scenario,
        persona: &Persona,
        manager: &dyn ManagerAgent,
        client: &dyn ClientAgent,
        deadline: Instant,
        record: &mut ConversationRecord,
    ) -> Ending {
        if let Err(error) = self.append(record, Turn::new(0, Speaker::Client, scenario.initial_message.clone())) {
            return error.into();
        }

        let mut consecutive_tool_failures: u32 = 0;
        for round in 1..=scenario.max_turns {
            let started = Instant::now();
            let reply = match self
                .invoke(deadline, "manager", || manager.respond(ctx, &record.turns))
                .await
            {
                Ok(reply) => reply,
                Err(failure) => return failure.into(),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            for call in &reply.tool_calls {
                if call.is_err() {
                    consecutive_tool_failures += 1;
                    tracing::warn!(tool = %call.name, consecutive = consecutive_tool_failures, "tool call failed");
                } else {
                    consecutive_tool_failures = 0;
                }
            }

            let turn = Turn::new(record.next_index(), Speaker::Manager, reply.message)
                .with_reasoning(reply.reasoning)
                .with_tool_calls(reply.tool_calls)
                .with_latency_ms(latency_ms)
                .with_usage(reply.usage);
            if let Err(error) = self.append(record, turn) {
                return error.into();
            }

            if consecutive_tool_failures >= self.config.tool_failure_ceiling.max(1) {
                return Ending::failed(
                    TerminalState::Error,
                    format!("{consecutive_tool_failures} consecutive tool failures"),
                );
            }
            if Instant::now() >= deadline {
                return CallFailure::Deadline.into();
            }

            let started = Instant::now();
            let history = record.turns.as_slice();
            let answer = match self
                .invoke(deadline, "client", move || async move {
                    client
                        .respond(ctx, persona, history)
                        .await
                        .and_then(ClientReply::validate)
                })
                .await
            {
                Ok(answer) => answer,
                Err(failure) => return failure.into(),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let client_turn = answer.text().map(|text| {
                Turn::new(record.next_index(), Speaker::Client, text)
                    .with_latency_ms(latency_ms)
                    .with_usage(answer.usage)
            });

            if answer.signal != CompletionSignal::Error {
                if let Some(turn) = client_turn {
                    if let Err(error) = self.append(record, turn) {
                        return error.into();
                    }
                }
            }
            if answer.signal == CompletionSignal::Complete {
                return Ending::new(TerminalState::GoalAchieved);
            }
            if round == scenario.max_turns {
                return Ending::new(TerminalState::MaxTurnsExceeded);
            }
            if Instant::now() >= deadline {
                return CallFailure::Deadline.into();
            }
            if answer.signal == CompletionSignal::Error {
                let reason = answer
                    .reason
                    .unwrap_or_else(|| "client reported an error".to_string());
                return Ending::failed(TerminalState::Error, reason);
            }
        }

        Ending::new(TerminalState::MaxTurnsExceeded)
    }

    fn append(&self, record: &mut ConversationRecord, turn: Turn) -> Result<(), RecordError> {
        let run_id = record.run_id.clone();
        let turn = record.push_turn(turn)?;
        for (call_index, call) in turn.tool_calls.iter().enumerate() {
            self.recorder.record_tool_call(&run_id, turn.index, call_index, call);
        }
        self.recorder.record_turn(&run_id, turn);
        tracing::debug!(
            index = turn.index,
            speaker = %turn.speaker,
            tool_calls = turn.tool_calls.len(),
            "turn recorded"
        );
        Ok(())
    }

    /// Calls an agent with retries, racing every attempt and every backoff
    /// sleep against the run deadline.
    async fn invoke<T, F, Fut>(&self, deadline: Instant, agent: &str, mut call: F) -> Result<T, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentInvocationError>>,
    {
        let policy = &self.config.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match timeout_at(deadline, call()).await {
                Err(_) => return Err(CallFailure::Deadline),
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
            };

            if attempt >= policy.max_attempts {
                tracing::warn!(agent, attempt, %error, "agent call failed, no attempts left");
                return Err(CallFailure::Exhausted(error));
            }

            let delay = policy.delay_for(attempt);
            tracing::warn!(agent, attempt, ?delay, %error, "agent call failed, retrying");
            let wake = Instant::now() + delay;
            if wake >= deadline {
                sleep_until(deadline).await;
                return Err(CallFailure::Deadline);
            }
            sleep_until(wake).await;
        }
    }
}
