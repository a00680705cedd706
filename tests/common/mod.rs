#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use dialogbench::{
    AgentContext, AgentInvocationError, ClientAgent, ClientReply, ManagerAgent, ManagerReply,
    Persona, Scenario, Speaker, Turn,
};
use serde_json::json;

pub fn scenario(id: &str, max_turns: usize, timeout_secs: u64) -> Scenario {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("scenario {id}"),
        "description": "Найти букет дешевле 10000 тенге",
        "persona": "thrifty_student",
        "initial_message": "Ищу бюджетный букет до 10000 тенге",
        "max_turns": max_turns,
        "timeout": timeout_secs,
    }))
    .expect("scenario fixture")
}

pub fn with_criteria(mut scenario: Scenario, criteria: &[(&str, bool)]) -> Scenario {
    for (name, expected) in criteria {
        scenario.success_criteria.insert(name.to_string(), *expected);
    }
    scenario
}

pub fn persona() -> Persona {
    serde_json::from_value(json!({
        "name": "Thrifty Student",
        "type": "budget_buyer",
        "characteristics": {"budget_sensitivity": 0.95},
        "communication_style": "short messages"
    }))
    .expect("persona fixture")
}

/// Manager that plays back a fixed list of replies, one per call.
pub struct ScriptedManager {
    replies: Mutex<VecDeque<Result<ManagerReply, AgentInvocationError>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedManager {
    pub fn new(replies: Vec<Result<ManagerReply, AgentInvocationError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn replying(messages: &[&str]) -> Self {
        Self::new(messages.iter().map(|m| Ok(ManagerReply::new(*m))).collect())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagerAgent for ScriptedManager {
    async fn respond(
        &self,
        _ctx: &AgentContext,
        _history: &[Turn],
    ) -> Result<ManagerReply, AgentInvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ManagerReply::new("Чем ещё могу помочь?")))
    }
}

/// Customer that plays back a fixed list of replies and keeps asking once
/// the list runs out.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Result<ClientReply, AgentInvocationError>>>,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Result<ClientReply, AgentInvocationError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
        }
    }

    pub fn replying(replies: Vec<ClientReply>) -> Self {
        Self::new(replies.into_iter().map(Ok).collect())
    }

    pub fn chatty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ClientAgent for ScriptedClient {
    async fn respond(
        &self,
        _ctx: &AgentContext,
        _persona: &Persona,
        _history: &[Turn],
    ) -> Result<ClientReply, AgentInvocationError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ClientReply::proceed("А есть что-нибудь ещё?")))
    }
}

/// Stateless customer that is satisfied after a number of manager replies.
/// Safe to share between concurrent runs.
pub struct PatientClient {
    pub satisfied_after: usize,
}

#[async_trait]
impl ClientAgent for PatientClient {
    async fn respond(
        &self,
        _ctx: &AgentContext,
        _persona: &Persona,
        history: &[Turn],
    ) -> Result<ClientReply, AgentInvocationError> {
        let replies = history
            .iter()
            .filter(|turn| turn.speaker == Speaker::Manager)
            .count();
        if replies >= self.satisfied_after {
            Ok(ClientReply::complete(Some("Спасибо, беру!".to_string())))
        } else {
            Ok(ClientReply::proceed("Покажите ещё варианты"))
        }
    }
}

/// Manager whose reply is a pure function of the run context and history,
/// with an optional per-call delay.
pub struct FnManager<F> {
    reply: F,
    delay: Box<dyn Fn(&AgentContext) -> Duration + Send + Sync>,
}

impl<F> FnManager<F>
where
    F: Fn(&AgentContext, &[Turn]) -> Result<ManagerReply, AgentInvocationError> + Send + Sync,
{
    pub fn new(reply: F) -> Self {
        Self {
            reply,
            delay: Box::new(|_| Duration::ZERO),
        }
    }

    pub fn with_delay(mut self, delay: impl Fn(&AgentContext) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }
}

#[async_trait]
impl<F> ManagerAgent for FnManager<F>
where
    F: Fn(&AgentContext, &[Turn]) -> Result<ManagerReply, AgentInvocationError> + Send + Sync,
{
    async fn respond(
        &self,
        ctx: &AgentContext,
        history: &[Turn],
    ) -> Result<ManagerReply, AgentInvocationError> {
        let delay = (self.delay)(ctx);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.reply)(ctx, history)
    }
}

pub fn assert_contiguous(turns: &[Turn]) {
    for (expected, turn) in turns.iter().enumerate() {
        assert_eq!(turn.index, expected, "turn indices must be contiguous");
    }
}
