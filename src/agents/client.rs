use std::{collections::BTreeMap, fs, sync::Arc, time::Duration};

use async_trait::async_trait;
use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::{AgentContext, ClientAgent, ClientReply};
use crate::{
    config::ClientAgentConfig,
    conversation::{Speaker, Turn},
    error::AgentInvocationError,
    providers::{openai::OpenAICompatible, ChatMessage, ChatRequest, LLMProvider},
    scenario::{PastOrder, Persona},
};

pub const DEFAULT_PERSONA_PROMPT: &str = include_str!("persona_prompt.hbs");

const PROMPT_TEMPLATE: &str = "persona";

const LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

static RE_FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json regex"));

#[derive(Serialize)]
struct ClientRequest<'a> {
    run_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    goal: Option<&'a str>,
    persona: &'a Persona,
    history: &'a [Turn],
}

/// Talks to a customer simulator exposed over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClientAgent {
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl HttpClientAgent {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, AgentInvocationError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            headers: BTreeMap::new(),
        })
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
impl ClientAgent for HttpClientAgent {
    async fn respond(
        &self,
        ctx: &AgentContext,
        persona: &Persona,
        history: &[Turn],
    ) -> Result<ClientReply, AgentInvocationError> {
        let body = ClientRequest {
            run_id: &ctx.run_id,
            goal: ctx.goal.as_deref(),
            persona,
            history,
        };
        let mut request = self.client.post(&self.url).json(&body);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AgentInvocationError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let reply: ClientReply =
            serde_json::from_str(&text).map_err(|e| AgentInvocationError::malformed(e.to_string()))?;
        reply.validate()
    }
}

#[derive(Serialize)]
struct PromptData<'a> {
    name: &'a str,
    kind: &'a str,
    goal: Option<&'a str>,
    politeness: String,
    decisiveness: String,
    budget_sensitivity: String,
    question_frequency: String,
    extra_traits: Vec<String>,
    preferences: Vec<String>,
    order_history: Vec<String>,
    communication_style: &'a str,
}

fn dial(value: f64) -> String {
    format!("{value:.2}")
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items.iter().map(describe_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn describe_order(order: &PastOrder) -> String {
    let mut line = order.items.join(", ");
    if let Some(total) = order.total {
        line.push_str(&format!(" (total {total})"));
    }
    if let Some(date) = &order.date {
        line = format!("{date}: {line}");
    }
    if let Some(note) = &order.note {
        line.push_str(&format!(", {note}"));
    }
    line
}

/// Customer simulated by a chat model. The persona is rendered into the
/// system prompt; the customer speaks as `assistant`, the manager as `user`.
pub struct LlmClientAgent {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
    templates: Handlebars<'static>,
}

impl LlmClientAgent {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        templates.set_strict_mode(true);
        if let Err(error) = templates.register_template_string(PROMPT_TEMPLATE, DEFAULT_PERSONA_PROMPT) {
            tracing::error!(%error, "bundled persona prompt failed to parse");
        }
        Self {
            provider,
            model: model.into(),
            temperature: Some(0.7),
            templates,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Replaces the persona prompt with a custom handlebars template.
    pub fn with_template(mut self, template: &str) -> Result<Self, AgentInvocationError> {
        self.templates
            .register_template_string(PROMPT_TEMPLATE, template)
            .map_err(|e| AgentInvocationError::Prompt(e.to_string()))?;
        Ok(self)
    }

    pub fn system_prompt(&self, ctx: &AgentContext, persona: &Persona) -> Result<String, AgentInvocationError> {
        let traits = &persona.characteristics;
        let data = PromptData {
            name: &persona.name,
            kind: &persona.kind,
            goal: ctx.goal.as_deref(),
            politeness: dial(traits.politeness),
            decisiveness: dial(traits.decisiveness),
            budget_sensitivity: dial(traits.budget_sensitivity),
            question_frequency: dial(traits.question_frequency),
            extra_traits: traits
                .extra
                .iter()
                .map(|(name, value)| format!("{}: {}", name.replace('_', " "), dial(*value)))
                .collect(),
            preferences: persona
                .preferences
                .iter()
                .map(|(key, value)| format!("{}: {}", key.replace('_', " "), describe_value(value)))
                .collect(),
            order_history: persona.order_history.iter().map(describe_order).collect(),
            communication_style: &persona.communication_style,
        };
        self.templates
            .render(PROMPT_TEMPLATE, &data)
            .map_err(|e| AgentInvocationError::Prompt(e.to_string()))
    }

    fn messages(&self, system: String, history: &[Turn]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend(history.iter().map(|turn| match turn.speaker {
            Speaker::Client => ChatMessage::assistant(turn.message.clone()),
            Speaker::Manager => ChatMessage::user(turn.message.clone()),
        }));
        messages
    }
}

#[async_trait]
impl ClientAgent for LlmClientAgent {
    async fn respond(
        &self,
        ctx: &AgentContext,
        persona: &Persona,
        history: &[Turn],
    ) -> Result<ClientReply, AgentInvocationError> {
        let system = self.system_prompt(ctx, persona)?;
        let request = ChatRequest::new(self.model.clone(), self.messages(system, history))
            .with_temperature(self.temperature)
            .json_mode();

        let completion = self.provider.complete(request).await?;
        let mut reply = parse_client_reply(&completion.content)?;
        if completion.usage.is_some() {
            reply.usage = completion.usage;
        }
        reply.validate()
    }
}

/// Parses the JSON reply contract, accepting a bare object, a fenced block,
/// or an object embedded in surrounding prose. The signal is never guessed
/// from free text.
fn parse_client_reply(content: &str) -> Result<ClientReply, AgentInvocationError> {
    let trimmed = content.trim();
    if let Ok(reply) = serde_json::from_str::<ClientReply>(trimmed) {
        return Ok(reply);
    }
    if let Some(block) = RE_FENCED_JSON.captures(trimmed).and_then(|c| c.get(1)) {
        if let Ok(reply) = serde_json::from_str::<ClientReply>(block.as_str()) {
            return Ok(reply);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(reply) = serde_json::from_str::<ClientReply>(&trimmed[start..=end]) {
                return Ok(reply);
            }
        }
    }
    Err(AgentInvocationError::malformed(format!(
        "customer reply does not follow the JSON contract: {}",
        truncate(trimmed, 200)
    )))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Builds the configured customer simulator.
pub fn build_client_agent(config: &ClientAgentConfig) -> Result<Arc<dyn ClientAgent>, AgentInvocationError> {
    match config {
        ClientAgentConfig::Http {
            url,
            headers,
            request_timeout_ms,
        } => {
            let agent = HttpClientAgent::new(url.clone(), Duration::from_millis(*request_timeout_ms))?
                .with_headers(headers.clone());
            Ok(Arc::new(agent))
        }
        ClientAgentConfig::Llm {
            model,
            base_url,
            api_key_env,
            temperature,
            prompt_template,
        } => {
            let mut provider = OpenAICompatible::from_env_var(api_key_env, LLM_REQUEST_TIMEOUT)?;
            if let Some(base_url) = base_url {
                provider = provider.with_base_url(base_url.clone());
            }

            let mut agent =
                LlmClientAgent::new(Arc::new(provider), model.clone()).with_temperature(*temperature);
            if let Some(path) = prompt_template {
                let template = fs::read_to_string(path).map_err(|e| {
                    AgentInvocationError::Prompt(format!("{}: {e}", path.display()))
                })?;
                agent = agent.with_template(&template)?;
            }
            Ok(Arc::new(agent))
        }
    }
}
