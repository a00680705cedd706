use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ChatCompletion, ChatMessage, ChatRequest, LLMProvider};
use crate::{conversation::Usage, error::LLMError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Any endpoint that speaks the OpenAI chat completions protocol: OpenAI
/// itself, OpenRouter, vLLM, Ollama and friends.
#[derive(Debug, Clone)]
pub struct OpenAICompatible {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAICompatible {
    pub fn new(api_key: impl Into<String>, request_timeout: Duration) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Reads the key from `key_var`, failing with the variable name when it
    /// is unset.
    pub fn from_env_var(key_var: &str, request_timeout: Duration) -> Result<Self, LLMError> {
        let api_key =
            std::env::var(key_var).map_err(|_| LLMError::MissingApiKey(key_var.to_string()))?;
        Self::new(api_key, request_timeout)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

impl<'a> From<&'a ChatRequest> for WireRequest<'a> {
    fn from(request: &'a ChatRequest) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            response_format: request
                .json_mode
                .then(|| json!({"type": "json_object"})),
        }
    }
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
}

#[derive(Deserialize)]
struct WirePromptDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        let cached = usage
            .prompt_tokens_details
            .map(|details| details.cached_tokens)
            .unwrap_or(0);
        Usage::new(usage.prompt_tokens, usage.completion_tokens).with_cached(cached)
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn into_completion(response: WireResponse) -> Result<ChatCompletion, LLMError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or(LLMError::InvalidResponse("completion without content"))?;
    Ok(ChatCompletion {
        content,
        usage: response.usage.map(Usage::from),
    })
}

#[async_trait]
impl LLMProvider for OpenAICompatible {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, LLMError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&WireRequest::from(&request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|envelope| envelope.error.message)
                .unwrap_or_else(|_| format!("unexpected status {status}: {text}"));
            return Err(LLMError::Provider(message));
        }

        into_completion(response.json().await?)
    }

    fn name(&self) -> &'static str {
        "openai-compatible"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_tolerates_trailing_slash() {
        let provider = OpenAICompatible::new("key", Duration::from_secs(5))
            .expect("client builds")
            .with_base_url("http://localhost:11434/v1/");
        assert_eq!(provider.completions_url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn json_mode_sets_response_format() {
        let request = ChatRequest::new("gpt-4o-mini", vec![ChatMessage::system("be a customer")])
            .with_temperature(Some(0.7))
            .json_mode();
        let body = serde_json::to_value(WireRequest::from(&request)).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");

        let plain = ChatRequest::new("m", Vec::new());
        let body = serde_json::to_value(WireRequest::from(&plain)).unwrap();
        assert!(body.get("response_format").is_none());
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn cached_prompt_tokens_map_into_usage() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{\"status\": \"complete\"}"}}],
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 8,
                "total_tokens": 128,
                "prompt_tokens_details": {"cached_tokens": 96}
            }
        }"#;
        let completion = into_completion(serde_json::from_str(raw).unwrap()).unwrap();
        assert_eq!(completion.usage, Some(Usage::new(120, 8).with_cached(96)));
        assert_eq!(completion.content, r#"{"status": "complete"}"#);
    }

    #[test]
    fn empty_choices_are_invalid() {
        let result = into_completion(serde_json::from_str(r#"{"choices": []}"#).unwrap());
        assert!(matches!(result, Err(LLMError::InvalidResponse(_))));
    }
}
