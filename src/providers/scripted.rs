use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use super::{ChatCompletion, ChatRequest, LLMProvider};
use crate::{conversation::Usage, LLMError};

/// Plays back canned completions in order and keeps every request it was
/// sent, so prompts can be inspected offline.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    completions: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ChatRequest>>,
    usage: Option<Usage>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            completions: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, LLMError> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }
        let next = self
            .completions
            .lock()
            .map_err(|_| LLMError::Provider("scripted provider lock poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| LLMError::Provider("script exhausted".to_string()))?;
        Ok(ChatCompletion {
            content: next,
            usage: self.usage,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
