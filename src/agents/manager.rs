use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{AgentContext, ManagerAgent, ManagerReply};
use crate::{config::AgentVersion, conversation::Turn, error::AgentInvocationError};

#[derive(Serialize)]
struct ManagerRequest<'a> {
    run_id: &'a str,
    scenario_id: &'a str,
    history: &'a [Turn],
}

/// Talks to a manager agent exposed over HTTP.
#[derive(Debug, Clone)]
pub struct HttpManagerAgent {
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl HttpManagerAgent {
    pub fn from_version(version: &AgentVersion) -> Result<Self, AgentInvocationError> {
        let client = Client::builder().timeout(version.request_timeout()).build()?;
        Ok(Self {
            client,
            url: version.url.clone(),
            headers: version.headers.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ManagerAgent for HttpManagerAgent {
    async fn respond(
        &self,
        ctx: &AgentContext,
        history: &[Turn],
    ) -> Result<ManagerReply, AgentInvocationError> {
        let body = ManagerRequest {
            run_id: &ctx.run_id,
            scenario_id: &ctx.scenario_id,
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

        serde_json::from_str(&text).map_err(|e| AgentInvocationError::malformed(e.to_string()))
    }
}
