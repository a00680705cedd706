//! Configuration objects passed explicitly into the engine, the benchmark
//! runner and the agent adapters. Nothing here is global; the CLI loads one
//! [`HarnessConfig`] and hands the pieces out.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{evaluator::EvaluatorConfig, metrics::Pricing};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Bounded exponential backoff for transient agent failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(format!(
                "{scope}.max_attempts must be at least 1"
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "{scope}.multiplier must be a finite value >= 1.0"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Consecutive failing tool calls after which the run ends in `error`.
    pub tool_failure_ceiling: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            tool_failure_ceiling: 3,
        }
    }
}

impl EngineConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tool_failure_ceiling(mut self, ceiling: u32) -> Self {
        self.tool_failure_ceiling = ceiling;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate("engine.retry")?;
        if self.tool_failure_ceiling == 0 {
            return Err(ConfigError::Invalid(
                "engine.tool_failure_ceiling must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

/// One manager agent implementation under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVersion {
    pub label: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub pricing: Pricing,
}

impl AgentVersion {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            request_timeout_ms: default_request_timeout_ms(),
            pricing: Pricing::default(),
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// Where the synthetic customer comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientAgentConfig {
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
    Llm {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
        #[serde(default = "default_api_key_env")]
        api_key_env: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_template: Option<PathBuf>,
    },
}

impl Default for ClientAgentConfig {
    fn default() -> Self {
        ClientAgentConfig::Llm {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: default_api_key_env(),
            temperature: Some(0.7),
            prompt_template: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Maximum number of (scenario, version) pairs in flight.
    pub concurrency: usize,
    pub versions: Vec<AgentVersion>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            versions: Vec::new(),
        }
    }
}

impl BenchmarkConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<AgentVersion>,
    #[serde(default)]
    pub client: ClientAgentConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory for per-run JSONL event trails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_dir: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            manager: None,
            client: ClientAgentConfig::default(),
            engine: EngineConfig::default(),
            benchmark: BenchmarkConfig::default(),
            evaluator: EvaluatorConfig::default(),
            output_dir: default_output_dir(),
            events_dir: None,
        }
    }
}

impl HarnessConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw).map_err(|error| match error {
            ConfigError::Yaml { source, .. } => ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw).map_err(|source| ConfigError::Yaml {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(config)
    }

    /// Applies `DIALOGBENCH_*` environment overrides on top of the file.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("DIALOGBENCH_MANAGER_URL") {
            match &mut self.manager {
                Some(manager) => manager.url = url,
                None => self.manager = Some(AgentVersion::new("default", url)),
            }
        }
        if let Some(url) = lookup("DIALOGBENCH_CLIENT_URL") {
            self.client = ClientAgentConfig::Http {
                url,
                headers: BTreeMap::new(),
                request_timeout_ms: default_request_timeout_ms(),
            };
        }
        if let Some(raw) = lookup("DIALOGBENCH_CONCURRENCY") {
            self.benchmark.concurrency = raw.parse().map_err(|_| {
                ConfigError::Invalid(format!("DIALOGBENCH_CONCURRENCY is not a number: {raw}"))
            })?;
        }
        if let Some(dir) = lookup("DIALOGBENCH_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        if self.benchmark.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "benchmark.concurrency must be at least 1".to_string(),
            ));
        }
        let mut labels = std::collections::BTreeSet::new();
        for version in &self.benchmark.versions {
            if !labels.insert(version.label.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent version label '{}'",
                    version.label
                )));
            }
        }
        Ok(())
    }
}
