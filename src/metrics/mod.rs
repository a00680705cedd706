use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationRecord, Usage};

/// Per-token prices used to estimate what a run cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    pub prompt_per_token: f64,
    pub completion_per_token: f64,
    /// Price of prompt tokens served from cache; falls back to
    /// `prompt_per_token` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_prompt_per_token: Option<f64>,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            prompt_per_token: 0.000001,     // $0.001 per 1K tokens
            completion_per_token: 0.000002, // $0.002 per 1K tokens
            cached_prompt_per_token: None,
        }
    }
}

impl Pricing {
    pub fn new(prompt_per_token: f64, completion_per_token: f64) -> Self {
        Self {
            prompt_per_token,
            completion_per_token,
            cached_prompt_per_token: None,
        }
    }

    pub fn with_cached_prompt(mut self, price: f64) -> Self {
        self.cached_prompt_per_token = Some(price);
        self
    }

    pub fn estimate(&self, usage: &Usage) -> f64 {
        let cached = usage.cached_prompt_tokens.min(usage.prompt_tokens);
        let uncached = usage.prompt_tokens - cached;
        let cached_price = self.cached_prompt_per_token.unwrap_or(self.prompt_per_token);

        uncached as f64 * self.prompt_per_token
            + cached as f64 * cached_price
            + usage.completion_tokens as f64 * self.completion_per_token
    }
}

/// Timing, volume and cost figures for one finished conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub elapsed_ms: u64,
    /// All turns, both speakers, including the seed message.
    pub turns: usize,
    pub manager_turns: usize,
    /// Mean manager response latency, when the agent reported any.
    pub avg_response_ms: Option<f64>,
    pub tool_calls: usize,
    pub tool_errors: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_hit_ratio: Option<f64>,
    pub estimated_cost_usd: f64,
}

impl RunMetrics {
    pub fn from_record(record: &ConversationRecord) -> Self {
        let latencies: Vec<u64> = record
            .manager_turns()
            .filter_map(|turn| turn.latency_ms)
            .collect();
        let avg_response_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        };

        Self {
            elapsed_ms: record.duration_ms,
            turns: record.turns.len(),
            manager_turns: record.manager_turns().count(),
            avg_response_ms,
            tool_calls: record.tool_calls().count(),
            tool_errors: record.tool_error_count(),
            prompt_tokens: record.usage.prompt_tokens,
            completion_tokens: record.usage.completion_tokens,
            cache_hit_ratio: record.usage.cache_hit_ratio(),
            estimated_cost_usd: record.cost_usd,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Helper struct for timing a run
pub struct ExecutionTimer {
    start_time: Instant,
}

impl ExecutionTimer {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
    }
}

impl Default for ExecutionTimer {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
