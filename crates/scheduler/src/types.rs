//! Operation and result types shared by the scheduler and the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use storyloom_cache::DurableDescriptor;
use storyloom_cache::key::request_key;
use storyloom_config::SchedulerConfig;
use storyloom_core::{GenerationRequest, NarrativeState, SchedulerError, UnitPlan, Usage};

pub type OperationId = String;

/// Lifecycle of one operation.
///
/// `Failed` is only observable once retries are exhausted; a failed
/// attempt with retries left goes straight back to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A unit of work for the scheduler.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    pub id: OperationId,
    /// Operation tag, part of the cache key
    pub operation: String,
    pub request: GenerationRequest,
    /// Higher runs first; ties are FIFO
    pub priority: i32,
    pub cache_key: String,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Where the result lives in the durable cache, if it should
    pub durable: Option<DurableDescriptor>,
}

impl BatchOperation {
    pub fn new(operation: impl Into<String>, request: GenerationRequest) -> Self {
        let operation = operation.into();
        let cache_key = request_key(&request, &operation);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            request,
            priority: 0,
            cache_key,
            retry_count: 0,
            durable: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_durable(mut self, durable: DurableDescriptor) -> Self {
        self.durable = Some(durable);
        self
    }
}

/// The terminal outcome of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub id: OperationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// USD spent on this operation; zero for failures and reuse
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure class (`timeout`, `rate_limited`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub cached: bool,
    pub processing_time_ms: u64,
    /// Generation attempts made; zero for cache hits and followers
    pub attempts: u32,
}

impl BatchResult {
    pub(crate) fn cached(id: OperationId, content: String, usage: Option<Usage>) -> Self {
        Self {
            id,
            success: true,
            content: Some(content),
            usage,
            cost: 0.0,
            error: None,
            error_kind: None,
            cached: true,
            processing_time_ms: 0,
            attempts: 0,
        }
    }

    pub(crate) fn rejected(id: OperationId, error: &SchedulerError) -> Self {
        Self {
            id,
            success: false,
            content: None,
            usage: None,
            cost: 0.0,
            error: Some(error.to_string()),
            error_kind: Some("rejected".into()),
            cached: false,
            processing_time_ms: 0,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> OperationPhase {
        if self.success {
            OperationPhase::Succeeded
        } else {
            OperationPhase::Failed
        }
    }
}

/// Read-only scheduler snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub submitted: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub deduplicated: u64,
    pub peak_in_flight: usize,
}

/// Scheduler tuning, usually built from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub single_flight: bool,
    pub result_retention: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            single_flight: config.single_flight,
            result_retention: config.result_retention.max(1),
        }
    }
}

impl SchedulerSettings {
    /// Wait before retry number `retry` (1-based):
    /// `min(base × 2^(retry-1), max)`, floored by a server-supplied
    /// retry-after.
    pub fn backoff(&self, retry: u32, retry_after_secs: Option<u64>) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        match retry_after_secs {
            Some(secs) => delay.max(Duration::from_secs(secs)),
            None => delay,
        }
    }
}

/// Narrative input for context compression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeInput {
    #[serde(default)]
    pub state: NarrativeState,
    pub plan: UnitPlan,
}

/// What callers hand to [`Engine::submit_work`](crate::Engine::submit_work).
///
/// Unset generation settings fall back to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub operation: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative: Option<NarrativeInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<DurableDescriptor>,
}

impl WorkItem {
    pub fn new(operation: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}
