//! Configuration loading, validation, and management for StoryLoom.
//!
//! Loads configuration from `~/.storyloom/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use storyloom_core::ContentType;

/// The root configuration structure.
///
/// Maps directly to `~/.storyloom/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the generation service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible generation endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default max tokens per generation
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Hot and durable cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Batch scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Complexity analysis and context compression configuration
    #[serde(default)]
    pub context: ContextConfig,

    /// Cost tracking configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.7
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("default_temperature", &self.default_temperature)
            .field("cache", &self.cache)
            .field("scheduler", &self.scheduler)
            .field("context", &self.context)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries in the in-process hot cache
    #[serde(default = "default_hot_capacity")]
    pub hot_capacity: usize,

    /// Default hot-cache TTL in seconds
    #[serde(default = "default_hot_ttl_secs")]
    pub hot_ttl_secs: u64,

    /// Eager expiry sweep interval in seconds (0 disables the sweeper)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// "sqlite" or "memory"
    #[serde(default = "default_durable_backend")]
    pub durable_backend: String,

    /// SQLite database path (defaults to ~/.storyloom/cache.db)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_path: Option<String>,

    /// Maximum durable records before least-valuable eviction
    #[serde(default = "default_durable_max_records")]
    pub durable_max_records: usize,

    /// How many similar candidates to rank per lookup
    #[serde(default = "default_similarity_limit")]
    pub similarity_limit: usize,

    /// Content type tag → similarity threshold (0.0–1.0)
    #[serde(default)]
    pub threshold_overrides: HashMap<String, f32>,

    /// Content type tag → TTL in hours
    #[serde(default)]
    pub ttl_overrides_hours: HashMap<String, u64>,
}

fn default_hot_capacity() -> usize {
    1000
}
fn default_hot_ttl_secs() -> u64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_durable_backend() -> String {
    "sqlite".into()
}
fn default_durable_max_records() -> usize {
    10_000
}
fn default_similarity_limit() -> usize {
    5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            hot_capacity: default_hot_capacity(),
            hot_ttl_secs: default_hot_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            durable_backend: default_durable_backend(),
            durable_path: None,
            durable_max_records: default_durable_max_records(),
            similarity_limit: default_similarity_limit(),
            threshold_overrides: HashMap::new(),
            ttl_overrides_hours: HashMap::new(),
        }
    }
}

impl CacheConfig {
    /// Resolved SQLite path for the durable cache.
    pub fn durable_path(&self) -> PathBuf {
        self.durable_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| AppConfig::config_dir().join("cache.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum generation calls in flight
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Re-queues allowed after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Collapse concurrent identical requests into one call
    #[serde(default = "default_true")]
    pub single_flight: bool,

    /// Terminal results kept for `await_results`
    #[serde(default = "default_result_retention")]
    pub result_retention: usize,
}

fn default_max_concurrency() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_result_retention() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            single_flight: true,
            result_retention: default_result_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Signatures remembered by the tier feedback table
    #[serde(default = "default_feedback_capacity")]
    pub feedback_capacity: usize,

    /// Minimum outcome quality (0.0–1.0) for a learned tier to apply
    #[serde(default = "default_feedback_min_quality")]
    pub feedback_min_quality: f32,
}

fn default_feedback_capacity() -> usize {
    256
}
fn default_feedback_min_quality() -> f32 {
    0.8
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            feedback_capacity: default_feedback_capacity(),
            feedback_min_quality: default_feedback_min_quality(),
        }
    }
}

/// Cost tracking configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Custom model pricing overrides (model name → pricing)
    #[serde(default)]
    pub custom_pricing: HashMap<String, PricingOverrideConfig>,
}

/// Custom per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M input tokens in USD
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD
    pub output_per_m: f64,
}

impl AppConfig {
    /// Load configuration from the default path (~/.storyloom/config.toml).
    ///
    /// Environment variables override the file:
    /// - `STORYLOOM_API_KEY` (falls back to `OPENAI_API_KEY`)
    /// - `STORYLOOM_MODEL`
    /// - `STORYLOOM_API_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `STORYLOOM_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("STORYLOOM_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }
        if let Ok(model) = std::env::var("STORYLOOM_MODEL") {
            self.default_model = model;
        }
        if let Ok(url) = std::env::var("STORYLOOM_API_URL") {
            self.api_url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".storyloom")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.cache.hot_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache.hot_capacity must be > 0".into(),
            ));
        }
        if !matches!(self.cache.durable_backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "cache.durable_backend must be \"sqlite\" or \"memory\", got \"{}\"",
                self.cache.durable_backend
            )));
        }
        for (tag, threshold) in &self.cache.threshold_overrides {
            if ContentType::parse(tag).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "cache.threshold_overrides: unknown content type \"{tag}\""
                )));
            }
            if !(0.0..=1.0).contains(threshold) {
                return Err(ConfigError::ValidationError(format!(
                    "cache.threshold_overrides.{tag} must be between 0.0 and 1.0"
                )));
            }
        }
        for tag in self.cache.ttl_overrides_hours.keys() {
            if ContentType::parse(tag).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "cache.ttl_overrides_hours: unknown content type \"{tag}\""
                )));
            }
        }
        if self.scheduler.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.max_concurrency must be > 0".into(),
            ));
        }
        if self.scheduler.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.timeout_secs must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.context.feedback_min_quality) {
            return Err(ConfigError::ValidationError(
                "context.feedback_min_quality must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            default_model: default_model(),
            default_max_tokens: default_max_tokens(),
            default_temperature: default_temperature(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            context: ContextConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
