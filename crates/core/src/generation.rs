//! Generator trait: the abstraction over the remote text-generation service.
//!
//! A Generator takes one prompt and returns one completion together with the
//! token usage and the money it cost. Every call is paid and rate-limited,
//! which is why everything else in StoryLoom exists.
//!
//! Implementations: OpenAI-compatible HTTP endpoints, test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::GenerationError;

/// A single generation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationRequest {
    /// The user prompt
    pub prompt: String,

    /// Optional system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// The model to use (e.g., "openai/gpt-4o-mini")
    pub model: String,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

impl GenerationRequest {
    /// Create a request with default token and temperature settings.
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: model.into(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A completed generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationResponse {
    /// The generated text
    pub content: String,

    /// Token usage statistics
    pub usage: Usage,

    /// Cost of this call in USD
    pub cost: f64,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

/// The generation collaborator.
///
/// The scheduler calls `generate()` without knowing which backend is used.
/// A call may be abandoned by the caller (timeout); implementations must not
/// rely on being polled to completion.
#[async_trait]
pub trait Generator: Send + Sync {
    /// A human-readable name for this generator (e.g., "openai").
    fn name(&self) -> &str;

    /// Generate a completion for the request.
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError>;
}
