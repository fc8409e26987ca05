//! OpenAI-compatible generation adapter.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM, Together AI and any other
//! endpoint exposing `/chat/completions`. Failures are classified into
//! [`GenerationError`] so the scheduler can decide what to retry.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use storyloom_core::{GenerationError, GenerationRequest, GenerationResponse, Generator, Usage};
use storyloom_telemetry::PricingTable;
use tracing::{debug, warn};

/// An OpenAI-compatible generator.
pub struct OpenAiCompatGenerator {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    pricing: Arc<PricingTable>,
}

impl OpenAiCompatGenerator {
    /// Create a generator for `base_url` (e.g. `https://api.openai.com/v1`).
    ///
    /// No client-side timeout is set; the scheduler owns timeouts.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        pricing: Arc<PricingTable>,
    ) -> Self {
        Self::with_client(name, base_url, api_key, pricing, reqwest::Client::new())
    }

    pub fn with_client(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        pricing: Arc<PricingTable>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            pricing,
        }
    }

    /// OpenAI (convenience constructor).
    pub fn openai(api_key: impl Into<String>, pricing: Arc<PricingTable>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key, pricing)
    }

    /// OpenRouter (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>, pricing: Arc<PricingTable>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key, pricing)
    }

    /// Ollama (convenience constructor). Ollama ignores the key.
    pub fn ollama(base_url: Option<&str>, pricing: Arc<PricingTable>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama",
            pricing,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn to_api_messages(request: &GenerationRequest) -> Vec<ApiMessage> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ApiMessage {
                role: "system".into(),
                content: Some(system.to_string()),
            });
        }
        messages.push(ApiMessage {
            role: "user".into(),
            content: Some(request.prompt.clone()),
        });
        messages
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": false,
        })
    }
}

/// Map a non-success HTTP status onto the generation error taxonomy.
pub fn classify_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> GenerationError {
    let message = if body.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.trim())
    };
    match status {
        429 => GenerationError::RateLimited { retry_after_secs },
        401 | 403 => GenerationError::Authentication(message),
        400 | 404 | 422 => GenerationError::MalformedRequest(message),
        500..=599 => GenerationError::Unavailable(message),
        _ => GenerationError::Unknown(message),
    }
}

/// `Retry-After` in whole seconds. HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

#[async_trait]
impl Generator for OpenAiCompatGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> std::result::Result<GenerationResponse, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(&request);

        debug!(generator = %self.name, model = %request.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("Transport error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %error_body, "Generation service returned error");
            return Err(classify_status(status.as_u16(), retry_after, &error_body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Unknown(format!("Failed to parse response: {e}")))?;

        self.finish_response(api_response, &request.model)
    }
}

impl OpenAiCompatGenerator {
    fn finish_response(
        &self,
        api_response: ApiResponse,
        requested_model: &str,
    ) -> std::result::Result<GenerationResponse, GenerationError> {
        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GenerationError::Unknown("No choices in response".into()))?;

        let usage = api_response
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let model = api_response
            .model
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| requested_model.to_string());
        // Price by the requested id; providers often answer with a dated alias.
        let cost = match self.pricing.get(requested_model) {
            Some(_) => self.pricing.compute_cost(requested_model, usage),
            None => self.pricing.compute_cost(&model, usage),
        };

        Ok(GenerationResponse {
            content: choice.message.content.unwrap_or_default(),
            usage,
            cost,
            model,
        })
    }
}

// --- OpenAI API types ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
