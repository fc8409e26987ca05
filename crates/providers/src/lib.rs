//! Generation service adapters for StoryLoom.
//!
//! All adapters implement [`storyloom_core::Generator`]. The scheduler
//! never knows which one it is talking to.

pub mod openai_compat;

use std::sync::Arc;

use storyloom_config::{AppConfig, ConfigError};
use storyloom_core::Generator;
use storyloom_telemetry::PricingTable;

pub use openai_compat::{OpenAiCompatGenerator, classify_status};

/// Build the configured generator.
///
/// A key is required unless the endpoint is local.
pub fn build_from_config(
    config: &AppConfig,
    pricing: Arc<PricingTable>,
) -> Result<Arc<dyn Generator>, ConfigError> {
    let local = is_local(&config.api_url);
    let api_key = match (&config.api_key, local) {
        (Some(key), _) => key.clone(),
        (None, true) => String::new(),
        (None, false) => {
            return Err(ConfigError::ValidationError(format!(
                "No API key configured for {}; set STORYLOOM_API_KEY or api_key in config.toml",
                config.api_url
            )));
        }
    };
    let name = if config.api_url.contains("openrouter.ai") {
        "openrouter"
    } else if local {
        "local"
    } else {
        "openai"
    };
    tracing::debug!(generator = name, url = %config.api_url, "Building generator");
    Ok(Arc::new(OpenAiCompatGenerator::new(
        name,
        config.api_url.as_str(),
        api_key,
        pricing,
    )))
}

fn is_local(url: &str) -> bool {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', ':'])
        .next()
        .unwrap_or_default();
    matches!(host, "localhost" | "127.0.0.1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_endpoint_needs_key() {
        let config = AppConfig::default();
        let err = build_from_config(&config, Arc::new(PricingTable::with_defaults()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("API key"));
    }

    #[test]
    fn local_endpoint_works_without_key() {
        let config = AppConfig {
            api_url: "http://localhost:11434/v1".into(),
            ..AppConfig::default()
        };
        let generator = build_from_config(&config, Arc::new(PricingTable::with_defaults())).unwrap();
        assert_eq!(generator.name(), "local");
    }

    #[test]
    fn openrouter_is_named() {
        let config = AppConfig {
            api_key: Some("sk-or".into()),
            api_url: "https://openrouter.ai/api/v1".into(),
            ..AppConfig::default()
        };
        let generator = build_from_config(&config, Arc::new(PricingTable::with_defaults())).unwrap();
        assert_eq!(generator.name(), "openrouter");
    }

    #[test]
    fn local_host_detection() {
        assert!(is_local("http://127.0.0.1:8000/v1"));
        assert!(is_local("http://localhost/v1"));
        assert!(!is_local("https://api.openai.com/v1"));
    }
}
