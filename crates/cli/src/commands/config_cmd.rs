//! `storyloom config`: configuration management commands.

use std::path::Path;

use storyloom_config::AppConfig;

/// Non-fatal problems in a config that otherwise loads.
pub fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    let local = config.api_url.contains("localhost") || config.api_url.contains("127.0.0.1");
    if config.api_key.is_none() && !local {
        warnings.push("No API key set (set STORYLOOM_API_KEY or OPENAI_API_KEY)".to_string());
    }
    if config.scheduler.backoff_base_ms > config.scheduler.backoff_max_ms {
        warnings.push("scheduler.backoff_base_ms exceeds scheduler.backoff_max_ms".to_string());
    }
    if config.cache.durable_backend == "memory" {
        warnings.push("Durable cache is in-memory; results will not survive a restart".to_string());
    }
    if config.scheduler.max_retries == 0 {
        warnings.push("Retries disabled; rate limits will fail operations".to_string());
    }
    warnings
}

pub async fn validate(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match super::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Endpoint:     {}", config.api_url);
    println!("   Model:        {}", config.default_model);
    println!("   Concurrency:  {}", config.scheduler.max_concurrency);
    println!("   Hot cache:    {} entries", config.cache.hot_capacity);
    println!("   Durable:      {}", config.cache.durable_backend);
    Ok(())
}

pub async fn show(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config =
        super::load_config(config_path).map_err(|e| format!("Failed to load config: {e}"))?;
    if config.api_key.is_some() {
        config.api_key = Some("********".into());
    }
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => println!("{}", path.display()),
        None => println!("{}", AppConfig::config_dir().join("config.toml").display()),
    }
    Ok(())
}
