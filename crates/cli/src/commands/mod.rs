pub mod cache;
pub mod config_cmd;
pub mod pricing;
pub mod run;
pub mod tier;

use std::path::Path;

use storyloom_config::{AppConfig, ConfigError};

/// Load the explicit config file if given, else the default one.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => AppConfig::load(),
    }
}
