//! StoryLoom CLI: the main entry point.
//!
//! Commands:
//! - `run`     Run a batch of work items through the engine
//! - `tier`    Show the tier decision and compressed context for a plan
//! - `cache`   Inspect and maintain the durable cache
//! - `config`  Show, validate or locate the configuration
//! - `pricing` List model pricing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "storyloom",
    about = "StoryLoom: context-optimizing, caching batch runner for paid text generation",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.storyloom/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch of work items from a JSON file
    Run {
        /// JSON array of work items, or an object with an `items` array
        batch: PathBuf,

        /// Override the maximum number of concurrent generation calls
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print results as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show the complexity score, tier and compressed context for a plan
    Tier {
        /// JSON document with `state` and `plan`
        plan: PathBuf,
    },

    /// Durable cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// List model pricing (per 1M tokens)
    Pricing,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show durable cache statistics
    Stats,
    /// Purge expired records
    Cleanup,
    /// Invalidate a fingerprint and everything derived from it
    Invalidate { fingerprint: String },
    /// Remove every record
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration
    Validate,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            batch,
            concurrency,
            json,
        } => commands::run::run(config_path, &batch, concurrency, json).await?,
        Commands::Tier { plan } => commands::tier::run(config_path, &plan).await?,
        Commands::Cache { action } => match action {
            CacheAction::Stats => commands::cache::stats(config_path).await?,
            CacheAction::Cleanup => commands::cache::cleanup(config_path).await?,
            CacheAction::Invalidate { fingerprint } => {
                commands::cache::invalidate(config_path, &fingerprint).await?
            }
            CacheAction::Clear => commands::cache::clear(config_path).await?,
        },
        Commands::Config { action } => match action.unwrap_or(ConfigAction::Show) {
            ConfigAction::Show => commands::config_cmd::show(config_path).await?,
            ConfigAction::Validate => commands::config_cmd::validate(config_path).await?,
            ConfigAction::Path => commands::config_cmd::path(config_path).await?,
        },
        Commands::Pricing => commands::pricing::run(config_path).await?,
    }

    Ok(())
}
