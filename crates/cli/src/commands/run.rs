//! `storyloom run`: run a batch of work items through the engine.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use storyloom_providers::build_from_config;
use storyloom_scheduler::{BatchResult, Engine, WorkItem, pricing_from_config};

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Items(Vec<WorkItem>),
    Wrapped { items: Vec<WorkItem> },
}

/// Accepts a bare JSON array or `{ "items": [...] }`.
pub fn parse_batch(text: &str) -> Result<Vec<WorkItem>, serde_json::Error> {
    Ok(match serde_json::from_str::<BatchFile>(text)? {
        BatchFile::Items(items) | BatchFile::Wrapped { items } => items,
    })
}

pub fn summary_line(result: &BatchResult) -> String {
    if result.success {
        let tokens = result.usage.map(|u| u.total()).unwrap_or_default();
        let source = if result.cached { "cached" } else { "generated" };
        format!(
            "✅ {:<38} {:<9} {:>6} tok  ${:.6}  {}ms",
            result.id, source, tokens, result.cost, result.processing_time_ms
        )
    } else {
        format!(
            "❌ {:<38} {:<9} {}",
            result.id,
            result.error_kind.as_deref().unwrap_or("error"),
            result.error.as_deref().unwrap_or_default()
        )
    }
}

pub async fn run(
    config_path: Option<&Path>,
    batch: &Path,
    concurrency: Option<usize>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = super::load_config(config_path)?;
    if let Some(n) = concurrency {
        config.scheduler.max_concurrency = n.max(1);
    }

    let text = std::fs::read_to_string(batch)
        .map_err(|e| format!("Failed to read {}: {e}", batch.display()))?;
    let items = parse_batch(&text).map_err(|e| format!("Invalid batch file: {e}"))?;
    if items.is_empty() {
        println!("Batch is empty.");
        return Ok(());
    }

    let pricing = Arc::new(pricing_from_config(&config.telemetry));
    let generator = build_from_config(&config, pricing)?;
    let engine = Engine::from_config(&config, generator).await?;
    engine.start();

    let count = items.len();
    tracing::info!(items = count, max_concurrency = config.scheduler.max_concurrency, "Running batch");
    let results = engine.run_batch(items).await;

    if json {
        for result in &results {
            println!("{}", serde_json::to_string(result)?);
        }
    } else {
        for result in &results {
            println!("{}", summary_line(result));
        }
        print_stats(&engine).await;
    }

    engine.shutdown().await;
    if results.iter().any(|r| !r.success) {
        return Err(format!(
            "{} of {count} operations failed",
            results.iter().filter(|r| !r.success).count()
        )
        .into());
    }
    Ok(())
}

async fn print_stats(engine: &Engine) {
    let scheduler = engine.scheduler_stats();
    let cache = engine.cache_stats().await;
    let costs = engine.cost_summary();

    println!();
    println!("📊 Batch");
    println!("─────────────────────────────────────");
    println!("  Succeeded:      {}", scheduler.succeeded);
    println!("  Failed:         {}", scheduler.failed);
    println!("  Retries:        {}", scheduler.retries);
    println!("  Timeouts:       {}", scheduler.timeouts);
    println!("  Deduplicated:   {}", scheduler.deduplicated);
    println!("  Peak in flight: {}", scheduler.peak_in_flight);
    println!("  Avg latency:    {:.0}ms", scheduler.avg_latency_ms);
    println!("  Cache hit rate: {:.1}%", scheduler.cache_hit_rate * 100.0);
    println!();
    println!("  Hot cache:      {}/{} entries", cache.hot.size, cache.hot.capacity);
    if let Some(durable) = &cache.durable {
        println!("  Durable cache:  {} records ({})", durable.records, durable.backend);
    }
    println!();
    println!("  Spent:          ${:.6} over {} calls", costs.spent_usd, costs.generation_calls);
    println!(
        "  Saved:          ${:.6} ({:.1}%)",
        costs.saved_usd,
        costs.savings_ratio() * 100.0
    );
}
