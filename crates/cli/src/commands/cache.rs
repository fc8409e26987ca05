//! `storyloom cache`: durable cache maintenance.

use std::path::Path;
use std::time::Duration;

use storyloom_cache::{CacheManager, HotCache};
use storyloom_scheduler::durable_from_config;

async fn open(config_path: Option<&Path>) -> Result<CacheManager, Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let hot = HotCache::new(
        config.cache.hot_capacity,
        Duration::from_secs(config.cache.hot_ttl_secs),
    );
    let durable = durable_from_config(&config).await?;
    Ok(CacheManager::new(hot, Some(durable)))
}

pub async fn stats(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config_path).await?;
    let stats = cache.stats().await;

    println!("🗄️  Durable Cache");
    println!("─────────────────────────────────────");
    match stats.durable {
        Some(durable) => {
            println!("  Backend:          {}", durable.backend);
            println!("  Records:          {}", durable.records);
            println!("  Corrupt dropped:  {}", durable.corrupt_dropped);
        }
        None => println!("  (durable cache unavailable)"),
    }
    Ok(())
}

pub async fn cleanup(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config_path).await?;
    let report = cache.cleanup().await?;
    println!(
        "🧹 Removed {} expired durable record(s)",
        report.durable_removed
    );
    Ok(())
}

pub async fn invalidate(
    config_path: Option<&Path>,
    fingerprint: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config_path).await?;
    let removed = cache.invalidate(fingerprint).await?;
    println!("🗑️  Invalidated {removed} record(s) derived from {fingerprint}");
    Ok(())
}

pub async fn clear(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let cache = open(config_path).await?;
    cache.clear().await?;
    println!("✅ Cache cleared");
    Ok(())
}
