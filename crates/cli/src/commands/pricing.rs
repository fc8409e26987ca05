//! `storyloom pricing`: list the pricing table in effect.

use std::path::Path;

use storyloom_scheduler::pricing_from_config;

pub async fn run(config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let table = pricing_from_config(&config.telemetry);
    let models = table.models();

    println!("💰 Model Pricing (per 1M tokens)");
    println!("─────────────────────────────────────────────────────");
    println!("{:<40} {:>10} {:>10}", "Model", "Input", "Output");
    println!("{:<40} {:>10} {:>10}", "─────", "─────", "──────");

    for name in &models {
        if let Some(p) = table.get(name) {
            let marker = if config.telemetry.custom_pricing.contains_key(name) {
                " *"
            } else {
                ""
            };
            println!(
                "{:<40} ${:>8.3} ${:>8.3}{marker}",
                name, p.input_per_m, p.output_per_m
            );
        }
    }

    println!();
    println!("  {} models with pricing data", models.len());
    if !config.telemetry.custom_pricing.is_empty() {
        println!("  * overridden in [telemetry.custom_pricing]");
    }
    if table.get(&config.default_model).is_none() {
        println!();
        println!(
            "⚠ Default model '{}' not found in pricing table; its calls cost $0.",
            config.default_model
        );
    }
    Ok(())
}
