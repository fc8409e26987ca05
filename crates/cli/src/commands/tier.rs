//! `storyloom tier`: show how a plan would be contextualized.

use std::path::Path;

use storyloom_context::{ComplexityAnalyzer, ContextCompressor, TierFeedback};
use storyloom_scheduler::NarrativeInput;

pub async fn run(config_path: Option<&Path>, plan: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config(config_path)?;
    let text = std::fs::read_to_string(plan)
        .map_err(|e| format!("Failed to read {}: {e}", plan.display()))?;
    let input: NarrativeInput =
        serde_json::from_str(&text).map_err(|e| format!("Invalid plan file: {e}"))?;

    // A fresh process has no learned outcomes; this shows the computed tier.
    let feedback = TierFeedback::new(
        config.context.feedback_capacity,
        config.context.feedback_min_quality,
    );
    let decision = ComplexityAnalyzer::new().select_tier(&input.plan, &feedback);
    let (context, report) =
        ContextCompressor::new().compress_with_report(decision.tier, &input.state, &input.plan);

    println!("🧭 Unit {}: {}", input.plan.number, input.plan.title);
    println!("─────────────────────────────────────");
    println!("  Score:     {}", decision.score);
    println!("  Tier:      {} (budget {} tokens)", decision.tier, decision.tier.token_budget());
    println!("  Source:    {:?}", decision.source);
    println!("  Signature: {}", decision.signature);
    println!("  Context:   {report}");
    println!();
    println!("{}", context.render());
    Ok(())
}
