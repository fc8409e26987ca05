//! Built-in pricing table for the models StoryLoom is usually pointed at.
//!
//! Prices are in USD per 1 million tokens. Custom pricing can be added at
//! runtime from the `[telemetry.custom_pricing]` config table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use storyloom_core::Usage;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost of a call with the given usage.
    pub fn cost(&self, usage: Usage) -> f64 {
        (usage.input_tokens as f64 * self.input_per_m
            + usage.output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("openai/gpt-4o", 2.5, 10.0),
    ("openai/gpt-4o-mini", 0.15, 0.6),
    ("openai/gpt-4.1", 2.0, 8.0),
    ("openai/gpt-4.1-mini", 0.4, 1.6),
    ("anthropic/claude-sonnet-4", 3.0, 15.0),
    ("anthropic/claude-3.5-haiku", 0.8, 4.0),
    ("google/gemini-2.0-flash", 0.1, 0.4),
    ("mistral/mistral-large", 2.0, 6.0),
    ("deepseek/deepseek-v3", 0.27, 1.1),
];

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let prices = BUILTIN_PRICES
            .iter()
            .map(|(name, input, output)| (name.to_string(), ModelPricing::new(*input, *output)))
            .collect();
        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Add or update pricing for a model.
    pub fn set(&self, model: impl Into<String>, pricing: ModelPricing) {
        self.prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(model.into(), pricing);
    }

    /// Resolve pricing for a model name.
    ///
    /// Tries an exact match, then the bare model name on both sides
    /// (`gpt-4o` ↔ `openai/gpt-4o`), then the longest known bare name that
    /// prefixes the requested one (`gpt-4o-mini-2024-07-18` → `gpt-4o-mini`).
    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(p) = prices.get(model) {
            return Some(*p);
        }

        let wanted = bare_name(model).to_lowercase();
        prices
            .iter()
            .map(|(key, pricing)| (bare_name(key).to_lowercase(), pricing))
            .filter(|(bare, _)| wanted.starts_with(bare.as_str()))
            .max_by_key(|(bare, _)| bare.len())
            .map(|(_, pricing)| *pricing)
    }

    /// Cost of a call, 0.0 when the model is unknown.
    pub fn compute_cost(&self, model: &str, usage: Usage) -> f64 {
        self.get(model).map(|p| p.cost(usage)).unwrap_or(0.0)
    }

    /// All known model names, sorted.
    pub fn models(&self) -> Vec<String> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = prices.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn bare_name(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_cost() {
        let table = PricingTable::with_defaults();
        // (1000 * 2.5 + 500 * 10.0) / 1M = 0.0075
        let cost = table.compute_cost("openai/gpt-4o", Usage::new(1000, 500));
        assert!((cost - 0.0075).abs() < 1e-12);
    }

    #[test]
    fn bare_and_versioned_names_resolve() {
        let table = PricingTable::with_defaults();
        let exact = table.get("openai/gpt-4o-mini").unwrap();
        assert_eq!(table.get("gpt-4o-mini"), Some(exact));
        // longest prefix wins over "gpt-4o"
        assert_eq!(table.get("gpt-4o-mini-2024-07-18"), Some(exact));
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.compute_cost("acme/unknown", Usage::new(10, 10)), 0.0);
    }

    #[test]
    fn custom_pricing_overrides() {
        let table = PricingTable::empty();
        assert!(table.is_empty());
        table.set("local/narrator", ModelPricing::new(1.0, 2.0));
        let cost = table.compute_cost("local/narrator", Usage::new(1_000_000, 1_000_000));
        assert!((cost - 3.0).abs() < 1e-12);
        assert_eq!(table.models(), vec!["local/narrator".to_string()]);
    }
}
