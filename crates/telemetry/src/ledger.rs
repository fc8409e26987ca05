//! Thread-safe cost ledger: what generation actually cost, and what the
//! caches saved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use storyloom_core::Usage;

/// Where a saving came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavingsSource {
    /// Hot (in-process) cache hit
    HotCache,
    /// Durable cache, exact metadata match
    DurableExact,
    /// Durable cache, similar record adapted
    DurableAdapted,
    /// Duplicate request served by an in-flight leader
    SingleFlight,
}

/// Point-in-time cost summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub since: Option<DateTime<Utc>>,
    /// Real spend in USD
    pub spent_usd: f64,
    pub generation_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Estimated spend avoided, in USD
    pub saved_usd: f64,
    pub saved_hot_usd: f64,
    pub saved_durable_usd: f64,
    pub saved_adapted_usd: f64,
    pub saved_single_flight_usd: f64,
    /// Requests answered without a generation call
    pub reused_results: u64,
}

impl CostSummary {
    /// Fraction of the would-be spend that was avoided.
    pub fn savings_ratio(&self) -> f64 {
        let total = self.spent_usd + self.saved_usd;
        if total <= 0.0 { 0.0 } else { self.saved_usd / total }
    }
}

/// Accumulates spend and savings.
pub struct CostLedger {
    summary: Mutex<CostSummary>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self {
            summary: Mutex::new(CostSummary {
                since: Some(Utc::now()),
                ..Default::default()
            }),
        }
    }

    /// Record a paid generation call.
    pub fn record_generation(&self, usage: Usage, cost: f64) {
        let mut s = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        s.spent_usd += cost;
        s.generation_calls += 1;
        s.input_tokens += usage.input_tokens as u64;
        s.output_tokens += usage.output_tokens as u64;
    }

    /// Record a request served without a generation call.
    pub fn record_saving(&self, source: SavingsSource, saved_usd: f64) {
        let saved = saved_usd.max(0.0);
        let mut s = self.summary.lock().unwrap_or_else(PoisonError::into_inner);
        s.reused_results += 1;
        s.saved_usd += saved;
        match source {
            SavingsSource::HotCache => s.saved_hot_usd += saved,
            SavingsSource::DurableExact => s.saved_durable_usd += saved,
            SavingsSource::DurableAdapted => s.saved_adapted_usd += saved,
            SavingsSource::SingleFlight => s.saved_single_flight_usd += saved,
        }
        tracing::debug!(?source, saved_usd = saved, "Recorded cache saving");
    }

    pub fn summary(&self) -> CostSummary {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for CostLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spend_and_savings_accumulate() {
        let ledger = CostLedger::new();
        ledger.record_generation(Usage::new(100, 50), 0.02);
        ledger.record_generation(Usage::new(10, 5), 0.01);
        ledger.record_saving(SavingsSource::HotCache, 0.02);
        ledger.record_saving(SavingsSource::DurableAdapted, 0.01);

        let s = ledger.summary();
        assert_eq!(s.generation_calls, 2);
        assert_eq!(s.input_tokens, 110);
        assert_eq!(s.output_tokens, 55);
        assert!((s.spent_usd - 0.03).abs() < 1e-12);
        assert!((s.saved_usd - 0.03).abs() < 1e-12);
        assert!((s.saved_hot_usd - 0.02).abs() < 1e-12);
        assert!((s.saved_adapted_usd - 0.01).abs() < 1e-12);
        assert_eq!(s.reused_results, 2);
        assert!((s.savings_ratio() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn negative_savings_clamped() {
        let ledger = CostLedger::new();
        ledger.record_saving(SavingsSource::SingleFlight, -1.0);
        assert_eq!(ledger.summary().saved_usd, 0.0);
    }

    #[test]
    fn empty_ledger_ratio_is_zero() {
        assert_eq!(CostLedger::new().summary().savings_ratio(), 0.0);
    }
}
