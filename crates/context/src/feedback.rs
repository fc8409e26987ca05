//! Learned tier overrides.
//!
//! Remembers which tier produced a good outcome for a complexity signature.
//! The table is bounded: once `capacity` signatures are tracked, recording a
//! new one evicts the entry with the lowest best quality (ties go to the
//! least recently updated).

use std::collections::HashMap;

use serde::Serialize;

use crate::complexity::ComplexitySignature;
use crate::tier::ContextTier;

#[derive(Debug, Clone, Serialize)]
struct FeedbackEntry {
    best: Option<(ContextTier, f32)>,
    successes: u32,
    failures: u32,
    last_update: u64,
}

impl FeedbackEntry {
    fn best_quality(&self) -> f32 {
        self.best.map(|(_, q)| q).unwrap_or(0.0)
    }
}

/// Bounded signature → best-tier table.
#[derive(Debug, Clone)]
pub struct TierFeedback {
    capacity: usize,
    min_quality: f32,
    entries: HashMap<ComplexitySignature, FeedbackEntry>,
    clock: u64,
}

impl TierFeedback {
    pub fn new(capacity: usize, min_quality: f32) -> Self {
        Self {
            capacity: capacity.max(1),
            min_quality: min_quality.clamp(0.0, 1.0),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    /// Record the outcome of generating with `tier`.
    ///
    /// A successful outcome with quality at least the current best replaces
    /// it. A failure on the current best tier halves its quality, so a tier
    /// that stops working falls below the threshold.
    pub fn record(
        &mut self,
        signature: &ComplexitySignature,
        tier: ContextTier,
        quality: f32,
        success: bool,
    ) {
        let quality = if quality.is_finite() {
            quality.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.clock += 1;
        let now = self.clock;

        if !self.entries.contains_key(signature) && self.entries.len() >= self.capacity {
            self.evict_one();
        }

        let entry = self
            .entries
            .entry(signature.clone())
            .or_insert_with(|| FeedbackEntry {
                best: None,
                successes: 0,
                failures: 0,
                last_update: now,
            });
        entry.last_update = now;

        if success {
            entry.successes += 1;
            if entry.best.is_none_or(|(_, best_q)| quality >= best_q) {
                entry.best = Some((tier, quality));
            }
        } else {
            entry.failures += 1;
            if let Some((best_tier, best_q)) = entry.best
                && best_tier == tier
            {
                entry.best = Some((best_tier, best_q / 2.0));
            }
        }
    }

    /// Tier of the best successful outcome, if it clears the quality bar.
    pub fn lookup(&self, signature: &ComplexitySignature) -> Option<ContextTier> {
        let (tier, quality) = self.entries.get(signature)?.best?;
        (quality >= self.min_quality).then_some(tier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.best_quality()
                    .total_cmp(&b.best_quality())
                    .then(a.last_update.cmp(&b.last_update))
            })
            .map(|(sig, _)| sig.clone());

        if let Some(sig) = victim {
            tracing::debug!(signature = %sig, "Evicting tier feedback entry");
            self.entries.remove(&sig);
        }
    }
}

impl Default for TierFeedback {
    fn default() -> Self {
        Self::new(256, 0.8)
    }
}
