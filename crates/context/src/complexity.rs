//! Complexity Analyzer: scores a unit plan and selects a context tier.
//!
//! Score weights:
//!
//! | Signal | Weight |
//! |--------|--------|
//! | new entities | +2 |
//! | turning point | +3 |
//! | climactic moment | +4 |
//! | world-building | +2 |
//! | emotional intensity | 1–3 |
//! | conflict level | 1–5 |
//! | entity count | 0–4 (capped) |
//! | scene / dialogue / action intensity | 1–3 each |
//! | narrative importance | 0–5 (clamped) |
//!
//! Thresholds: `≤5` Minimal, `≤10` Standard, `≤16` Detailed, else Full.

use serde::{Deserialize, Serialize};
use storyloom_core::{ChapterComplexity, UnitPlan};

use crate::feedback::TierFeedback;
use crate::tier::ContextTier;

const MINIMAL_MAX: u32 = 5;
const STANDARD_MAX: u32 = 10;
const DETAILED_MAX: u32 = 16;

const ENTITY_COUNT_CAP: u32 = 4;
const IMPORTANCE_CAP: u8 = 5;

/// Why a tier was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierSource {
    /// Straight from the score thresholds
    Computed,
    /// Climax plans always get the full tier
    Forced,
    /// Overridden by a prior high-quality outcome
    Learned,
}

/// Coarse key over the complexity flags, used by the feedback table.
///
/// Entity count and importance are bucketed so that plans differing only
/// slightly share learned outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComplexitySignature(String);

impl ComplexitySignature {
    pub fn of(c: &ChapterComplexity) -> Self {
        let flag = |b: bool| if b { '1' } else { '0' };
        let entities = match c.entity_count {
            0..=1 => "few",
            2..=3 => "some",
            _ => "many",
        };
        let importance = match c.narrative_importance {
            0..=1 => "low",
            2..=3 => "mid",
            _ => "high",
        };
        Self(format!(
            "{}{}{}{}:e{}:c{}:{}:{}",
            flag(c.has_new_entities),
            flag(c.is_turning_point),
            flag(c.is_climactic_moment),
            flag(c.needs_world_building),
            c.emotional_intensity.weight(),
            c.conflict_level.weight(),
            entities,
            importance,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComplexitySignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of tier selection for one plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDecision {
    pub tier: ContextTier,
    pub score: u32,
    pub source: TierSource,
    pub signature: ComplexitySignature,
}

/// Stateless scorer. Learned state lives in [`TierFeedback`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Weighted integer score of the complexity flags.
    pub fn score(&self, c: &ChapterComplexity) -> u32 {
        let mut score = 0;
        if c.has_new_entities {
            score += 2;
        }
        if c.is_turning_point {
            score += 3;
        }
        if c.is_climactic_moment {
            score += 4;
        }
        if c.needs_world_building {
            score += 2;
        }
        score += c.emotional_intensity.weight();
        score += c.conflict_level.weight();
        score += c.entity_count.min(ENTITY_COUNT_CAP);
        score += c.scene_intensity.weight();
        score += c.dialogue_intensity.weight();
        score += c.action_intensity.weight();
        score += u32::from(c.narrative_importance.min(IMPORTANCE_CAP));
        score
    }

    pub fn tier_for_score(score: u32) -> ContextTier {
        match score {
            0..=MINIMAL_MAX => ContextTier::Minimal,
            s if s <= STANDARD_MAX => ContextTier::Standard,
            s if s <= DETAILED_MAX => ContextTier::Detailed,
            _ => ContextTier::Full,
        }
    }

    /// Tier from the score alone (climax still forced to Full).
    pub fn analyze(&self, plan: &UnitPlan) -> TierDecision {
        self.decide(plan, None)
    }

    /// Tier selection with the learned override consulted.
    ///
    /// Order of precedence: climax → learned → computed.
    pub fn select_tier(&self, plan: &UnitPlan, feedback: &TierFeedback) -> TierDecision {
        self.decide(plan, Some(feedback))
    }

    fn decide(&self, plan: &UnitPlan, feedback: Option<&TierFeedback>) -> TierDecision {
        let c = &plan.complexity;
        let score = self.score(c);
        let signature = ComplexitySignature::of(c);

        let (tier, source) = if c.is_climax() {
            (ContextTier::Full, TierSource::Forced)
        } else if let Some(learned) = feedback.and_then(|f| f.lookup(&signature)) {
            (learned, TierSource::Learned)
        } else {
            (Self::tier_for_score(score), TierSource::Computed)
        };

        tracing::debug!(
            unit = plan.number,
            score,
            %tier,
            ?source,
            %signature,
            "Selected context tier"
        );

        TierDecision {
            tier,
            score,
            source,
            signature,
        }
    }
}
