//! Context Compressor: builds a token-bounded snapshot of narrative state.
//!
//! | Tier | Core facts | Entities | Prior units | Goals |
//! |------|-----------|----------|-------------|-------|
//! | Minimal | protagonist | - | - | first |
//! | Standard | all | ≤2, goal/emotion/first trait | last 1 | all |
//! | Detailed | all | ≤3, all traits | last 2 | all |
//! | Full | all | ≤3, traits + relationships | last 3 | all |
//!
//! After assembly the serialized context is measured with the injected
//! [`TokenEstimator`]. While it exceeds the tier budget the compressor drops
//! the oldest prior unit, then the last entity, then surplus goals, and
//! finally halves the longest text field. Compression never fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use storyloom_core::{Entity, NarrativeState, UnitPlan};

use crate::extract::{self, CompactSetting, CompressedUnit, DEFAULT_ADVANCEMENT};
use crate::tier::ContextTier;
use crate::token::{CharRatioEstimator, TokenEstimator};

const DEFAULT_PROTAGONIST: &str = "protagonist";

/// Invariant facts about the work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreFacts {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub genre: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setting: Option<CompactSetting>,
    pub protagonist: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub central_conflict: String,
}

/// An entity as it appears in a compressed context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEntity {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub goal: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub emotion: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traits: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, String>,
}

/// Tiered, bounded-size prompt context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizedContext {
    pub tier: ContextTier,
    pub core: CoreFacts,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<ActiveEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_units: Vec<CompressedUnit>,
    pub goals: Vec<String>,
}

impl OptimizedContext {
    /// The prompt section text. Serialization is deterministic: field order
    /// is fixed and relationships are sorted.
    pub fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn text_fields_mut(&mut self) -> Vec<&mut String> {
        let mut fields: Vec<&mut String> = vec![
            &mut self.core.genre,
            &mut self.core.protagonist,
            &mut self.core.central_conflict,
        ];
        if let Some(setting) = self.core.setting.as_mut() {
            fields.push(&mut setting.location);
            fields.push(&mut setting.era);
            fields.push(&mut setting.atmosphere);
        }
        for entity in &mut self.entities {
            fields.push(&mut entity.name);
            fields.push(&mut entity.role);
            fields.push(&mut entity.goal);
            fields.push(&mut entity.emotion);
            fields.extend(entity.traits.iter_mut());
            fields.extend(entity.relationships.values_mut());
        }
        for unit in &mut self.prior_units {
            fields.extend(unit.fields_mut());
        }
        fields.extend(self.goals.iter_mut());
        fields
    }

    /// Halve the longest text field. Returns false when every field is empty.
    fn halve_longest_field(&mut self) -> bool {
        let mut fields = self.text_fields_mut();
        // first of equal-length fields wins, so trimming is deterministic
        let mut longest: Option<usize> = None;
        for (i, f) in fields.iter().enumerate() {
            if longest.is_none_or(|j| f.len() > fields[j].len()) {
                longest = Some(i);
            }
        }
        match longest {
            Some(i) if !fields[i].is_empty() => {
                let halved = extract::truncate(fields[i].as_str(), fields[i].len() / 2);
                *fields[i] = halved;
                true
            }
            _ => false,
        }
    }
}

/// Before/after size of a compression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionReport {
    pub tier: ContextTier,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// compressed / original, 0.0 when the original is empty
    pub ratio: f64,
    pub saved_tokens: usize,
}

impl std::fmt::Display for CompressionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} → {} tokens ({:.1}% of original, {} saved)",
            self.tier,
            self.original_tokens,
            self.compressed_tokens,
            self.ratio * 100.0,
            self.saved_tokens
        )
    }
}

/// Deterministic context builder.
#[derive(Clone)]
pub struct ContextCompressor {
    estimator: Arc<dyn TokenEstimator>,
}

impl ContextCompressor {
    pub fn new() -> Self {
        Self::with_estimator(Arc::new(CharRatioEstimator::default()))
    }

    pub fn with_estimator(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.estimator.estimate(text)
    }

    /// Build the context for `plan` at `tier`, trimmed to the tier budget.
    pub fn compress(
        &self,
        tier: ContextTier,
        state: &NarrativeState,
        plan: &UnitPlan,
    ) -> OptimizedContext {
        let mut ctx = match tier {
            ContextTier::Minimal => minimal_context(state, plan),
            _ => tiered_context(tier, state, plan),
        };
        self.fit_to_budget(&mut ctx);
        ctx
    }

    /// Compress and report the before/after token counts.
    pub fn compress_with_report(
        &self,
        tier: ContextTier,
        state: &NarrativeState,
        plan: &UnitPlan,
    ) -> (OptimizedContext, CompressionReport) {
        let ctx = self.compress(tier, state, plan);
        let report = self.report(state, plan, &ctx);
        (ctx, report)
    }

    pub fn report(
        &self,
        state: &NarrativeState,
        plan: &UnitPlan,
        ctx: &OptimizedContext,
    ) -> CompressionReport {
        let original = serde_json::to_string(state).unwrap_or_default()
            + &serde_json::to_string(&plan.goals).unwrap_or_default();
        let original_tokens = self.estimator.estimate(&original);
        let compressed_tokens = self.estimator.estimate(&ctx.render());
        let ratio = if original_tokens == 0 {
            0.0
        } else {
            compressed_tokens as f64 / original_tokens as f64
        };
        CompressionReport {
            tier: ctx.tier,
            original_tokens,
            compressed_tokens,
            ratio,
            saved_tokens: original_tokens.saturating_sub(compressed_tokens),
        }
    }

    fn fits(&self, ctx: &OptimizedContext) -> bool {
        self.estimator.estimate(&ctx.render()) <= ctx.tier.token_budget()
    }

    fn fit_to_budget(&self, ctx: &mut OptimizedContext) {
        let mut steps = 0usize;
        while !self.fits(ctx) {
            steps += 1;
            if !ctx.prior_units.is_empty() {
                ctx.prior_units.remove(0);
            } else if !ctx.entities.is_empty() {
                ctx.entities.pop();
            } else if ctx.goals.len() > 1 {
                ctx.goals.pop();
            } else if !ctx.halve_longest_field() {
                break;
            }
        }
        if steps > 0 {
            tracing::debug!(
                tier = %ctx.tier,
                steps,
                fits = self.fits(ctx),
                "Trimmed context to budget"
            );
        }
    }
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCompressor").finish_non_exhaustive()
    }
}

fn protagonist(state: &NarrativeState) -> String {
    state
        .protagonist_name()
        .filter(|n| !n.is_empty())
        .unwrap_or(DEFAULT_PROTAGONIST)
        .to_string()
}

fn goals(plan: &UnitPlan) -> Vec<String> {
    let goals: Vec<String> = plan
        .goals
        .iter()
        .map(|g| g.trim())
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect();
    if goals.is_empty() {
        vec![DEFAULT_ADVANCEMENT.to_string()]
    } else {
        goals
    }
}

fn minimal_context(state: &NarrativeState, plan: &UnitPlan) -> OptimizedContext {
    OptimizedContext {
        tier: ContextTier::Minimal,
        core: CoreFacts {
            protagonist: protagonist(state),
            ..Default::default()
        },
        entities: Vec::new(),
        prior_units: Vec::new(),
        goals: goals(plan).into_iter().take(1).collect(),
    }
}

fn tiered_context(tier: ContextTier, state: &NarrativeState, plan: &UnitPlan) -> OptimizedContext {
    let core = CoreFacts {
        genre: state.genre.trim().to_string(),
        setting: Some(CompactSetting::extract(&state.setting)),
        protagonist: protagonist(state),
        central_conflict: state.central_conflict.trim().to_string(),
    };

    let entities = extract::select_entities(&state.entities, &plan.text(), tier.max_entities())
        .into_iter()
        .map(|e| active_entity(tier, e))
        .collect();

    let keep = tier.max_prior_units();
    let skip = state.prior_units.len().saturating_sub(keep);
    let prior_units = state.prior_units[skip..]
        .iter()
        .map(extract::compress_unit)
        .collect();

    OptimizedContext {
        tier,
        core,
        entities,
        prior_units,
        goals: goals(plan),
    }
}

fn active_entity(tier: ContextTier, entity: &Entity) -> ActiveEntity {
    let traits = match tier {
        ContextTier::Minimal => Vec::new(),
        ContextTier::Standard => entity.traits.iter().take(1).cloned().collect(),
        ContextTier::Detailed | ContextTier::Full => entity.traits.clone(),
    };
    let relationships = if tier == ContextTier::Full {
        entity.relationships.clone()
    } else {
        BTreeMap::new()
    };
    ActiveEntity {
        name: entity.name.clone(),
        role: entity.role.clone(),
        goal: entity.goal.clone(),
        emotion: entity.emotional_state.clone(),
        traits,
        relationships,
    }
}
