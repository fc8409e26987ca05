//! Adaptive context optimization for StoryLoom.
//!
//! Decides how much narrative context a unit needs and builds a
//! token-bounded representation of it.
//!
//! # Pipeline
//!
//! | Step | Type | Output |
//! |------|------|--------|
//! | 1. Score the plan's complexity flags | [`ComplexityAnalyzer`] | [`TierDecision`] |
//! | 2. Optionally override from past outcomes | [`TierFeedback`] | learned [`ContextTier`] |
//! | 3. Compress the narrative state for the tier | [`ContextCompressor`] | [`OptimizedContext`] |
//!
//! Every step is a pure function of its inputs (and the feedback table's
//! current state), so identical inputs produce byte-identical contexts.

pub mod complexity;
pub mod compressor;
pub mod extract;
pub mod feedback;
pub mod tier;
pub mod token;

pub use complexity::{ComplexityAnalyzer, ComplexitySignature, TierDecision, TierSource};
pub use compressor::{
    ActiveEntity, CompressionReport, ContextCompressor, CoreFacts, OptimizedContext,
};
pub use extract::{CompactSetting, CompressedUnit};
pub use feedback::TierFeedback;
pub use tier::ContextTier;
pub use token::{CharRatioEstimator, TokenEstimator, estimate_tokens};
