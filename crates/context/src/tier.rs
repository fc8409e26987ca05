//! Context tiers and their token budgets.

use serde::{Deserialize, Serialize};

/// How much narrative context to send with a request.
///
/// Ordered: `Minimal < Standard < Detailed < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Minimal,
    Standard,
    Detailed,
    Full,
}

impl ContextTier {
    pub const ALL: [ContextTier; 4] = [
        ContextTier::Minimal,
        ContextTier::Standard,
        ContextTier::Detailed,
        ContextTier::Full,
    ];

    /// Maximum estimated tokens of the serialized context.
    pub fn token_budget(self) -> usize {
        match self {
            Self::Minimal => 100,
            Self::Standard => 200,
            Self::Detailed => 400,
            Self::Full => 800,
        }
    }

    /// Entities included at this tier.
    pub(crate) fn max_entities(self) -> usize {
        match self {
            Self::Minimal => 0,
            Self::Standard => 2,
            Self::Detailed | Self::Full => 3,
        }
    }

    /// Prior units summarized at this tier.
    pub(crate) fn max_prior_units(self) -> usize {
        match self {
            Self::Minimal => 0,
            Self::Standard => 1,
            Self::Detailed => 2,
            Self::Full => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Standard => "standard",
            Self::Detailed => "detailed",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for ContextTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
