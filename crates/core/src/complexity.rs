//! Complexity flags attached to a unit plan.
//!
//! These are the raw signals the complexity analyzer weighs when deciding
//! how much narrative context a unit needs. They are derived per request and
//! never persisted.

use serde::{Deserialize, Serialize};

/// How emotionally charged a unit is (weight 1–3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionalIntensity {
    #[default]
    Low,
    Medium,
    High,
}

impl EmotionalIntensity {
    pub fn weight(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

/// Level of conflict in a unit (weight 1–5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictLevel {
    #[default]
    Minimal,
    Low,
    Moderate,
    High,
    Climactic,
}

impl ConflictLevel {
    pub fn weight(self) -> u32 {
        match self {
            Self::Minimal => 1,
            Self::Low => 2,
            Self::Moderate => 3,
            Self::High => 4,
            Self::Climactic => 5,
        }
    }
}

/// Generic 1–3 intensity scale for scene, dialogue and action density.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intensity {
    #[default]
    Low,
    Medium,
    High,
}

impl Intensity {
    pub fn weight(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }
}

/// Complexity signals for one chapter / work unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterComplexity {
    /// Introduces entities the reader has not met yet
    pub has_new_entities: bool,

    /// A plot turning point
    pub is_turning_point: bool,

    /// The climax (or a climactic moment) of the work
    pub is_climactic_moment: bool,

    /// Needs setting / world-building exposition
    pub needs_world_building: bool,

    pub emotional_intensity: EmotionalIntensity,

    pub conflict_level: ConflictLevel,

    /// Number of entities active in the unit
    pub entity_count: u32,

    pub scene_intensity: Intensity,

    pub dialogue_intensity: Intensity,

    pub action_intensity: Intensity,

    /// 0–5; values above 5 are clamped when scored
    pub narrative_importance: u8,
}

impl ChapterComplexity {
    /// The climax of the work: maximal conflict at a climactic moment.
    pub fn is_climax(&self) -> bool {
        self.is_climactic_moment && self.conflict_level == ConflictLevel::Climactic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_are_minimal() {
        let c = ChapterComplexity::default();
        assert!(!c.is_climax());
        assert_eq!(c.conflict_level.weight(), 1);
        assert_eq!(c.emotional_intensity.weight(), 1);
    }

    #[test]
    fn deserializes_partial_flags() {
        let c: ChapterComplexity = serde_json::from_str(
            r#"{"is_climactic_moment":true,"conflict_level":"climactic"}"#,
        )
        .unwrap();
        assert!(c.is_climax());
        assert_eq!(c.entity_count, 0);
    }
}
