//! Narrative state and unit plans.
//!
//! `NarrativeState` is everything known about the work so far; `UnitPlan`
//! describes the next unit (chapter) to generate. The context compressor
//! turns the pair into a bounded prompt context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::complexity::ChapterComplexity;

/// A character or other tracked entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entity {
    pub name: String,

    /// Narrative role (protagonist, mentor, antagonist, ...)
    pub role: String,

    /// What the entity currently wants
    pub goal: String,

    pub traits: Vec<String>,

    pub emotional_state: String,

    /// Other entity name → relationship label
    pub relationships: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A previously generated unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorUnit {
    pub number: u32,
    pub title: String,
    /// Summary or full text of the unit
    pub text: String,
}

/// Accumulated narrative state of a work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeState {
    pub genre: String,

    /// Free-text setting description
    pub setting: String,

    /// Protagonist name; falls back to the first entity when empty
    pub protagonist: String,

    pub central_conflict: String,

    pub entities: Vec<Entity>,

    /// Prior units, oldest first
    pub prior_units: Vec<PriorUnit>,
}

impl NarrativeState {
    /// The protagonist's name, falling back to the first known entity.
    pub fn protagonist_name(&self) -> Option<&str> {
        if !self.protagonist.trim().is_empty() {
            return Some(self.protagonist.trim());
        }
        self.entities
            .iter()
            .find(|e| e.role.eq_ignore_ascii_case("protagonist"))
            .or_else(|| self.entities.first())
            .map(|e| e.name.as_str())
    }
}

/// The plan for the unit about to be generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitPlan {
    pub number: u32,
    pub title: String,
    pub summary: String,
    pub goals: Vec<String>,
    pub complexity: ChapterComplexity,
}

impl UnitPlan {
    /// All free text of the plan, used for entity-name matching.
    pub fn text(&self) -> String {
        let mut text = String::with_capacity(
            self.title.len() + self.summary.len() + self.goals.iter().map(String::len).sum::<usize>() + 8,
        );
        text.push_str(&self.title);
        text.push('\n');
        text.push_str(&self.summary);
        for goal in &self.goals {
            text.push('\n');
            text.push_str(goal);
        }
        text
    }
}
