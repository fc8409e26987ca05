//! Per-content-type reuse policy.
//!
//! | Content type | Reuse score | Similarity threshold | TTL |
//! |--------------|-------------|----------------------|-----|
//! | theme_analysis | 9 | 0.60 | 30 days |
//! | world_building | 8 | 0.65 | 30 days |
//! | character_profile | 7 | 0.70 | 14 days |
//! | story_foundation | 6 | 0.75 | 7 days |
//! | chapter_outline | 4 | 0.85 | 3 days |
//! | summary | 3 | 0.90 | 3 days |
//! | chapter_content | 2 | 0.95 | 1 day |
//!
//! Generic content is reused at lower similarity; tightly coupled content
//! needs a near match. Thresholds and TTLs can be overridden per type.

use std::collections::HashMap;

use chrono::Duration;
use serde::Serialize;
use storyloom_core::ContentType;

/// TTL overrides are capped at 100 years.
const MAX_TTL_HOURS: u64 = 24 * 365 * 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContentPolicy {
    /// 0–10
    pub reuse_score: f32,
    /// Minimum similarity for an adapted hit
    pub threshold: f64,
    #[serde(serialize_with = "serialize_hours")]
    pub ttl: Duration,
}

fn serialize_hours<S: serde::Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(ttl.num_hours())
}

impl ContentPolicy {
    pub fn default_for(content_type: ContentType) -> Self {
        let (reuse_score, threshold, days) = match content_type {
            ContentType::ThemeAnalysis => (9.0, 0.60, 30),
            ContentType::WorldBuilding => (8.0, 0.65, 30),
            ContentType::CharacterProfile => (7.0, 0.70, 14),
            ContentType::StoryFoundation => (6.0, 0.75, 7),
            ContentType::ChapterOutline => (4.0, 0.85, 3),
            ContentType::Summary => (3.0, 0.90, 3),
            ContentType::ChapterContent => (2.0, 0.95, 1),
        };
        Self {
            reuse_score,
            threshold,
            ttl: Duration::days(days),
        }
    }
}

/// Policy for every content type, with overrides applied.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<ContentType, ContentPolicy>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self {
            policies: ContentType::ALL
                .into_iter()
                .map(|ct| (ct, ContentPolicy::default_for(ct)))
                .collect(),
        }
    }

    /// Apply configuration overrides keyed by content type tag.
    /// Unknown tags are logged and ignored.
    pub fn with_overrides(
        mut self,
        thresholds: &HashMap<String, f32>,
        ttl_hours: &HashMap<String, u64>,
    ) -> Self {
        for (tag, threshold) in thresholds {
            match ContentType::parse(tag) {
                Some(ct) => self.set_threshold(ct, f64::from(*threshold)),
                None => tracing::warn!(content_type = %tag, "Ignoring threshold for unknown content type"),
            }
        }
        for (tag, hours) in ttl_hours {
            match ContentType::parse(tag) {
                Some(ct) => self.set_ttl(ct, Duration::hours((*hours).min(MAX_TTL_HOURS) as i64)),
                None => tracing::warn!(content_type = %tag, "Ignoring TTL for unknown content type"),
            }
        }
        self
    }

    pub fn get(&self, content_type: ContentType) -> ContentPolicy {
        self.policies
            .get(&content_type)
            .copied()
            .unwrap_or_else(|| ContentPolicy::default_for(content_type))
    }

    pub fn set_threshold(&mut self, content_type: ContentType, threshold: f64) {
        let mut policy = self.get(content_type);
        policy.threshold = threshold.clamp(0.0, 1.0);
        self.policies.insert(content_type, policy);
    }

    pub fn set_ttl(&mut self, content_type: ContentType, ttl: Duration) {
        let mut policy = self.get(content_type);
        policy.ttl = ttl;
        self.policies.insert(content_type, policy);
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::new()
    }
}
