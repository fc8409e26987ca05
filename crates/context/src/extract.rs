//! Keyword-driven extraction used by the compressor.
//!
//! None of these functions fail: when nothing matches they return fixed
//! filler values so the compressor always produces a context.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use storyloom_core::{Entity, PriorUnit};

pub const UNKNOWN_LOCATION: &str = "unknown_location";
pub const UNSPECIFIED_ERA: &str = "unspecified_era";
pub const NEUTRAL_ATMOSPHERE: &str = "neutral";

pub const DEFAULT_EVENT: &str = "story continues";
pub const DEFAULT_DEVELOPMENT: &str = "characters develop";
pub const DEFAULT_ADVANCEMENT: &str = "advance plot";
pub const DEFAULT_CONSEQUENCE: &str = "consequences unfold";

/// Longest extracted sentence kept, in bytes.
const MAX_SENTENCE_LEN: usize = 160;

static LOCATION_RE: OnceLock<Regex> = OnceLock::new();
static ERA_YEAR_RE: OnceLock<Regex> = OnceLock::new();
static SENTENCE_RE: OnceLock<Regex> = OnceLock::new();

fn location_re() -> &'static Regex {
    // "in the city of Vell", "on Kessara Station", "at Blackwater Keep"
    LOCATION_RE.get_or_init(|| {
        Regex::new(
            r"\b(?:in|on|at|near|within)\s+(?:the\s+)?(?:[a-z]+\s+of\s+)?([A-Z][\w'-]*(?:\s+(?:of\s+)?[A-Z][\w'-]*)*)",
        )
        .expect("location pattern is valid")
    })
}

fn era_year_re() -> &'static Regex {
    ERA_YEAR_RE.get_or_init(|| Regex::new(r"\b(\d{3,4})s?\b").expect("year pattern is valid"))
}

fn sentence_re() -> &'static Regex {
    SENTENCE_RE.get_or_init(|| Regex::new(r"[^.!?\n]+[.!?]*").expect("sentence pattern is valid"))
}

const LOCATION_KEYWORDS: &[&str] = &[
    "city", "village", "town", "kingdom", "empire", "forest", "desert", "mountains", "island",
    "castle", "station", "ship", "academy", "palace", "harbor", "ruins", "valley", "planet",
];

const ERA_KEYWORDS: &[(&str, &str)] = &[
    ("prehistoric", "prehistoric"),
    ("ancient", "ancient"),
    ("medieval", "medieval"),
    ("renaissance", "renaissance"),
    ("victorian", "victorian"),
    ("steampunk", "victorian"),
    ("modern", "contemporary"),
    ("contemporary", "contemporary"),
    ("present-day", "contemporary"),
    ("near-future", "near_future"),
    ("future", "future"),
    ("futuristic", "future"),
    ("post-apocalyptic", "post_apocalyptic"),
];

const ATMOSPHERE_KEYWORDS: &[(&str, &str)] = &[
    ("dark", "dark"),
    ("grim", "dark"),
    ("bleak", "dark"),
    ("eerie", "eerie"),
    ("haunted", "eerie"),
    ("tense", "tense"),
    ("hopeful", "hopeful"),
    ("bright", "hopeful"),
    ("whimsical", "whimsical"),
    ("melancholy", "melancholy"),
    ("romantic", "romantic"),
    ("chaotic", "chaotic"),
    ("peaceful", "peaceful"),
];

const EVENT_TRIGGERS: &[&str] = &[
    "arrive", "discover", "find", "found", "meet", "met", "attack", "escape", "fight", "fought",
    "reveal", "kill", "die", "died", "lose", "lost", "win", "won", "travel", "betray",
];
const DEVELOPMENT_TRIGGERS: &[&str] = &[
    "realize", "realise", "learn", "decide", "feel", "felt", "understand", "trust", "fear",
    "doubt", "promise", "admit", "forgive", "grow",
];
const ADVANCEMENT_TRIGGERS: &[&str] = &[
    "plan", "quest", "mission", "secret", "clue", "key", "map", "goal", "journey", "prepare",
];
const CONSEQUENCE_TRIGGERS: &[&str] = &[
    "therefore", "so ", "as a result", "because", "now ", "must", "forced", "leaves", "left",
    "cost", "consequence",
];

/// Fixed-field digest of a free-text setting description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactSetting {
    pub location: String,
    pub era: String,
    pub atmosphere: String,
}

impl CompactSetting {
    pub fn extract(setting: &str) -> Self {
        Self {
            location: extract_location(setting),
            era: extract_era(setting),
            atmosphere: extract_atmosphere(setting),
        }
    }
}

fn extract_location(setting: &str) -> String {
    if let Some(caps) = location_re().captures(setting)
        && let Some(m) = caps.get(1)
    {
        return m.as_str().trim().to_string();
    }
    let lower = setting.to_lowercase();
    LOCATION_KEYWORDS
        .iter()
        .find(|kw| contains_word(&lower, kw))
        .map(|kw| (*kw).to_string())
        .unwrap_or_else(|| UNKNOWN_LOCATION.to_string())
}

fn extract_era(setting: &str) -> String {
    let lower = setting.to_lowercase();
    if let Some((_, era)) = ERA_KEYWORDS.iter().find(|(kw, _)| lower.contains(kw)) {
        return (*era).to_string();
    }
    era_year_re()
        .captures(setting)
        .and_then(|caps| caps.get(1))
        .map(|m| format!("year_{}", m.as_str()))
        .unwrap_or_else(|| UNSPECIFIED_ERA.to_string())
}

fn extract_atmosphere(setting: &str) -> String {
    let lower = setting.to_lowercase();
    ATMOSPHERE_KEYWORDS
        .iter()
        .find(|(kw, _)| contains_word(&lower, kw))
        .map(|(_, mood)| (*mood).to_string())
        .unwrap_or_else(|| NEUTRAL_ATMOSPHERE.to_string())
}

/// Whole-word, already-lowercased containment check.
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .any(|w| w == word)
}

/// Pick up to `limit` entities relevant to the plan.
///
/// Entities named in the plan text win, in state order; when none are
/// named, the first `limit` known entities are used.
pub fn select_entities<'a>(entities: &'a [Entity], plan_text: &str, limit: usize) -> Vec<&'a Entity> {
    if limit == 0 {
        return Vec::new();
    }
    let lower = plan_text.to_lowercase();
    let named: Vec<&Entity> = entities
        .iter()
        .filter(|e| !e.name.trim().is_empty() && lower.contains(&e.name.trim().to_lowercase()))
        .take(limit)
        .collect();
    if !named.is_empty() {
        return named;
    }
    entities.iter().take(limit).collect()
}

/// One-line digest of a prior unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedUnit {
    pub number: u32,
    pub event: String,
    pub development: String,
    pub advancement: String,
    pub consequence: String,
}

impl CompressedUnit {
    /// Fields in a fixed order, for budget trimming.
    pub(crate) fn fields_mut(&mut self) -> [&mut String; 4] {
        [
            &mut self.event,
            &mut self.development,
            &mut self.advancement,
            &mut self.consequence,
        ]
    }
}

/// Compress a prior unit by keyword-triggered sentence selection.
///
/// The event falls back to the first sentence, the consequence to the last;
/// everything else falls back to filler.
pub fn compress_unit(unit: &PriorUnit) -> CompressedUnit {
    let sentences: Vec<&str> = sentence_re()
        .find_iter(&unit.text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect();

    let pick = |triggers: &[&str], skip: &[Option<usize>]| -> Option<usize> {
        sentences.iter().enumerate().position(|(i, s)| {
            if skip.contains(&Some(i)) {
                return false;
            }
            let lower = s.to_lowercase();
            triggers.iter().any(|t| lower.contains(t))
        })
    };

    let event_idx = pick(EVENT_TRIGGERS, &[]).or((!sentences.is_empty()).then_some(0));
    let development_idx = pick(DEVELOPMENT_TRIGGERS, &[event_idx]);
    let advancement_idx = pick(ADVANCEMENT_TRIGGERS, &[event_idx, development_idx]);
    let consequence_idx = pick(CONSEQUENCE_TRIGGERS, &[event_idx, development_idx, advancement_idx])
        .or_else(|| {
            let last = sentences.len().checked_sub(1)?;
            (Some(last) != event_idx).then_some(last)
        });

    let text_at = |idx: Option<usize>, fallback: &str| {
        idx.and_then(|i| sentences.get(i))
            .map(|s| truncate(s, MAX_SENTENCE_LEN))
            .unwrap_or_else(|| fallback.to_string())
    };

    CompressedUnit {
        number: unit.number,
        event: text_at(event_idx, DEFAULT_EVENT),
        development: text_at(development_idx, DEFAULT_DEVELOPMENT),
        advancement: text_at(advancement_idx, DEFAULT_ADVANCEMENT),
        consequence: text_at(consequence_idx, DEFAULT_CONSEQUENCE),
    }
}

/// Truncate at a char boundary, never exceeding `max` bytes.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].trim_end().to_string()
}
