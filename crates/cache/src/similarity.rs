//! Similarity over feature tag sets.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use storyloom_core::CacheRecord;

use crate::key::sha256_hex;

fn tag_set(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|` of two tag sets, case-insensitive.
///
/// Two empty sets share no evidence and score 0.0.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a = tag_set(a);
    let b = tag_set(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Stable hash of a tag set; equal sets hash equally regardless of order.
pub fn similarity_hash(tags: &[String]) -> String {
    let joined = tag_set(tags).into_iter().collect::<Vec<_>>().join("\u{1f}");
    sha256_hex(&joined)[..16].to_string()
}

/// A candidate with its similarity to the requested features.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: CacheRecord,
    pub similarity: f64,
}

/// Rank candidates by similarity, then hit count, then reuse score.
/// Remaining ties fall back to record id so the order is total.
pub fn rank(candidates: Vec<CacheRecord>, features: &[String]) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = candidates
        .into_iter()
        .map(|record| ScoredRecord {
            similarity: jaccard(&record.tags, features),
            record,
        })
        .collect();
    scored.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then(b.record.hit_count.cmp(&a.record.hit_count))
            .then(
                b.record
                    .reuse_score
                    .partial_cmp(&a.record.reuse_score)
                    .unwrap_or(Ordering::Equal),
            )
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{Map, Value};
    use storyloom_core::ContentType;

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn record(id: &str, t: &[&str], hits: u64, reuse: f32) -> CacheRecord {
        let now = Utc::now();
        CacheRecord {
            id: id.into(),
            content_type: ContentType::ThemeAnalysis,
            owner_id: "u".into(),
            content: Value::Null,
            metadata: Map::new(),
            tags: tags(t),
            fingerprint: format!("fp-{id}"),
            dependency_fingerprint: None,
            similarity_hash: similarity_hash(&tags(t)),
            reuse_score: reuse,
            hit_count: hits,
            cost: 0.0,
            created_at: now,
            last_accessed: now,
            expires_at: now,
        }
    }

    #[test]
    fn jaccard_basics() {
        assert_eq!(jaccard(&tags(&["a", "b"]), &tags(&["A", "b "])), 1.0);
        assert_eq!(jaccard(&tags(&["a"]), &tags(&["b"])), 0.0);
        assert_eq!(jaccard(&[], &[]), 0.0);
        let sim = jaccard(
            &tags(&["1", "2", "3", "4", "5", "6", "7"]),
            &tags(&["1", "2", "3", "4", "5", "6", "7", "8", "9", "10"]),
        );
        assert!((sim - 0.7).abs() < 1e-12);
    }

    #[test]
    fn hash_ignores_order_and_case() {
        assert_eq!(similarity_hash(&tags(&["War", "loss"])), similarity_hash(&tags(&["loss", "war"])));
        assert_ne!(similarity_hash(&tags(&["war"])), similarity_hash(&tags(&["peace"])));
    }

    #[test]
    fn ranking_uses_hits_then_reuse_as_tie_breakers() {
        let features = tags(&["war", "loss"]);
        let ranked = rank(
            vec![
                record("low", &["war"], 0, 9.0),
                record("popular", &["war", "loss"], 5, 1.0),
                record("reusable", &["war", "loss"], 5, 8.0),
                record("fresh", &["war", "loss"], 0, 9.0),
            ],
            &features,
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.record.id.as_str()).collect();
        assert_eq!(ids, vec!["reusable", "popular", "fresh", "low"]);
        assert_eq!(ranked[0].similarity, 1.0);
        assert_eq!(ranked[3].similarity, 0.5);
    }
}
