//! DurableStore trait: the persistent store behind the durable cache.
//!
//! The store is a key-value upsert/get keyed by content type, owner and a
//! metadata map. It must support a "contains metadata subset" query and an
//! atomic hit-count increment; everything smarter (similarity ranking,
//! adaptation, cascading invalidation) lives in the cache crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Kind of generated artifact held in the durable cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    StoryFoundation,
    ChapterOutline,
    ChapterContent,
    CharacterProfile,
    WorldBuilding,
    ThemeAnalysis,
    Summary,
}

impl ContentType {
    pub const ALL: [ContentType; 7] = [
        ContentType::StoryFoundation,
        ContentType::ChapterOutline,
        ContentType::ChapterContent,
        ContentType::CharacterProfile,
        ContentType::WorldBuilding,
        ContentType::ThemeAnalysis,
        ContentType::Summary,
    ];

    /// Stable tag used in storage and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoryFoundation => "story_foundation",
            Self::ChapterOutline => "chapter_outline",
            Self::ChapterContent => "chapter_content",
            Self::CharacterProfile => "character_profile",
            Self::WorldBuilding => "world_building",
            Self::ThemeAnalysis => "theme_analysis",
            Self::Summary => "summary",
        }
    }

    /// Parse a storage/config tag.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == tag)
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Derived from (content type, owner, canonical metadata)
    pub id: String,

    pub content_type: ContentType,

    pub owner_id: String,

    /// The cached payload; never edited in place after creation
    pub content: Value,

    /// Semantic metadata (genre, chapter number, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Feature tags used for similarity matching
    #[serde(default)]
    pub tags: Vec<String>,

    /// Fingerprint of this record's content
    pub fingerprint: String,

    /// Fingerprint of the upstream artifact this content was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_fingerprint: Option<String>,

    /// Hash of the sorted tag set
    pub similarity_hash: String,

    /// 0–10, how generically reusable this artifact is
    pub reuse_score: f32,

    pub hit_count: u64,

    /// What the original generation cost, in USD
    pub cost: f64,

    pub created_at: DateTime<Utc>,

    pub last_accessed: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A candidate query: type + optional owner + metadata subset.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub content_type: ContentType,

    /// `None` matches every owner
    pub owner_id: Option<String>,

    /// Records must contain every key/value of this map
    pub metadata: Map<String, Value>,

    /// Records expired at this instant are skipped
    pub now: DateTime<Utc>,
}

/// Result of a scan: decodable records plus ids of rows that failed to decode.
#[derive(Debug, Clone, Default)]
pub struct RecordScan {
    pub records: Vec<CacheRecord>,
    pub corrupt: Vec<String>,
}

/// Whether `metadata` contains every entry of `filter`.
pub fn metadata_contains(metadata: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

/// The core DurableStore trait.
///
/// Implementations: SQLite, in-memory (for tests and ephemeral runs).
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Insert a record. Returns `false` (and changes nothing) if the id exists.
    async fn insert(&self, record: CacheRecord) -> std::result::Result<bool, StoreError>;

    /// Get a record by id. Undecodable rows yield [`StoreError::Corrupt`].
    async fn get(&self, id: &str) -> std::result::Result<Option<CacheRecord>, StoreError>;

    /// Find live records of a type/owner containing the metadata subset.
    async fn find(&self, query: &RecordQuery) -> std::result::Result<RecordScan, StoreError>;

    /// Records whose `dependency_fingerprint` equals `fingerprint`.
    async fn dependents(&self, fingerprint: &str) -> std::result::Result<Vec<CacheRecord>, StoreError>;

    /// Records whose own `fingerprint` equals `fingerprint`.
    async fn by_fingerprint(&self, fingerprint: &str) -> std::result::Result<Vec<CacheRecord>, StoreError>;

    /// Atomically increment the hit count and refresh `last_accessed`.
    async fn record_hit(&self, id: &str, at: DateTime<Utc>) -> std::result::Result<bool, StoreError>;

    /// Delete a record by id.
    async fn delete(&self, id: &str) -> std::result::Result<bool, StoreError>;

    /// Delete every record expired at `now`; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> std::result::Result<usize, StoreError>;

    /// Evict up to `count` records, least valuable first
    /// (lowest `reuse_score + hit_count`, then oldest access).
    async fn evict_least_valuable(&self, count: usize) -> std::result::Result<usize, StoreError>;

    /// Total record count.
    async fn count(&self) -> std::result::Result<usize, StoreError>;

    /// Remove every record.
    async fn clear(&self) -> std::result::Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_type_tags_round_trip() {
        for ct in ContentType::ALL {
            assert_eq!(ContentType::parse(ct.as_str()), Some(ct));
        }
        assert_eq!(ContentType::parse("novel"), None);
    }

    #[test]
    fn metadata_subset_matching() {
        let meta = json!({"genre": "fantasy", "chapter": 3, "lang": "en"});
        let meta = meta.as_object().unwrap();

        let filter = json!({"genre": "fantasy", "chapter": 3});
        assert!(metadata_contains(meta, filter.as_object().unwrap()));

        let wrong = json!({"genre": "fantasy", "chapter": 4});
        assert!(!metadata_contains(meta, wrong.as_object().unwrap()));

        assert!(metadata_contains(meta, &Map::new()));
    }
}
