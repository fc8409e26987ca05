//! Durable cache: exact and similarity-ranked lookup over a [`DurableStore`].
//!
//! Lookup policy, in order:
//!
//! 1. exact `(type, owner, metadata)` match: full reuse, full saving
//! 2. best similar candidate at or above the type's threshold: an adapted
//!    shallow copy with caller-supplied fields overwritten, partial saving
//! 3. miss
//!
//! Every returned record has its hit count incremented. Stored content is
//! never edited; adaptation works on a copy. Records that fail to decode
//! are deleted and the lookup carries on as if they were absent.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use storyloom_core::{CacheRecord, ContentType, DurableStore, RecordQuery, StoreError};

use crate::key;
use crate::policy::PolicyTable;
use crate::similarity::{self, ScoredRecord};

/// Adapted hits never count as more than this fraction of the original cost.
pub const MAX_ADAPTED_SAVING: f64 = 0.9;

/// What a work item would be stored under in the durable cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableDescriptor {
    pub content_type: ContentType,

    pub owner_id: String,

    /// Semantic metadata; an exact hit needs an identical map
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Feature tags used for similarity matching
    #[serde(default)]
    pub tags: Vec<String>,

    /// Metadata subset similar candidates must share
    #[serde(default)]
    pub candidate_filter: Map<String, Value>,

    /// Top-level fields overwritten on an adapted copy (title, ids, ...)
    #[serde(default)]
    pub adapt_fields: Map<String, Value>,

    /// Fingerprint of the upstream artifact this content depends on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_fingerprint: Option<String>,

    /// Also consider other owners' records for similar matches
    #[serde(default)]
    pub shared: bool,
}

impl DurableDescriptor {
    pub fn new(content_type: ContentType, owner_id: impl Into<String>) -> Self {
        Self {
            content_type,
            owner_id: owner_id.into(),
            metadata: Map::new(),
            tags: Vec::new(),
            candidate_filter: Map::new(),
            adapt_fields: Map::new(),
            dependency_fingerprint: None,
            shared: false,
        }
    }

    pub fn record_id(&self) -> String {
        key::record_id(self.content_type, &self.owner_id, &self.metadata)
    }
}

/// Result of a durable lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum DurableLookup {
    Exact {
        record: CacheRecord,
        saved: f64,
    },
    Adapted {
        /// The stored record the copy was made from
        source: CacheRecord,
        content: Value,
        similarity: f64,
        saved: f64,
    },
    Miss,
}

impl DurableLookup {
    pub fn is_hit(&self) -> bool {
        !matches!(self, Self::Miss)
    }

    /// Payload to hand back to the caller, if any.
    pub fn content(&self) -> Option<&Value> {
        match self {
            Self::Exact { record, .. } => Some(&record.content),
            Self::Adapted { content, .. } => Some(content),
            Self::Miss => None,
        }
    }

    pub fn saved(&self) -> f64 {
        match self {
            Self::Exact { saved, .. } | Self::Adapted { saved, .. } => *saved,
            Self::Miss => 0.0,
        }
    }
}

/// Shallow copy of `content` with `fields` overwritten at the top level.
///
/// Generated text is stored verbatim as a string; when it holds a JSON
/// object and there is something to overwrite, the adapted copy is
/// re-rendered. Anything else is returned unchanged.
pub fn adapt_payload(content: &Value, fields: &Map<String, Value>) -> Value {
    if fields.is_empty() {
        return content.clone();
    }
    match content {
        Value::Object(map) => Value::Object(overwrite(map, fields)),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Value::String(Value::Object(overwrite(&map, fields)).to_string()),
            _ => content.clone(),
        },
        other => other.clone(),
    }
}

fn overwrite(map: &Map<String, Value>, fields: &Map<String, Value>) -> Map<String, Value> {
    let mut copy = map.clone();
    for (k, v) in fields {
        copy.insert(k.clone(), v.clone());
    }
    copy
}

/// Read-only snapshot of durable cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurableStats {
    pub backend: String,
    pub records: usize,
    pub exact_hits: u64,
    pub adapted_hits: u64,
    pub misses: u64,
    pub corrupt_dropped: u64,
    pub evictions: u64,
    pub invalidated: u64,
}

#[derive(Default)]
struct Counters {
    exact_hits: AtomicU64,
    adapted_hits: AtomicU64,
    misses: AtomicU64,
    corrupt_dropped: AtomicU64,
    evictions: AtomicU64,
    invalidated: AtomicU64,
}

/// Similarity-matching cache over a durable store.
pub struct DurableCache {
    store: Arc<dyn DurableStore>,
    policies: PolicyTable,
    max_records: usize,
    similarity_limit: usize,
    counters: Counters,
}

impl DurableCache {
    pub fn new(store: Arc<dyn DurableStore>, policies: PolicyTable) -> Self {
        Self {
            store,
            policies,
            max_records: 10_000,
            similarity_limit: 5,
            counters: Counters::default(),
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records.max(1);
        self
    }

    pub fn with_similarity_limit(mut self, limit: usize) -> Self {
        self.similarity_limit = limit.max(1);
        self
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    async fn drop_corrupt(&self, id: &str, reason: &str) {
        tracing::warn!(id = %id, %reason, "Dropping corrupt durable record");
        self.counters.corrupt_dropped.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.store.delete(id).await {
            tracing::warn!(id = %id, error = %e, "Failed to delete corrupt record");
        }
    }

    /// Exact `(type, owner, metadata)` match. Counts as a hit when found.
    pub async fn get_exact(
        &self,
        content_type: ContentType,
        owner_id: &str,
        metadata: &Map<String, Value>,
    ) -> Result<Option<CacheRecord>, StoreError> {
        let id = key::record_id(content_type, owner_id, metadata);
        let now = Utc::now();
        let record = match self.store.get(&id).await {
            Ok(Some(record)) if !record.is_expired(now) => record,
            Ok(_) => return Ok(None),
            Err(StoreError::Corrupt { id, reason }) => {
                self.drop_corrupt(&id, &reason).await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(Some(self.touch(record).await?))
    }

    /// Candidates ranked by similarity to `features`. Does not count hits.
    pub async fn get_similar(
        &self,
        content_type: ContentType,
        owner_id: Option<&str>,
        candidate_filter: &Map<String, Value>,
        features: &[String],
        limit: usize,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let scan = self
            .store
            .find(&RecordQuery {
                content_type,
                owner_id: owner_id.map(str::to_string),
                metadata: candidate_filter.clone(),
                now: Utc::now(),
            })
            .await?;
        for id in &scan.corrupt {
            self.drop_corrupt(id, "undecodable row").await;
        }
        let mut ranked = similarity::rank(scan.records, features);
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn touch(&self, mut record: CacheRecord) -> Result<CacheRecord, StoreError> {
        let now = Utc::now();
        if self.store.record_hit(&record.id, now).await? {
            record.hit_count += 1;
            record.last_accessed = now;
        }
        Ok(record)
    }

    /// Exact, then similar, then miss.
    pub async fn lookup(&self, desc: &DurableDescriptor) -> Result<DurableLookup, StoreError> {
        if let Some(record) = self
            .get_exact(desc.content_type, &desc.owner_id, &desc.metadata)
            .await?
        {
            self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(id = %record.id, content_type = %desc.content_type, "Durable exact hit");
            let saved = record.cost;
            return Ok(DurableLookup::Exact { record, saved });
        }

        let threshold = self.policies.get(desc.content_type).threshold;
        let owner = (!desc.shared).then_some(desc.owner_id.as_str());
        let best = self
            .get_similar(
                desc.content_type,
                owner,
                &desc.candidate_filter,
                &desc.tags,
                self.similarity_limit,
            )
            .await?
            .into_iter()
            .next();

        match best {
            Some(ScoredRecord { record, similarity }) if similarity >= threshold => {
                let source = self.touch(record).await?;
                let content = adapt_payload(&source.content, &desc.adapt_fields);
                let saved = source.cost * similarity.min(MAX_ADAPTED_SAVING);
                self.counters.adapted_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    id = %source.id,
                    similarity,
                    threshold,
                    "Durable adapted hit"
                );
                Ok(DurableLookup::Adapted {
                    source,
                    content,
                    similarity,
                    saved,
                })
            }
            best => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    content_type = %desc.content_type,
                    best_similarity = best.map(|b| b.similarity),
                    threshold,
                    "Durable miss"
                );
                Ok(DurableLookup::Miss)
            }
        }
    }

    /// Store a generation. Returns the new record, or `None` when a record
    /// for this `(type, owner, metadata)` already exists.
    ///
    /// At capacity the least valuable records are evicted first.
    pub async fn put(
        &self,
        desc: &DurableDescriptor,
        content: Value,
        cost: f64,
    ) -> Result<Option<CacheRecord>, StoreError> {
        let id = desc.record_id();
        match self.store.get(&id).await {
            Ok(Some(_)) => return Ok(None),
            Ok(None) => {}
            Err(StoreError::Corrupt { id, reason }) => self.drop_corrupt(&id, &reason).await,
            Err(e) => return Err(e),
        }

        let count = self.store.count().await?;
        if count >= self.max_records {
            let evicted = self
                .store
                .evict_least_valuable(count + 1 - self.max_records)
                .await?;
            self.counters
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::warn!(evicted, max_records = self.max_records, "Durable cache at capacity");
        }

        let policy = self.policies.get(desc.content_type);
        let now = Utc::now();
        let record = CacheRecord {
            fingerprint: key::content_fingerprint(&id, &content),
            id,
            content_type: desc.content_type,
            owner_id: desc.owner_id.clone(),
            content,
            metadata: desc.metadata.clone(),
            tags: desc.tags.clone(),
            dependency_fingerprint: desc.dependency_fingerprint.clone(),
            similarity_hash: similarity::similarity_hash(&desc.tags),
            reuse_score: policy.reuse_score,
            hit_count: 0,
            cost: cost.max(0.0),
            created_at: now,
            last_accessed: now,
            expires_at: now + policy.ttl,
        };

        if self.store.insert(record.clone()).await? {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    /// Delete the record(s) with `fingerprint` and, transitively, everything
    /// that depends on a deleted record. Returns the deleted records.
    pub async fn invalidate(&self, fingerprint: &str) -> Result<Vec<CacheRecord>, StoreError> {
        let mut queue = VecDeque::from([fingerprint.to_string()]);
        let mut seen = HashSet::new();
        let mut removed = Vec::new();

        while let Some(fp) = queue.pop_front() {
            if !seen.insert(fp.clone()) {
                continue;
            }
            let mut doomed = self.store.by_fingerprint(&fp).await?;
            doomed.extend(self.store.dependents(&fp).await?);
            for record in doomed {
                if self.store.delete(&record.id).await? {
                    queue.push_back(record.fingerprint.clone());
                    removed.push(record);
                }
            }
        }

        self.counters
            .invalidated
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        tracing::info!(fingerprint, removed = removed.len(), "Invalidated durable records");
        Ok(removed)
    }

    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(Utc::now()).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }

    pub async fn stats(&self) -> Result<DurableStats, StoreError> {
        Ok(DurableStats {
            backend: self.store.name().to_string(),
            records: self.store.count().await?,
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            adapted_hits: self.counters.adapted_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            corrupt_dropped: self.counters.corrupt_dropped.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
        })
    }
}
