//! In-memory durable store: useful for testing and ephemeral runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use storyloom_core::store::metadata_contains;
use storyloom_core::{CacheRecord, DurableStore, RecordQuery, RecordScan, StoreError};
use tokio::sync::RwLock;

/// A store that keeps records in a map.
/// Records never fail to decode here, so scans never report corrupt ids.
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<String, CacheRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowest `reuse_score + hit_count` first, then oldest access.
pub(crate) fn value_order(a: &CacheRecord, b: &CacheRecord) -> std::cmp::Ordering {
    let va = f64::from(a.reuse_score) + a.hit_count as f64;
    let vb = f64::from(b.reuse_score) + b.hit_count as f64;
    va.total_cmp(&vb)
        .then(a.last_accessed.cmp(&b.last_accessed))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl DurableStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn insert(&self, record: CacheRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record);
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn find(&self, query: &RecordQuery) -> Result<RecordScan, StoreError> {
        let records = self.records.read().await;
        let mut found: Vec<CacheRecord> = records
            .values()
            .filter(|r| r.content_type == query.content_type)
            .filter(|r| query.owner_id.as_deref().is_none_or(|o| r.owner_id == o))
            .filter(|r| !r.is_expired(query.now))
            .filter(|r| metadata_contains(&r.metadata, &query.metadata))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(RecordScan {
            records: found,
            corrupt: Vec::new(),
        })
    }

    async fn dependents(&self, fingerprint: &str) -> Result<Vec<CacheRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.dependency_fingerprint.as_deref() == Some(fingerprint))
            .cloned()
            .collect())
    }

    async fn by_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheRecord>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|r| r.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    async fn record_hit(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        Ok(match records.get_mut(id) {
            Some(record) => {
                record.hit_count += 1;
                record.last_accessed = at;
                true
            }
            None => false,
        })
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok(before - records.len())
    }

    async fn evict_least_valuable(&self, count: usize) -> Result<usize, StoreError> {
        let mut records = self.records.write().await;
        let mut ranked: Vec<&CacheRecord> = records.values().collect();
        ranked.sort_by(|a, b| value_order(a, b));
        let victims: Vec<String> = ranked.into_iter().take(count).map(|r| r.id.clone()).collect();
        for id in &victims {
            records.remove(id);
        }
        Ok(victims.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().await.len())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.records.write().await.clear();
        Ok(())
    }
}
