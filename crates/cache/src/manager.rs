//! CacheManager: the hot and durable layers behind one facade.
//!
//! The manager owns a write epoch. Invalidation and clearing bump it, and
//! write-through carries the epoch observed when the work started; a write
//! with a stale epoch is discarded. A generation that was timed out or
//! invalidated while in flight therefore cannot repopulate the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use storyloom_core::{StoreError, Usage};

use crate::durable::{DurableCache, DurableDescriptor, DurableLookup, DurableStats};
use crate::hot::{HotCache, HotEntry, HotStats, SetOptions, SweeperHandle};

/// Hot entry metadata key linking it to its durable record.
pub const DURABLE_ID_KEY: &str = "durable_id";

/// Durable payload for generated text. The text is kept verbatim so an
/// exact hit hands back exactly what the generator produced.
pub fn text_to_payload(content: &str) -> Value {
    Value::String(content.to_string())
}

/// Inverse of [`text_to_payload`]. Structured payloads stored directly
/// through [`DurableCache::put`] are rendered as compact JSON.
pub fn payload_to_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A fresh generation to write through both layers.
#[derive(Debug, Clone)]
pub struct WriteThrough<'a> {
    pub key: &'a str,
    pub content: &'a str,
    pub usage: Usage,
    pub model: &'a str,
    pub cost: f64,
    pub durable: Option<&'a DurableDescriptor>,
}

/// A durable hit to copy into the hot layer.
#[derive(Debug, Clone)]
pub struct DurableWarm<'a> {
    pub key: &'a str,
    pub content: &'a str,
    pub model: &'a str,
    /// What the hit saved; reused as the hot entry's cost
    pub saved: f64,
    pub record_id: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hot: HotStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durable: Option<DurableStats>,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub hot_removed: usize,
    pub durable_removed: usize,
}

pub struct CacheManager {
    hot: Arc<HotCache>,
    durable: Option<DurableCache>,
    epoch: AtomicU64,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl CacheManager {
    pub fn new(hot: HotCache, durable: Option<DurableCache>) -> Self {
        Self {
            hot: Arc::new(hot),
            durable,
            epoch: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Hot layer only.
    pub fn hot_only(capacity: usize, ttl: Duration) -> Self {
        Self::new(HotCache::new(capacity, ttl), None)
    }

    pub fn hot(&self) -> &Arc<HotCache> {
        &self.hot
    }

    pub fn durable(&self) -> Option<&DurableCache> {
        self.durable.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get_hot(&self, key: &str) -> Option<HotEntry> {
        let entry = self.hot.get(key);
        tracing::debug!(key = %key, hit = entry.is_some(), "Hot cache lookup");
        entry
    }

    /// Durable lookup. Store failures are logged and reported as a miss.
    pub async fn lookup_durable(&self, desc: &DurableDescriptor) -> DurableLookup {
        let Some(durable) = &self.durable else {
            return DurableLookup::Miss;
        };
        match durable.lookup(desc).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, content_type = %desc.content_type, "Durable lookup failed; treating as miss");
                DurableLookup::Miss
            }
        }
    }

    /// Write a fresh generation to both layers, unless the epoch moved on
    /// since `observed_epoch`. Returns whether the write happened.
    pub async fn write_through(&self, observed_epoch: u64, write: WriteThrough<'_>) -> bool {
        let mut metadata = Map::new();
        if let Some(desc) = write.durable {
            metadata.insert(DURABLE_ID_KEY.into(), Value::String(desc.record_id()));
        }
        let options = SetOptions::default().cost(write.cost).metadata(metadata);
        if !self.set_hot_at(observed_epoch, write.key, write.content, write.usage, write.model, options) {
            return false;
        }

        if let (Some(durable), Some(desc)) = (&self.durable, write.durable) {
            match durable
                .put(desc, text_to_payload(write.content), write.cost)
                .await
            {
                Ok(Some(record)) if observed_epoch != self.epoch() => {
                    // An invalidation ran during the put and may have missed it.
                    tracing::debug!(id = %record.id, "Dropping durable write that raced an invalidation");
                    if let Err(e) = durable.store().delete(&record.id).await {
                        tracing::warn!(id = %record.id, error = %e, "Failed to drop stale durable write");
                    }
                    self.hot.remove_where(|e| e.key == write.key && e.content == write.content);
                    return false;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, content_type = %desc.content_type, "Durable write failed");
                }
            }
        }
        true
    }

    /// Copy a durable hit into the hot layer under the same epoch guard
    /// as [`write_through`](Self::write_through). A `false` return means an
    /// invalidation or clear ran since `observed_epoch`, and the hit must
    /// not be served.
    pub fn warm_from_durable(&self, observed_epoch: u64, warm: DurableWarm<'_>) -> bool {
        let mut metadata = Map::new();
        metadata.insert(DURABLE_ID_KEY.into(), Value::String(warm.record_id.to_string()));
        self.set_hot_at(
            observed_epoch,
            warm.key,
            warm.content,
            Usage::default(),
            warm.model,
            SetOptions::default().cost(warm.saved).metadata(metadata),
        )
    }

    /// Hot set that only sticks if the epoch is still `observed_epoch`
    /// after the entry is visible. Invalidation bumps the epoch before it
    /// sweeps the hot layer, so either the sweep or the recheck removes it.
    fn set_hot_at(
        &self,
        observed_epoch: u64,
        key: &str,
        content: &str,
        usage: Usage,
        model: &str,
        options: SetOptions,
    ) -> bool {
        if observed_epoch != self.epoch() {
            tracing::debug!(
                key = %key,
                observed_epoch,
                current_epoch = self.epoch(),
                "Discarding stale cache write"
            );
            return false;
        }
        self.hot.set(key, content, usage, model, options);
        if observed_epoch != self.epoch() {
            self.hot.remove_where(|e| e.key == key && e.content == content);
            tracing::debug!(key = %key, "Discarding cache write that raced an invalidation");
            return false;
        }
        true
    }

    /// Invalidate a fingerprint and everything derived from it.
    ///
    /// Hot entries written for the removed records are dropped too.
    pub async fn invalidate(&self, fingerprint: &str) -> Result<usize, StoreError> {
        self.bump_epoch();
        let Some(durable) = &self.durable else {
            return Ok(0);
        };
        let removed = durable.invalidate(fingerprint).await?;
        let ids: Vec<&str> = removed.iter().map(|r| r.id.as_str()).collect();
        let hot_removed = self.hot.remove_where(|entry| {
            entry
                .metadata
                .get(DURABLE_ID_KEY)
                .and_then(Value::as_str)
                .is_some_and(|id| ids.contains(&id))
        });
        if hot_removed > 0 {
            tracing::debug!(hot_removed, "Dropped hot entries for invalidated records");
        }
        Ok(removed.len())
    }

    pub async fn cleanup(&self) -> Result<CleanupReport, StoreError> {
        let hot_removed = self.hot.cleanup();
        let durable_removed = match &self.durable {
            Some(durable) => durable.purge_expired().await?,
            None => 0,
        };
        Ok(CleanupReport {
            hot_removed,
            durable_removed,
        })
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.bump_epoch();
        self.hot.clear();
        if let Some(durable) = &self.durable {
            durable.clear().await?;
        }
        Ok(())
    }

    /// Read-only snapshot. Durable counters are omitted if the store
    /// cannot be counted.
    pub async fn stats(&self) -> CacheStats {
        let durable = match &self.durable {
            Some(durable) => match durable.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::warn!(error = %e, "Durable stats unavailable");
                    None
                }
            },
            None => None,
        };
        CacheStats {
            hot: self.hot.stats(),
            durable,
            epoch: self.epoch(),
        }
    }

    /// Start the eager hot-cache sweep. A zero interval disables it.
    pub fn start_sweeper(&self, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(self.hot.spawn_sweeper(interval));
        }
    }

    pub fn stop_sweeper(&self) {
        if let Some(mut handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.stop();
            tracing::info!("Hot cache sweeper stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStore;
    use crate::policy::PolicyTable;
    use serde_json::json;
    use storyloom_core::ContentType;

    fn manager() -> CacheManager {
        CacheManager::new(
            HotCache::new(16, Duration::from_secs(60)),
            Some(DurableCache::new(
                Arc::new(InMemoryStore::new()),
                PolicyTable::new(),
            )),
        )
    }

    fn write<'a>(key: &'a str, content: &'a str, desc: Option<&'a DurableDescriptor>) -> WriteThrough<'a> {
        WriteThrough {
            key,
            content,
            usage: Usage::new(40, 60),
            model: "m",
            cost: 0.01,
            durable: desc,
        }
    }

    #[test]
    fn payload_conversion_keeps_text_verbatim() {
        let pretty = "{\n  \"title\": \"Chapter One\",\n  \"body\": \"It rained.\"\n}";
        assert_eq!(payload_to_text(&text_to_payload(pretty)), pretty);
        assert_eq!(text_to_payload("plain"), json!("plain"));
        assert_eq!(payload_to_text(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn exact_hit_returns_generated_text_unchanged() {
        let m = manager();
        let desc = DurableDescriptor::new(ContentType::ChapterContent, "o");
        let pretty = "{\n  \"title\": \"Chapter One\",\n  \"body\": \"It rained.\"\n}";
        m.write_through(m.epoch(), write("k", pretty, Some(&desc))).await;

        let found = m.lookup_durable(&desc).await;
        assert_eq!(payload_to_text(found.content().unwrap()), pretty);
    }

    #[test]
    fn warm_is_refused_after_invalidation() {
        let m = manager();
        let observed = m.epoch();
        m.bump_epoch();
        let warm = DurableWarm {
            key: "k",
            content: "stale",
            model: "m",
            saved: 0.01,
            record_id: "r",
        };
        assert!(!m.warm_from_durable(observed, warm.clone()));
        assert!(m.get_hot("k").is_none());
        assert!(m.warm_from_durable(m.epoch(), warm));
        assert_eq!(m.get_hot("k").unwrap().metadata[DURABLE_ID_KEY], json!("r"));
    }

    #[tokio::test]
    async fn write_through_fills_both_layers() {
        let m = manager();
        let desc = DurableDescriptor::new(ContentType::Summary, "o");
        assert!(m.write_through(m.epoch(), write("k", "X", Some(&desc))).await);

        let hot = m.get_hot("k").unwrap();
        assert_eq!(hot.content, "X");
        assert_eq!(hot.usage, Usage::new(40, 60));
        assert!(matches!(m.lookup_durable(&desc).await, DurableLookup::Exact { .. }));
    }

    #[tokio::test]
    async fn stale_epoch_write_is_discarded() {
        let m = manager();
        let observed = m.epoch();
        m.invalidate("nothing").await.unwrap();
        assert!(!m.write_through(observed, write("k", "late", None)).await);
        assert!(m.get_hot("k").is_none());
    }

    #[tokio::test]
    async fn invalidation_drops_linked_hot_entries() {
        let m = manager();
        let desc = DurableDescriptor::new(ContentType::StoryFoundation, "o");
        m.write_through(m.epoch(), write("k", "foundation", Some(&desc)))
            .await;
        m.write_through(m.epoch(), write("other", "unrelated", None)).await;

        let record = m
            .durable()
            .unwrap()
            .get_exact(ContentType::StoryFoundation, "o", &Map::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.invalidate(&record.fingerprint).await.unwrap(), 1);
        assert!(m.get_hot("k").is_none());
        assert!(m.get_hot("other").is_some());
    }

    #[tokio::test]
    async fn stats_and_clear() {
        let m = manager();
        m.write_through(m.epoch(), write("k", "v", None)).await;
        m.get_hot("k");
        let stats = m.stats().await;
        assert_eq!(stats.hot.hits, 1);
        assert_eq!(stats.durable.as_ref().map(|d| d.backend.as_str()), Some("in_memory"));

        m.clear().await.unwrap();
        assert!(m.hot().is_empty());
        assert_eq!(m.stats().await.epoch, 1);
    }
}
