//! Hot cache: process-local, fixed capacity, per-entry TTL, strict LRU.
//!
//! Expiry is checked on every read, so an entry is never returned once
//! `now > expires_at` even if no sweep has run. The sweeper spawned by
//! [`HotCache::spawn_sweeper`] only reclaims memory earlier.
//!
//! Time comes from `tokio::time::Instant`, which tests can pause and advance.
//! LRU order uses a logical access counter rather than wall time, so
//! operations within the same instant are still strictly ordered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use storyloom_core::Usage;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A cached generation result.
#[derive(Debug, Clone, PartialEq)]
pub struct HotEntry {
    pub key: String,
    pub content: String,
    pub usage: Usage,
    pub cost: f64,
    pub model: String,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub metadata: Map<String, Value>,
}

impl HotEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Optional per-entry settings for [`HotCache::set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Defaults to the cache-wide TTL
    pub ttl: Option<Duration>,
    pub cost: f64,
    pub metadata: Map<String, Value>,
}

impl SetOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Read-only snapshot of hot cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HotStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

struct Slot {
    entry: HotEntry,
    last_access: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop `key` if it is expired. Returns true when it was.
    fn expire_if_stale(&mut self, key: &str, now: Instant) -> bool {
        let stale = self
            .slots
            .get(key)
            .is_some_and(|slot| slot.entry.is_expired(now));
        if stale {
            self.slots.remove(key);
            self.expirations += 1;
        }
        stale
    }

    fn evict_lru(&mut self) {
        let victim = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.slots.remove(&key);
            self.evictions += 1;
            tracing::debug!(key = %key, "Evicted least recently used hot entry");
        }
    }
}

/// Thread-safe hot cache.
pub struct HotCache {
    inner: Mutex<Inner>,
    capacity: usize,
    default_ttl: Duration,
}

impl HotCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a live entry exists. Counts as a use for LRU purposes.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.expire_if_stale(key, now) {
            return false;
        }
        let tick = inner.tick();
        match inner.slots.get_mut(key) {
            Some(slot) => {
                slot.last_access = tick;
                true
            }
            None => false,
        }
    }

    /// Fetch a live entry, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<HotEntry> {
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.expire_if_stale(key, now) {
            inner.misses += 1;
            return None;
        }
        let tick = inner.tick();
        let found = inner.slots.get_mut(key).map(|slot| {
            slot.last_access = tick;
            slot.entry.clone()
        });
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Insert or replace an entry. At capacity, the least recently used
    /// entry is evicted first.
    pub fn set(
        &self,
        key: impl Into<String>,
        content: impl Into<String>,
        usage: Usage,
        model: impl Into<String>,
        opts: SetOptions,
    ) {
        let key = key.into();
        let now = Instant::now();
        let ttl = opts.ttl.unwrap_or(self.default_ttl);
        let entry = HotEntry {
            key: key.clone(),
            content: content.into(),
            usage,
            cost: opts.cost,
            model: model.into(),
            created_at: now,
            expires_at: now + ttl,
            metadata: opts.metadata,
        };

        let mut inner = self.lock();
        if !inner.slots.contains_key(&key) && inner.slots.len() >= self.capacity {
            inner.evict_lru();
        }
        let tick = inner.tick();
        inner.slots.insert(
            key,
            Slot {
                entry,
                last_access: tick,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().slots.remove(key).is_some()
    }

    /// Remove every expired entry; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| !slot.entry.is_expired(now));
        let removed = before - inner.slots.len();
        inner.expirations += removed as u64;
        removed
    }

    /// Remove every entry matching `pred`; returns how many were removed.
    pub fn remove_where(&self, mut pred: impl FnMut(&HotEntry) -> bool) -> usize {
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| !pred(&slot.entry));
        before - inner.slots.len()
    }

    pub fn clear(&self) {
        self.lock().slots.clear();
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HotStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        HotStats {
            size: inner.slots.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` on the tokio runtime.
    ///
    /// The sweep stops when the returned handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.cleanup();
                if removed > 0 {
                    tracing::debug!(removed, "Hot cache sweep");
                }
            }
        });
        tracing::info!(interval_secs = interval.as_secs(), "Hot cache sweeper started");
        SweeperHandle { task: Some(task) }
    }
}

/// Stops the background sweep when dropped.
pub struct SweeperHandle {
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> HotCache {
        HotCache::new(capacity, Duration::from_secs(3600))
    }

    fn put(cache: &HotCache, key: &str, content: &str) {
        cache.set(key, content, Usage::new(10, 5), "m", SetOptions::default());
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let c = cache(2);
        put(&c, "A", "a");
        put(&c, "B", "b");
        assert!(c.get("A").is_some());
        put(&c, "C", "c");

        assert!(c.has("A"));
        assert!(!c.has("B"));
        assert!(c.has("C"));
        assert_eq!(c.stats().evictions, 1);
    }

    #[tokio::test]
    async fn has_counts_as_use() {
        let c = cache(2);
        put(&c, "A", "a");
        put(&c, "B", "b");
        assert!(c.has("A"));
        put(&c, "C", "c");
        assert!(c.get("B").is_none());
        assert!(c.get("A").is_some());
    }

    #[tokio::test]
    async fn overwrite_does_not_evict() {
        let c = cache(2);
        put(&c, "A", "a");
        put(&c, "B", "b");
        put(&c, "A", "a2");
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("A").unwrap().content, "a2");
        assert_eq!(c.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_boundary() {
        let c = cache(4);
        c.set(
            "k",
            "v",
            Usage::default(),
            "m",
            SetOptions::default().ttl(Duration::from_millis(1000)),
        );

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(c.get("k").map(|e| e.content), Some("v".to_string()));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(c.get("k").is_none());
        assert!(!c.has("k"));
        assert_eq!(c.stats().expirations, 1);
    }

    #[tokio::test]
    async fn round_trip_keeps_usage_and_cost() {
        let c = cache(4);
        c.set(
            "key",
            "X",
            Usage::new(120, 80),
            "openai/gpt-4o-mini",
            SetOptions::default().cost(0.0042),
        );
        let e = c.get("key").unwrap();
        assert_eq!(e.content, "X");
        assert_eq!(e.usage, Usage::new(120, 80));
        assert_eq!(e.cost, 0.0042);
        assert_eq!(e.model, "openai/gpt-4o-mini");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_only_expired() {
        let c = cache(4);
        c.set("short", "s", Usage::default(), "m", SetOptions::default().ttl(Duration::from_secs(1)));
        put(&c, "long", "l");
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(c.cleanup(), 1);
        assert_eq!(c.len(), 1);
        assert!(c.delete("long"));
        assert!(c.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_expired_entries() {
        let c = Arc::new(cache(4));
        c.set("k", "v", Usage::default(), "m", SetOptions::default().ttl(Duration::from_secs(1)));
        let mut handle = c.spawn_sweeper(Duration::from_secs(5));
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(c.len(), 0);

        handle.stop();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let c = cache(4);
        put(&c, "A", "a");
        c.get("A");
        c.get("missing");
        let s = c.stats();
        assert_eq!(s.hits, 1);
        assert_eq!(s.misses, 1);
        assert!((s.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
