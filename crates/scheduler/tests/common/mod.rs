#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use storyloom_cache::{CacheManager, DurableCache, HotCache, InMemoryStore, PolicyTable};
use storyloom_core::{
    CacheRecord, DurableStore, GenerationError, GenerationRequest, GenerationResponse, Generator,
    RecordQuery, RecordScan, StoreError, Usage,
};
use storyloom_scheduler::{Engine, SchedulerSettings};
use tokio::sync::Notify;

pub const CALL_COST: f64 = 0.02;

/// How the mock answers.
pub enum Behavior {
    Echo,
    /// Same text for every prompt
    Fixed(&'static str),
    AlwaysFail(GenerationError),
    /// Fail any prompt containing the marker, echo the rest
    FailMatching(&'static str, GenerationError),
}

/// Counts calls and the peak number of concurrent calls.
pub struct MockGenerator {
    delay: Duration,
    behavior: Behavior,
    calls: AtomicUsize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MockGenerator {
    pub fn new(delay: Duration, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            delay,
            behavior,
            calls: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn echo(delay: Duration) -> Arc<Self> {
        Self::new(delay, Behavior::Echo)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Decrements the concurrency gauge even when the call is abandoned.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Generator for MockGenerator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.current);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let content = match &self.behavior {
            Behavior::AlwaysFail(err) => return Err(err.clone()),
            Behavior::FailMatching(marker, err) if request.prompt.contains(marker) => {
                return Err(err.clone());
            }
            Behavior::Fixed(text) => text.to_string(),
            _ => format!("story for: {}", request.prompt),
        };
        Ok(GenerationResponse {
            content,
            usage: Usage::new(120, 380),
            cost: CALL_COST,
            model: request.model,
        })
    }
}

pub fn settings(max_concurrency: usize, max_retries: u32) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrency,
        max_retries,
        timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
        single_flight: true,
        result_retention: 1000,
    }
}

pub fn memory_cache() -> CacheManager {
    CacheManager::new(
        HotCache::new(128, Duration::from_secs(3600)),
        Some(DurableCache::new(Arc::new(InMemoryStore::new()), PolicyTable::new())),
    )
}

pub fn engine(generator: Arc<MockGenerator>, settings: SchedulerSettings) -> Engine {
    engine_with_cache(generator, settings, memory_cache())
}

pub fn engine_with_cache(generator: Arc<MockGenerator>, settings: SchedulerSettings, cache: CacheManager) -> Engine {
    Engine::builder()
        .generator(generator)
        .cache(cache)
        .scheduler(settings)
        .build()
        .unwrap()
}

pub fn gated_cache(store: Arc<GatedStore>) -> CacheManager {
    CacheManager::new(
        HotCache::new(128, Duration::from_secs(3600)),
        Some(DurableCache::new(store, PolicyTable::new())),
    )
}

/// Store call a [`GatedStore`] can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Get,
    Insert,
    RecordHit,
}

/// In-memory store that parks the next call at an armed gate until
/// released, so a test can run something else in between.
pub struct GatedStore {
    inner: InMemoryStore,
    armed: Mutex<Option<Gate>>,
    entered: Notify,
    release: Notify,
}

impl GatedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            armed: Mutex::new(None),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    /// Hold the next call at `gate`. Fires once.
    pub fn arm(&self, gate: Gate) {
        *self.armed.lock().unwrap() = Some(gate);
    }

    /// Resolves once a call is parked at the armed gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self, gate: Gate) {
        let hit = {
            let mut armed = self.armed.lock().unwrap();
            if *armed == Some(gate) {
                *armed = None;
                true
            } else {
                false
            }
        };
        if hit {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl DurableStore for GatedStore {
    fn name(&self) -> &str {
        "gated"
    }

    async fn insert(&self, record: CacheRecord) -> Result<bool, StoreError> {
        self.pass(Gate::Insert).await;
        self.inner.insert(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<CacheRecord>, StoreError> {
        self.pass(Gate::Get).await;
        self.inner.get(id).await
    }

    async fn find(&self, query: &RecordQuery) -> Result<RecordScan, StoreError> {
        self.inner.find(query).await
    }

    async fn dependents(&self, fingerprint: &str) -> Result<Vec<CacheRecord>, StoreError> {
        self.inner.dependents(fingerprint).await
    }

    async fn by_fingerprint(&self, fingerprint: &str) -> Result<Vec<CacheRecord>, StoreError> {
        self.inner.by_fingerprint(fingerprint).await
    }

    async fn record_hit(&self, id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.pass(Gate::RecordHit).await;
        self.inner.record_hit(id, at).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.purge_expired(now).await
    }

    async fn evict_least_valuable(&self, count: usize) -> Result<usize, StoreError> {
        self.inner.evict_least_valuable(count).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.inner.count().await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.inner.clear().await
    }
}
