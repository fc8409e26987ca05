//! Batch scheduler: priority queue, bounded dispatch, retries, timeouts.
//!
//! One driver at a time pulls operations off a priority heap into a
//! `JoinSet` holding at most `max_concurrency` generation attempts. Each
//! completion frees a slot that is refilled immediately with the next
//! highest-priority operation. Queue, in-flight count and results live in
//! one `std::sync::Mutex`; it is never held across an await.
//!
//! Lookup order on submit: hot cache, then durable cache, then (with
//! single-flight on) an identical queued or in-flight operation. Only a
//! miss on all three reaches the generator.
//!
//! A timed-out attempt is dropped, which cancels the in-process future.
//! Whatever the remote service still does with the request is out of our
//! hands; its cost is not recorded and, because write-through is checked
//! against the cache epoch observed at dispatch, it never lands in the
//! cache after an invalidation.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use storyloom_cache::manager::payload_to_text;
use storyloom_cache::{CacheManager, DurableDescriptor, DurableLookup, DurableWarm, WriteThrough};
use storyloom_core::{GenerationError, GenerationRequest, GenerationResponse, Generator, SchedulerError};
use storyloom_telemetry::{CostLedger, SavingsSource};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::types::{BatchOperation, BatchResult, OperationId, OperationPhase, SchedulerSettings, SchedulerStats};

/// Heap entry: higher priority first, then lower sequence number.
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: i32,
    seq: u64,
    id: OperationId,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A non-terminal leader operation.
struct Pending {
    op: BatchOperation,
    phase: OperationPhase,
    attempts: u32,
    /// Wait before the next attempt starts
    backoff: Duration,
    first_dispatch: Option<Instant>,
}

#[derive(Default)]
struct State {
    queue: BinaryHeap<Queued>,
    seq: u64,
    pending: HashMap<OperationId, Pending>,
    /// cache key → leader id
    leaders: HashMap<String, OperationId>,
    /// leader id → follower ids
    followers: HashMap<OperationId, Vec<OperationId>>,
    /// follower id → leader id
    waiting: HashMap<OperationId, OperationId>,
    results: HashMap<OperationId, BatchResult>,
    retained: VecDeque<OperationId>,
    unreported: Vec<OperationId>,
    in_flight: usize,
    peak_in_flight: usize,
    submitted: u64,
    cache_hits: u64,
    succeeded: u64,
    failed: u64,
    retries: u64,
    timeouts: u64,
    deduplicated: u64,
    total_cost: f64,
    latency_total_ms: u64,
    latency_samples: u64,
    shutting_down: bool,
}

impl State {
    fn enqueue(&mut self, id: OperationId, priority: i32) {
        self.seq += 1;
        let seq = self.seq;
        self.queue.push(Queued { priority, seq, id });
    }

    fn is_known(&self, id: &str) -> bool {
        self.pending.contains_key(id) || self.waiting.contains_key(id) || self.results.contains_key(id)
    }

    fn record(&mut self, result: BatchResult, retention: usize) {
        if result.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        let id = result.id.clone();
        self.results.insert(id.clone(), result);
        self.retained.push_back(id.clone());
        self.unreported.push(id);
        while self.results.len() > retention {
            let Some(oldest) = self.retained.pop_front() else {
                break;
            };
            self.results.remove(&oldest);
        }
    }
}

/// What one attempt needs, copied out of the state under the lock.
struct Job {
    id: OperationId,
    request: GenerationRequest,
    cache_key: String,
    durable: Option<DurableDescriptor>,
    attempt: u32,
    delay: Duration,
    epoch: u64,
}

enum AttemptError {
    Generation(GenerationError),
    Timeout(Duration),
    Panicked,
}

impl AttemptError {
    fn retryable(&self) -> bool {
        match self {
            Self::Generation(e) => e.is_retryable(),
            Self::Timeout(_) => true,
            Self::Panicked => false,
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Generation(e) => e.retry_after_secs(),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Generation(e) => e.kind(),
            Self::Timeout(_) => "timeout",
            Self::Panicked => "internal",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Generation(e) => e.to_string(),
            Self::Timeout(after) => format!("Generation timed out after {}ms", after.as_millis()),
            Self::Panicked => "Generation task panicked".into(),
        }
    }
}

struct Completion {
    id: OperationId,
    outcome: Result<GenerationResponse, AttemptError>,
}

struct Shared {
    settings: SchedulerSettings,
    generator: Arc<dyn Generator>,
    cache: Arc<CacheManager>,
    ledger: Arc<CostLedger>,
    state: Mutex<State>,
    /// New work was queued (or shutdown requested)
    work: Notify,
    /// Some operation reached a terminal state
    done: Notify,
    /// Serializes drivers
    driver: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch until nothing is queued or in flight.
    async fn drive(self: &Arc<Self>) {
        let _driver = self.driver.lock().await;
        let mut tasks: JoinSet<Completion> = JoinSet::new();
        loop {
            while tasks.len() < self.settings.max_concurrency {
                let Some(job) = self.next_job() else {
                    break;
                };
                let shared = Arc::clone(self);
                tasks.spawn(async move {
                    let id = job.id.clone();
                    let outcome = AssertUnwindSafe(shared.attempt(job))
                        .catch_unwind()
                        .await
                        .unwrap_or(Err(AttemptError::Panicked));
                    Completion { id, outcome }
                });
            }
            if tasks.is_empty() {
                break;
            }
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(completion)) => self.complete(completion),
                    Some(Err(e)) => tracing::error!(error = %e, "Dispatch task failed"),
                    None => {}
                },
                _ = self.work.notified() => {}
            }
        }
    }

    fn next_job(&self) -> Option<Job> {
        let epoch = self.cache.epoch();
        let mut state = self.lock();
        while let Some(next) = state.queue.pop() {
            let Some(pending) = state.pending.get_mut(&next.id) else {
                continue;
            };
            pending.phase = OperationPhase::Processing;
            pending.attempts += 1;
            pending.first_dispatch.get_or_insert_with(Instant::now);
            let job = Job {
                id: next.id,
                request: pending.op.request.clone(),
                cache_key: pending.op.cache_key.clone(),
                durable: pending.op.durable.clone(),
                attempt: pending.attempts,
                delay: std::mem::take(&mut pending.backoff),
                epoch,
            };
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            return Some(job);
        }
        None
    }

    async fn attempt(self: Arc<Self>, job: Job) -> Result<GenerationResponse, AttemptError> {
        if !job.delay.is_zero() {
            tokio::time::sleep(job.delay).await;
        }
        tracing::debug!(op_id = %job.id, attempt = job.attempt, model = %job.request.model, "Dispatching generation");

        let timeout = self.settings.timeout;
        let response = match tokio::time::timeout(timeout, self.generator.generate(job.request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(AttemptError::Generation(e)),
            Err(_) => return Err(AttemptError::Timeout(timeout)),
        };

        self.ledger.record_generation(response.usage, response.cost);
        self.cache
            .write_through(
                job.epoch,
                WriteThrough {
                    key: &job.cache_key,
                    content: &response.content,
                    usage: response.usage,
                    model: &response.model,
                    cost: response.cost,
                    durable: job.durable.as_ref(),
                },
            )
            .await;
        Ok(response)
    }

    fn complete(&self, completion: Completion) {
        let Completion { id, outcome } = completion;
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        let Some(mut pending) = state.pending.remove(&id) else {
            return;
        };
        let elapsed_ms = pending
            .first_dispatch
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or_default();

        let result = match outcome {
            Ok(response) => {
                state.total_cost += response.cost;
                BatchResult {
                    id: id.clone(),
                    success: true,
                    content: Some(response.content),
                    usage: Some(response.usage),
                    cost: response.cost,
                    error: None,
                    error_kind: None,
                    cached: false,
                    processing_time_ms: elapsed_ms,
                    attempts: pending.attempts,
                }
            }
            Err(err) => {
                if matches!(err, AttemptError::Timeout(_)) {
                    state.timeouts += 1;
                }
                if err.retryable() && pending.op.retry_count < self.settings.max_retries {
                    pending.op.retry_count += 1;
                    pending.backoff = self
                        .settings
                        .backoff(pending.op.retry_count, err.retry_after_secs());
                    pending.phase = OperationPhase::Queued;
                    tracing::warn!(
                        op_id = %id,
                        retry = pending.op.retry_count,
                        max_retries = self.settings.max_retries,
                        backoff_ms = pending.backoff.as_millis() as u64,
                        error = %err.message(),
                        "Generation failed; re-queued"
                    );
                    state.retries += 1;
                    let priority = pending.op.priority;
                    state.pending.insert(id.clone(), pending);
                    state.enqueue(id, priority);
                    return;
                }
                tracing::warn!(op_id = %id, attempts = pending.attempts, kind = err.kind(), error = %err.message(), "Operation failed");
                BatchResult {
                    id: id.clone(),
                    success: false,
                    content: None,
                    usage: None,
                    cost: 0.0,
                    error: Some(err.message()),
                    error_kind: Some(err.kind().to_string()),
                    cached: false,
                    processing_time_ms: elapsed_ms,
                    attempts: pending.attempts,
                }
            }
        };

        state.latency_total_ms += result.processing_time_ms;
        state.latency_samples += 1;
        if state.leaders.get(&pending.op.cache_key) == Some(&id) {
            state.leaders.remove(&pending.op.cache_key);
        }

        let retention = self.settings.result_retention;
        for follower in state.followers.remove(&id).unwrap_or_default() {
            state.waiting.remove(&follower);
            let mut shared = result.clone();
            shared.id = follower;
            shared.cached = result.success;
            shared.cost = 0.0;
            shared.attempts = 0;
            if result.success {
                self.ledger.record_saving(SavingsSource::SingleFlight, result.cost);
            }
            state.record(shared, retention);
        }
        tracing::debug!(op_id = %id, success = result.success, elapsed_ms, "Operation finished");
        state.record(result, retention);
        drop(state);
        self.done.notify_waiters();
    }
}

/// The batch scheduler.
///
/// Drive it explicitly with [`run_all`](Self::run_all), or call
/// [`start`](Self::start) to run a background dispatcher and collect
/// results with [`await_results`](Self::await_results).
pub struct BatchScheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchScheduler {
    pub fn new(
        settings: SchedulerSettings,
        generator: Arc<dyn Generator>,
        cache: Arc<CacheManager>,
        ledger: Arc<CostLedger>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                generator,
                cache,
                ledger,
                state: Mutex::new(State::default()),
                work: Notify::new(),
                done: Notify::new(),
                driver: tokio::sync::Mutex::new(()),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared.settings
    }

    /// Accept an operation.
    ///
    /// Cache hits resolve immediately as terminal successes with
    /// `cached: true`; everything else is queued.
    pub async fn submit(&self, op: BatchOperation) -> Result<OperationId, SchedulerError> {
        {
            let state = self.shared.lock();
            if state.shutting_down {
                return Err(SchedulerError::ShuttingDown);
            }
            if state.is_known(&op.id) {
                return Err(SchedulerError::DuplicateOperation(op.id));
            }
        }

        if let Some(entry) = self.shared.cache.get_hot(&op.cache_key) {
            self.shared.ledger.record_saving(SavingsSource::HotCache, entry.cost);
            tracing::debug!(op_id = %op.id, key = %op.cache_key, "Served from hot cache");
            return self.resolve_cached(BatchResult::cached(op.id, entry.content, Some(entry.usage)));
        }

        if let Some(desc) = &op.durable
            && let Some(result) = self.try_durable(&op, desc).await
        {
            return self.resolve_cached(result);
        }

        let id = op.id.clone();
        let mut state = self.shared.lock();
        if state.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }
        // The durable lookup awaited; another submit may have taken the id.
        if state.is_known(&id) {
            return Err(SchedulerError::DuplicateOperation(id));
        }
        state.submitted += 1;
        if self.shared.settings.single_flight
            && let Some(leader) = state.leaders.get(&op.cache_key).cloned()
        {
            tracing::debug!(op_id = %id, leader = %leader, "Joined in-flight operation");
            state.waiting.insert(id.clone(), leader.clone());
            state.followers.entry(leader).or_default().push(id.clone());
            state.deduplicated += 1;
            return Ok(id);
        }
        if self.shared.settings.single_flight {
            state.leaders.insert(op.cache_key.clone(), id.clone());
        }
        let priority = op.priority;
        state.pending.insert(
            id.clone(),
            Pending {
                op,
                phase: OperationPhase::Queued,
                attempts: 0,
                backoff: Duration::ZERO,
                first_dispatch: None,
            },
        );
        state.enqueue(id.clone(), priority);
        drop(state);
        self.shared.work.notify_one();
        Ok(id)
    }

    /// Serve from the durable layer. A hit that raced an invalidation is
    /// treated as a miss.
    async fn try_durable(&self, op: &BatchOperation, desc: &DurableDescriptor) -> Option<BatchResult> {
        let epoch = self.shared.cache.epoch();
        let found = self.shared.cache.lookup_durable(desc).await;
        let (source, record_id) = match &found {
            DurableLookup::Exact { record, .. } => (SavingsSource::DurableExact, record.id.clone()),
            DurableLookup::Adapted { source, .. } => (SavingsSource::DurableAdapted, source.id.clone()),
            DurableLookup::Miss => return None,
        };
        let content = payload_to_text(found.content()?);
        let saved = found.saved();
        let warmed = self.shared.cache.warm_from_durable(
            epoch,
            DurableWarm {
                key: &op.cache_key,
                content: &content,
                model: &op.request.model,
                saved,
                record_id: &record_id,
            },
        );
        if !warmed {
            tracing::debug!(op_id = %op.id, record_id = %record_id, "Durable hit invalidated during lookup");
            return None;
        }
        self.shared.ledger.record_saving(source, saved);
        tracing::debug!(op_id = %op.id, ?source, saved_usd = saved, "Served from durable cache");
        Some(BatchResult::cached(op.id.clone(), content, None))
    }

    fn resolve_cached(&self, result: BatchResult) -> Result<OperationId, SchedulerError> {
        let id = result.id.clone();
        let mut state = self.shared.lock();
        if state.is_known(&id) {
            return Err(SchedulerError::DuplicateOperation(id));
        }
        state.submitted += 1;
        state.cache_hits += 1;
        state.record(result, self.shared.settings.result_retention);
        drop(state);
        self.shared.done.notify_waiters();
        Ok(id)
    }

    /// Drive everything queued to a terminal state and return the results
    /// that became terminal since the previous call.
    ///
    /// Individual failures never abort the batch.
    pub async fn run_all(&self) -> HashMap<OperationId, BatchResult> {
        self.shared.drive().await;
        let mut state = self.shared.lock();
        let ids = std::mem::take(&mut state.unreported);
        ids.into_iter()
            .filter_map(|id| state.results.get(&id).cloned().map(|r| (id, r)))
            .collect()
    }

    /// Wait until every id has a terminal result, in the order given.
    ///
    /// Timing out abandons the wait only; the operations keep running.
    pub async fn await_results(
        &self,
        ids: &[OperationId],
        timeout: Duration,
    ) -> Result<Vec<BatchResult>, SchedulerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pending = {
                let state = self.shared.lock();
                let mut pending = Vec::new();
                for id in ids {
                    if state.results.contains_key(id) {
                        continue;
                    }
                    if !state.is_known(id) {
                        return Err(SchedulerError::UnknownOperation(id.clone()));
                    }
                    pending.push(id.clone());
                }
                if pending.is_empty() {
                    return Ok(ids
                        .iter()
                        .filter_map(|id| state.results.get(id).cloned())
                        .collect());
                }
                pending
            };

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SchedulerError::Timeout { pending });
            }
        }
    }

    pub fn phase(&self, id: &str) -> Option<OperationPhase> {
        let state = self.shared.lock();
        if let Some(pending) = state.pending.get(id) {
            return Some(pending.phase);
        }
        if let Some(leader) = state.waiting.get(id) {
            return state.pending.get(leader).map(|p| p.phase);
        }
        state.results.get(id).map(BatchResult::phase)
    }

    pub fn result(&self, id: &str) -> Option<BatchResult> {
        self.shared.lock().results.get(id).cloned()
    }

    /// Read-only snapshot.
    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        let is_queued = |id: &OperationId| {
            state
                .pending
                .get(id)
                .is_some_and(|p| p.phase == OperationPhase::Queued)
        };
        // Followers share their leader's phase.
        let queued = state.pending.keys().filter(|id| is_queued(id)).count()
            + state.waiting.values().filter(|leader| is_queued(leader)).count();
        SchedulerStats {
            queued,
            in_flight: state.in_flight,
            succeeded: state.succeeded,
            failed: state.failed,
            total_cost: state.total_cost,
            avg_latency_ms: if state.latency_samples == 0 {
                0.0
            } else {
                state.latency_total_ms as f64 / state.latency_samples as f64
            },
            cache_hit_rate: if state.submitted == 0 {
                0.0
            } else {
                state.cache_hits as f64 / state.submitted as f64
            },
            submitted: state.submitted,
            cache_hits: state.cache_hits,
            retries: state.retries,
            timeouts: state.timeouts,
            deduplicated: state.deduplicated,
            peak_in_flight: state.peak_in_flight,
        }
    }

    /// Run a background dispatcher. Idempotent.
    pub fn start(&self) {
        let mut slot = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            loop {
                shared.drive().await;
                if shared.lock().shutting_down {
                    break;
                }
                shared.work.notified().await;
            }
        }));
        tracing::info!(
            max_concurrency = self.shared.settings.max_concurrency,
            "Scheduler dispatcher started"
        );
    }

    /// Reject new submissions, finish everything already accepted, and
    /// stop the background dispatcher.
    pub async fn shutdown(&self) {
        self.shared.lock().shutting_down = true;
        self.shared.work.notify_one();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Scheduler dispatcher ended abnormally");
                }
            }
            None => self.shared.drive().await,
        }
        tracing::info!("Scheduler drained");
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use storyloom_cache::{DurableCache, HotCache, InMemoryStore, PolicyTable};
    use storyloom_core::{ContentType, Usage};

    /// Echoes the prompt after `delay`; fails the first `failures` calls.
    struct ScriptedGenerator {
        delay: Duration,
        failures: Mutex<VecDeque<GenerationError>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                failures: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn failing(self, errors: impl IntoIterator<Item = GenerationError>) -> Self {
            self.failures.lock().unwrap().extend(errors);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, GenerationError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(GenerationResponse {
                content: format!("generated: {}", request.prompt),
                usage: Usage::new(10, 20),
                cost: 0.01,
                model: request.model,
            })
        }
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            max_concurrency: 1,
            max_retries: 2,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            single_flight: true,
            result_retention: 100,
        }
    }

    fn cache() -> Arc<CacheManager> {
        Arc::new(CacheManager::new(
            HotCache::new(64, Duration::from_secs(600)),
            Some(DurableCache::new(Arc::new(InMemoryStore::new()), PolicyTable::new())),
        ))
    }

    fn scheduler_with(
        settings: SchedulerSettings,
        generator: Arc<ScriptedGenerator>,
        cache: Arc<CacheManager>,
    ) -> BatchScheduler {
        BatchScheduler::new(settings, generator, cache, Arc::new(CostLedger::new()))
    }

    fn op(id: &str, prompt: &str) -> BatchOperation {
        BatchOperation::new("chapter", GenerationRequest::new(prompt, "m")).with_id(id)
    }

    #[tokio::test]
    async fn dispatches_by_priority_then_fifo() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let scheduler = scheduler_with(settings(), generator.clone(), cache());
        scheduler.submit(op("a", "low-1").with_priority(1)).await.unwrap();
        scheduler.submit(op("b", "high").with_priority(5)).await.unwrap();
        scheduler.submit(op("c", "low-2").with_priority(1)).await.unwrap();
        scheduler.submit(op("d", "mid").with_priority(3)).await.unwrap();

        let results = scheduler.run_all().await;
        assert_eq!(results.len(), 4);
        assert!(results.values().all(|r| r.success && !r.cached));
        assert_eq!(generator.prompts(), vec!["high", "mid", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn hot_hit_bypasses_queue() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let cache = cache();
        let scheduler = scheduler_with(settings(), generator.clone(), cache.clone());
        scheduler.submit(op("first", "same prompt")).await.unwrap();
        scheduler.run_all().await;

        let id = scheduler.submit(op("second", "same prompt")).await.unwrap();
        assert_eq!(scheduler.phase(&id), Some(OperationPhase::Succeeded));
        let result = scheduler.result(&id).unwrap();
        assert!(result.cached);
        assert_eq!(result.processing_time_ms, 0);
        assert_eq!(result.cost, 0.0);
        assert_eq!(result.content.as_deref(), Some("generated: same prompt"));
        assert_eq!(generator.calls(), 1);
        assert!((scheduler.stats().cache_hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn durable_hit_warms_hot_layer() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let cache = cache();
        let scheduler = scheduler_with(settings(), generator.clone(), cache.clone());
        let desc = DurableDescriptor::new(ContentType::WorldBuilding, "owner-1");
        scheduler
            .submit(op("w1", "world").with_durable(desc.clone()))
            .await
            .unwrap();
        scheduler.run_all().await;
        cache.hot().clear();

        let id = scheduler
            .submit(op("w2", "world, reworded").with_durable(desc))
            .await
            .unwrap();
        let result = scheduler.result(&id).unwrap();
        assert!(result.cached);
        assert_eq!(result.content.as_deref(), Some("generated: world"));
        assert_eq!(generator.calls(), 1);
        assert_eq!(cache.hot().len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let generator = Arc::new(
            ScriptedGenerator::new(Duration::ZERO)
                .failing([GenerationError::Authentication("bad key".into())]),
        );
        let scheduler = scheduler_with(settings(), generator.clone(), cache());
        scheduler.submit(op("x", "p")).await.unwrap();
        let result = scheduler.run_all().await.remove("x").unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("authentication"));
        assert_eq!(result.cost, 0.0);
        assert_eq!(generator.calls(), 1);
        assert_eq!(scheduler.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_honours_retry_after() {
        let generator = Arc::new(
            ScriptedGenerator::new(Duration::ZERO)
                .failing([GenerationError::RateLimited { retry_after_secs: Some(3) }]),
        );
        let scheduler = scheduler_with(settings(), generator.clone(), cache());
        let started = Instant::now();
        scheduler.submit(op("x", "p")).await.unwrap();
        let result = scheduler.run_all().await.remove("x").unwrap();
        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_then_fail() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_secs(60)));
        let scheduler = scheduler_with(
            SchedulerSettings {
                timeout: Duration::from_secs(1),
                max_retries: 1,
                ..settings()
            },
            generator.clone(),
            cache(),
        );
        scheduler.submit(op("slow", "p")).await.unwrap();
        let result = scheduler.run_all().await.remove("slow").unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind.as_deref(), Some("timeout"));
        assert_eq!(generator.calls(), 2);
        let stats = scheduler.stats();
        assert_eq!(stats.timeouts, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_requests_share_one_call() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_millis(50)));
        let scheduler = scheduler_with(settings(), generator.clone(), cache());
        scheduler.submit(op("leader", "same")).await.unwrap();
        scheduler.submit(op("follower", "same")).await.unwrap();
        assert_eq!(scheduler.phase("follower"), Some(OperationPhase::Queued));

        let results = scheduler.run_all().await;
        assert_eq!(generator.calls(), 1);
        let leader = &results["leader"];
        let follower = &results["follower"];
        assert!(!leader.cached);
        assert!(follower.cached);
        assert_eq!(follower.cost, 0.0);
        assert_eq!(leader.content, follower.content);
        assert_eq!(scheduler.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn run_all_reports_only_new_results() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let scheduler = scheduler_with(settings(), generator, cache());
        scheduler.submit(op("a", "one")).await.unwrap();
        assert_eq!(scheduler.run_all().await.len(), 1);
        scheduler.submit(op("b", "two")).await.unwrap();
        let second = scheduler.run_all().await;
        assert_eq!(second.len(), 1);
        assert!(second.contains_key("b"));
        assert!(scheduler.run_all().await.is_empty());
    }

    #[tokio::test]
    async fn retention_evicts_oldest_results() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let scheduler = scheduler_with(
            SchedulerSettings {
                result_retention: 2,
                ..settings()
            },
            generator,
            cache(),
        );
        for (id, prompt) in [("a", "1"), ("b", "2"), ("c", "3")] {
            scheduler.submit(op(id, prompt)).await.unwrap();
            scheduler.run_all().await;
        }
        assert!(scheduler.result("a").is_none());
        assert!(scheduler.result("c").is_some());
        let err = scheduler
            .await_results(&["a".to_string()], Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::UnknownOperation("a".into()));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let scheduler = scheduler_with(settings(), generator, cache());
        scheduler.submit(op("a", "one")).await.unwrap();
        let err = scheduler.submit(op("a", "two")).await.unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateOperation("a".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_flight_discards_write() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_secs(1)));
        let cache = cache();
        let scheduler = Arc::new(scheduler_with(settings(), generator, cache.clone()));
        scheduler.submit(op("a", "p")).await.unwrap();

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_all().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.phase("a"), Some(OperationPhase::Processing));
        cache.invalidate("unrelated").await.unwrap();

        let results = runner.await.unwrap();
        assert!(results["a"].success);
        assert!(cache.hot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn followers_of_a_running_leader_are_not_queued() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::from_secs(1)));
        let scheduler = Arc::new(scheduler_with(settings(), generator, cache()));
        scheduler.submit(op("leader", "same")).await.unwrap();
        scheduler.submit(op("early", "same")).await.unwrap();
        assert_eq!(scheduler.stats().queued, 2);

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_all().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.phase("leader"), Some(OperationPhase::Processing));
        scheduler.submit(op("late", "same")).await.unwrap();
        scheduler.submit(op("other", "different")).await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.queued, 1);

        runner.await.unwrap();
        assert_eq!(scheduler.stats().queued, 0);
    }

    #[tokio::test]
    async fn shutdown_drains_and_rejects() {
        let generator = Arc::new(ScriptedGenerator::new(Duration::ZERO));
        let scheduler = scheduler_with(settings(), generator.clone(), cache());
        scheduler.start();
        let id = scheduler.submit(op("a", "p")).await.unwrap();
        scheduler.shutdown().await;
        assert_eq!(scheduler.phase(&id), Some(OperationPhase::Succeeded));
        assert_eq!(
            scheduler.submit(op("b", "q")).await.unwrap_err(),
            SchedulerError::ShuttingDown
        );
    }
}
