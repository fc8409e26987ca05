//! Engine: the explicit context object that owns every component.
//!
//! Built once at process start, started, and shut down explicitly. Nothing
//! here is global; tests build as many engines as they like.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use storyloom_cache::{
    CacheManager, CacheStats, CleanupReport, DurableCache, HotCache, InMemoryStore, PolicyTable,
};
use storyloom_config::{AppConfig, TelemetryConfig};
use storyloom_context::{
    ComplexityAnalyzer, CompressionReport, ContextCompressor, ContextTier, OptimizedContext,
    TierDecision, TierFeedback,
};
use storyloom_core::{
    DurableStore, Error, GenerationRequest, Generator, NarrativeState, Result, SchedulerError,
    StoreError, UnitPlan,
};
use storyloom_telemetry::{CostLedger, CostSummary, ModelPricing, PricingTable};

use crate::scheduler::BatchScheduler;
use crate::types::{BatchOperation, BatchResult, OperationId, SchedulerSettings, SchedulerStats, WorkItem};

/// Generation settings applied when a work item leaves them unset.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        let request = GenerationRequest::new("", "openai/gpt-4o-mini");
        Self {
            model: request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }
}

impl From<&AppConfig> for RequestDefaults {
    fn from(config: &AppConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            max_tokens: config.default_max_tokens,
            temperature: config.default_temperature,
        }
    }
}

/// Built-in pricing plus `[telemetry.custom_pricing]`.
pub fn pricing_from_config(config: &TelemetryConfig) -> PricingTable {
    let table = PricingTable::with_defaults();
    for (model, price) in &config.custom_pricing {
        table.set(model.clone(), ModelPricing::new(price.input_per_m, price.output_per_m));
    }
    table
}

pub struct Engine {
    defaults: RequestDefaults,
    analyzer: ComplexityAnalyzer,
    feedback: Mutex<TierFeedback>,
    compressor: ContextCompressor,
    cache: Arc<CacheManager>,
    scheduler: BatchScheduler,
    ledger: Arc<CostLedger>,
    sweep_interval: Duration,
}

#[derive(Default)]
pub struct EngineBuilder {
    generator: Option<Arc<dyn Generator>>,
    cache: Option<CacheManager>,
    settings: SchedulerSettings,
    feedback: Option<TierFeedback>,
    compressor: Option<ContextCompressor>,
    ledger: Option<Arc<CostLedger>>,
    defaults: RequestDefaults,
    sweep_interval: Duration,
}

impl EngineBuilder {
    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn scheduler(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn feedback(mut self, feedback: TierFeedback) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn compressor(mut self, compressor: ContextCompressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn defaults(mut self, defaults: RequestDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Hot-cache sweep interval used by [`Engine::start`]; zero disables it.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn build(self) -> Result<Engine> {
        let generator = self.generator.ok_or_else(|| Error::Config {
            message: "Engine needs a generator".into(),
        })?;
        let cache = Arc::new(
            self.cache
                .unwrap_or_else(|| CacheManager::hot_only(1000, Duration::from_secs(3600))),
        );
        let ledger = self.ledger.unwrap_or_default();
        let scheduler = BatchScheduler::new(
            self.settings,
            generator,
            Arc::clone(&cache),
            Arc::clone(&ledger),
        );
        Ok(Engine {
            defaults: self.defaults,
            analyzer: ComplexityAnalyzer::new(),
            feedback: Mutex::new(self.feedback.unwrap_or_default()),
            compressor: self.compressor.unwrap_or_default(),
            cache,
            scheduler,
            ledger,
            sweep_interval: self.sweep_interval,
        })
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Build every component from configuration. Opens (and migrates) the
    /// durable store.
    pub async fn from_config(config: &AppConfig, generator: Arc<dyn Generator>) -> Result<Self> {
        let cache_cfg = &config.cache;
        let durable = durable_from_config(config).await?;
        let hot = HotCache::new(cache_cfg.hot_capacity, Duration::from_secs(cache_cfg.hot_ttl_secs));

        Engine::builder()
            .generator(generator)
            .cache(CacheManager::new(hot, Some(durable)))
            .scheduler(SchedulerSettings::from(&config.scheduler))
            .feedback(TierFeedback::new(
                config.context.feedback_capacity,
                config.context.feedback_min_quality,
            ))
            .defaults(RequestDefaults::from(config))
            .sweep_interval(Duration::from_secs(cache_cfg.sweep_interval_secs))
            .build()
    }

    /// Start the background dispatcher and the hot-cache sweeper.
    pub fn start(&self) {
        self.scheduler.start();
        self.cache.start_sweeper(self.sweep_interval);
        tracing::info!("Engine started");
    }

    /// Finish accepted work, then stop the dispatcher and sweeper.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.cache.stop_sweeper();
        let summary = self.ledger.summary();
        tracing::info!(
            spent_usd = summary.spent_usd,
            saved_usd = summary.saved_usd,
            calls = summary.generation_calls,
            "Engine shut down"
        );
    }

    /// Tier selection for a plan, learned overrides included.
    pub fn select_tier(&self, plan: &UnitPlan) -> TierDecision {
        let feedback = self.feedback.lock().unwrap_or_else(PoisonError::into_inner);
        self.analyzer.select_tier(plan, &feedback)
    }

    pub fn compress(
        &self,
        state: &NarrativeState,
        plan: &UnitPlan,
    ) -> (TierDecision, OptimizedContext, CompressionReport) {
        let decision = self.select_tier(plan);
        let (context, report) = self.compressor.compress_with_report(decision.tier, state, plan);
        (decision, context, report)
    }

    /// Remember how a tier worked out for a plan of this shape.
    pub fn record_feedback(&self, plan: &UnitPlan, tier: ContextTier, quality: f32, success: bool) {
        let decision = self.analyzer.analyze(plan);
        self.feedback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&decision.signature, tier, quality, success);
        tracing::debug!(signature = %decision.signature, %tier, quality, success, "Recorded tier feedback");
    }

    fn build_operation(&self, item: WorkItem) -> BatchOperation {
        let mut prompt = item.prompt;
        if let Some(narrative) = &item.narrative {
            let (decision, context, report) = self.compress(&narrative.state, &narrative.plan);
            tracing::debug!(
                tier = %decision.tier,
                score = decision.score,
                source = ?decision.source,
                saved_tokens = report.saved_tokens,
                "Attached narrative context"
            );
            prompt.push_str("\n\nContext:\n");
            prompt.push_str(&context.render());
        }

        let mut request = GenerationRequest::new(
            prompt,
            item.model.unwrap_or_else(|| self.defaults.model.clone()),
        )
        .with_max_tokens(item.max_tokens.unwrap_or(self.defaults.max_tokens))
        .with_temperature(item.temperature.unwrap_or(self.defaults.temperature));
        request.system_prompt = item.system_prompt;

        let mut op = BatchOperation::new(item.operation, request).with_priority(item.priority);
        if let Some(id) = item.id {
            op = op.with_id(id);
        }
        if let Some(durable) = item.durable {
            op = op.with_durable(durable);
        }
        op
    }

    pub async fn submit_work(&self, item: WorkItem) -> std::result::Result<OperationId, SchedulerError> {
        let op = self.build_operation(item);
        self.scheduler.submit(op).await
    }

    pub async fn await_results(
        &self,
        ids: &[OperationId],
        timeout: Duration,
    ) -> std::result::Result<Vec<BatchResult>, SchedulerError> {
        self.scheduler.await_results(ids, timeout).await
    }

    /// Submit every item and drive them all to a terminal state.
    ///
    /// Results come back in item order; an item that could not be
    /// submitted gets a failed result.
    pub async fn run_batch(&self, items: Vec<WorkItem>) -> Vec<BatchResult> {
        let mut slots: Vec<std::result::Result<OperationId, BatchResult>> = Vec::with_capacity(items.len());
        for item in items {
            let op = self.build_operation(item);
            let id = op.id.clone();
            slots.push(match self.scheduler.submit(op).await {
                Ok(id) => Ok(id),
                Err(e) => {
                    tracing::warn!(op_id = %id, error = %e, "Work item rejected");
                    Err(BatchResult::rejected(id, &e))
                }
            });
        }

        let mut fresh: HashMap<OperationId, BatchResult> = self.scheduler.run_all().await;
        slots
            .into_iter()
            .filter_map(|slot| match slot {
                Ok(id) => fresh.remove(&id).or_else(|| self.scheduler.result(&id)),
                Err(rejected) => Some(rejected),
            })
            .collect()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn cost_summary(&self) -> CostSummary {
        self.ledger.summary()
    }

    /// Invalidate a fingerprint and everything generated from it.
    pub async fn invalidate(&self, fingerprint: &str) -> std::result::Result<usize, StoreError> {
        let removed = self.cache.invalidate(fingerprint).await?;
        tracing::info!(fingerprint = %fingerprint, removed, "Invalidated cached records");
        Ok(removed)
    }

    pub async fn cleanup(&self) -> std::result::Result<CleanupReport, StoreError> {
        self.cache.cleanup().await
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }
}

/// The configured durable cache, with policy overrides and limits applied.
pub async fn durable_from_config(config: &AppConfig) -> Result<DurableCache> {
    let cache_cfg = &config.cache;
    let store = open_store(config).await?;
    let policies = PolicyTable::new()
        .with_overrides(&cache_cfg.threshold_overrides, &cache_cfg.ttl_overrides_hours);
    Ok(DurableCache::new(store, policies)
        .with_max_records(cache_cfg.durable_max_records)
        .with_similarity_limit(cache_cfg.similarity_limit))
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn DurableStore>> {
    match config.cache.durable_backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let path = config.cache.durable_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Storage(format!("Failed to create {}: {e}", parent.display()))
                })?;
            }
            let store = storyloom_cache::SqliteStore::new(&path.to_string_lossy()).await?;
            Ok(Arc::new(store))
        }
        other => Err(Error::Config {
            message: format!("Unknown durable backend: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use storyloom_core::{GenerationError, GenerationResponse, Usage};
    use storyloom_config::PricingOverrideConfig;

    struct Echo;

    #[async_trait]
    impl Generator for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> std::result::Result<GenerationResponse, GenerationError> {
            Ok(GenerationResponse {
                content: request.prompt,
                usage: Usage::new(1, 1),
                cost: 0.001,
                model: request.model,
            })
        }
    }

    #[test]
    fn builder_requires_generator() {
        let err = Engine::builder().build().err().unwrap();
        assert!(err.to_string().contains("generator"));
    }

    #[test]
    fn custom_pricing_is_applied() {
        let mut telemetry = TelemetryConfig::default();
        telemetry.custom_pricing.insert(
            "house/model".into(),
            PricingOverrideConfig {
                input_per_m: 1.0,
                output_per_m: 2.0,
            },
        );
        let table = pricing_from_config(&telemetry);
        let cost = table.compute_cost("house/model", Usage::new(1_000_000, 1_000_000));
        assert!((cost - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn from_config_rejects_unknown_backend() {
        let mut config = AppConfig::default();
        config.cache.durable_backend = "redis".into();
        let err = Engine::from_config(&config, Arc::new(Echo)).await.err().unwrap();
        assert!(err.to_string().contains("redis"));
    }

    #[tokio::test]
    async fn narrative_context_is_attached_to_prompt() {
        let engine = Engine::builder().generator(Arc::new(Echo)).build().unwrap();
        let mut item = WorkItem::new("chapter", "Write the next chapter.");
        item.narrative = Some(crate::types::NarrativeInput {
            state: NarrativeState {
                protagonist: "Mira".into(),
                ..Default::default()
            },
            plan: UnitPlan {
                goals: vec!["find the key".into()],
                ..Default::default()
            },
        });
        let results = engine.run_batch(vec![item]).await;
        let content = results[0].content.clone().unwrap();
        assert!(content.starts_with("Write the next chapter."));
        assert!(content.contains("Mira"));
        assert!(content.contains("find the key"));
    }

    #[tokio::test]
    async fn defaults_fill_unset_settings() {
        let engine = Engine::builder()
            .generator(Arc::new(Echo))
            .defaults(RequestDefaults {
                model: "house/model".into(),
                max_tokens: 64,
                temperature: 0.1,
            })
            .build()
            .unwrap();
        let op = engine.build_operation(WorkItem::new("summary", "p"));
        assert_eq!(op.request.model, "house/model");
        assert_eq!(op.request.max_tokens, 64);
        assert!((op.request.temperature - 0.1).abs() < f32::EPSILON);
    }
}
