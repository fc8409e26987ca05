mod common;

use std::time::Duration;

use common::{
    Behavior, Gate, GatedStore, MockGenerator, engine, engine_with_cache, gated_cache, settings,
};
use serde_json::{Map, json};
use storyloom_cache::DurableDescriptor;
use storyloom_core::{ContentType, GenerationError, SchedulerError};
use storyloom_scheduler::{OperationPhase, WorkItem};

fn foundation(prompt: &str) -> WorkItem {
    let mut item = WorkItem::new("foundation", prompt);
    item.durable = Some(DurableDescriptor::new(ContentType::StoryFoundation, "story-1"));
    item
}

#[tokio::test(start_paused = true)]
async fn processing_never_exceeds_max_concurrency() {
    let generator = MockGenerator::echo(Duration::from_millis(100));
    let engine = engine(generator.clone(), settings(3, 0));
    engine.start();

    let mut ids = Vec::new();
    for i in 0..10 {
        let id = engine
            .submit_work(WorkItem::new("chapter", format!("chapter {i}")))
            .await
            .unwrap();
        ids.push(id);
    }

    loop {
        let phases: Vec<_> = ids.iter().map(|id| engine.scheduler().phase(id)).collect();
        let processing = phases
            .iter()
            .filter(|p| **p == Some(OperationPhase::Processing))
            .count();
        assert!(processing <= 3, "{processing} operations processing at once");
        if phases.iter().all(|p| p.is_some_and(OperationPhase::is_terminal)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(7)).await;
    }

    let results = engine.await_results(&ids, Duration::from_secs(1)).await.unwrap();
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(generator.calls(), 10);
    assert_eq!(generator.peak(), 3);
    assert_eq!(engine.scheduler_stats().peak_in_flight, 3);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn results_follow_requested_order_not_completion_order() {
    let generator = MockGenerator::echo(Duration::from_millis(10));
    let engine = engine(generator, settings(4, 0));
    engine.start();

    let mut ids = Vec::new();
    for (i, priority) in [1, 9, 5].into_iter().enumerate() {
        let mut item = WorkItem::new("summary", format!("unit {i}"));
        item.priority = priority;
        ids.push(engine.submit_work(item).await.unwrap());
    }
    let results = engine.await_results(&ids, Duration::from_secs(5)).await.unwrap();
    let returned: Vec<_> = results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(returned, ids);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn always_failing_operation_is_retried_exactly_max_retries_times() {
    let generator = MockGenerator::new(
        Duration::ZERO,
        Behavior::AlwaysFail(GenerationError::Unavailable("503 Service Unavailable".into())),
    );
    let engine = engine(generator.clone(), settings(2, 3));

    let results = engine.run_batch(vec![WorkItem::new("chapter", "doomed")]).await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(!result.success);
    assert_eq!(result.error_kind.as_deref(), Some("unavailable"));
    assert_eq!(result.attempts, 4);
    assert_eq!(result.cost, 0.0);
    assert_eq!(generator.calls(), 4);

    let stats = engine.scheduler_stats();
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.queued, 0);

    assert!(engine.scheduler().run_all().await.is_empty());
    assert_eq!(generator.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn identical_concurrent_requests_make_one_call() {
    let generator = MockGenerator::echo(Duration::from_millis(50));
    let engine = engine(generator.clone(), settings(3, 0));
    engine.start();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            engine
                .submit_work(WorkItem::new("outline", "outline for book one"))
                .await
                .unwrap(),
        );
    }
    let results = engine.await_results(&ids, Duration::from_secs(5)).await.unwrap();
    assert_eq!(generator.calls(), 1);
    assert_eq!(results.iter().filter(|r| r.cached).count(), 2);
    assert!(results.iter().all(|r| r.content == results[0].content));
    assert_eq!(engine.scheduler_stats().deduplicated, 2);
    assert!(engine.cost_summary().saved_single_flight_usd > 0.0);
    engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn abandoned_wait_does_not_cancel_the_operation() {
    let generator = MockGenerator::echo(Duration::from_secs(10));
    let mut scheduler_settings = settings(1, 0);
    scheduler_settings.timeout = Duration::from_secs(60);
    let engine = engine(generator, scheduler_settings);
    engine.start();

    let id = engine
        .submit_work(WorkItem::new("chapter", "slow chapter"))
        .await
        .unwrap();
    let ids = vec![id.clone()];
    let err = engine
        .await_results(&ids, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, SchedulerError::Timeout { pending: vec![id.clone()] });

    let results = engine.await_results(&ids, Duration::from_secs(30)).await.unwrap();
    assert!(results[0].success);
    engine.shutdown().await;
}

#[tokio::test]
async fn awaiting_unknown_operation_fails_fast() {
    let engine = engine(MockGenerator::echo(Duration::ZERO), settings(1, 0));
    let err = engine
        .await_results(&["nope".to_string()], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, SchedulerError::UnknownOperation("nope".into()));
}

#[tokio::test]
async fn durable_hit_racing_an_invalidation_is_regenerated() {
    let store = GatedStore::new();
    let generator = MockGenerator::echo(Duration::ZERO);
    let engine = engine_with_cache(generator.clone(), settings(1, 0), gated_cache(store.clone()));

    engine.run_batch(vec![foundation("First draft.")]).await;
    let record = engine
        .cache()
        .durable()
        .unwrap()
        .get_exact(ContentType::StoryFoundation, "story-1", &Map::new())
        .await
        .unwrap()
        .unwrap();

    // Park the second lookup after it read the record, then invalidate.
    store.arm(Gate::RecordHit);
    let (submitted, removed) = tokio::join!(engine.submit_work(foundation("Second draft.")), async {
        store.entered().await;
        let removed = engine.invalidate(&record.fingerprint).await;
        store.release();
        removed
    });
    assert_eq!(removed.unwrap(), 1);

    let id = submitted.unwrap();
    let results = engine.scheduler().run_all().await;
    let result = &results[&id];
    assert!(result.success);
    assert!(!result.cached);
    assert_eq!(result.content.as_deref(), Some("story for: Second draft."));
    assert_eq!(generator.calls(), 2);
    assert_eq!(engine.cost_summary().saved_durable_usd, 0.0);
    let stale = engine
        .cache()
        .hot()
        .remove_where(|entry| entry.content == "story for: First draft.");
    assert_eq!(stale, 0);
}

#[tokio::test]
async fn durable_write_racing_an_invalidation_is_dropped() {
    let store = GatedStore::new();
    let generator = MockGenerator::echo(Duration::ZERO);
    let engine = engine_with_cache(generator.clone(), settings(1, 0), gated_cache(store.clone()));

    engine.run_batch(vec![foundation("Build the story foundation.")]).await;
    let record = engine
        .cache()
        .durable()
        .unwrap()
        .get_exact(ContentType::StoryFoundation, "story-1", &Map::new())
        .await
        .unwrap()
        .unwrap();

    let chapter = || {
        let mut desc = DurableDescriptor::new(ContentType::ChapterContent, "story-1");
        desc.metadata.insert("chapter".into(), json!(1));
        desc.dependency_fingerprint = Some(record.fingerprint.clone());
        let mut item = WorkItem::new("chapter", "Write chapter one.");
        item.durable = Some(desc);
        item
    };

    // The chapter's insert lands after the foundation it depends on is gone.
    store.arm(Gate::Insert);
    let (results, removed) = tokio::join!(engine.run_batch(vec![chapter()]), async {
        store.entered().await;
        let removed = engine.invalidate(&record.fingerprint).await;
        store.release();
        removed
    });
    assert_eq!(removed.unwrap(), 1);
    assert!(results[0].success && !results[0].cached);

    let durable = engine.cache().durable().unwrap();
    assert_eq!(durable.store().count().await.unwrap(), 0);
    assert!(engine.cache().hot().is_empty());

    let rerun = engine.run_batch(vec![chapter()]).await;
    assert!(rerun[0].success && !rerun[0].cached);
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn duplicate_id_is_rejected_across_a_durable_lookup() {
    let store = GatedStore::new();
    let generator = MockGenerator::echo(Duration::ZERO);
    let engine = engine_with_cache(generator.clone(), settings(1, 0), gated_cache(store.clone()));

    let world = |prompt: &str| {
        let mut item = WorkItem::new("world", prompt);
        item.id = Some("dup".into());
        item.durable = Some(DurableDescriptor::new(ContentType::WorldBuilding, "story-5"));
        item
    };

    store.arm(Gate::Get);
    let (first, second) = tokio::join!(engine.submit_work(world("The drowned city.")), async {
        store.entered().await;
        let second = engine.submit_work(world("The salt marsh.")).await;
        store.release();
        second
    });
    assert_eq!(second.unwrap(), "dup");
    assert!(matches!(first, Err(SchedulerError::DuplicateOperation(ref id)) if id == "dup"));

    let results = engine.scheduler().run_all().await;
    assert_eq!(results.len(), 1);
    assert_eq!(results["dup"].content.as_deref(), Some("story for: The salt marsh."));
    assert_eq!(generator.calls(), 1);
}
