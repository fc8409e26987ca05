//! Batch scheduling and the StoryLoom engine.
//!
//! [`BatchScheduler`] bounds how many generation calls are in flight,
//! consults the caches before dispatching, retries with backoff and times
//! out stragglers. [`Engine`] wires it to the context optimizer, the
//! caches and the cost ledger.

pub mod engine;
pub mod scheduler;
pub mod types;

pub use engine::{Engine, EngineBuilder, RequestDefaults, durable_from_config, pricing_from_config};
pub use scheduler::BatchScheduler;
pub use types::{
    BatchOperation, BatchResult, NarrativeInput, OperationId, OperationPhase, SchedulerSettings,
    SchedulerStats, WorkItem,
};
