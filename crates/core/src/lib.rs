//! # StoryLoom Core
//!
//! Domain types, collaborator traits, and error definitions for StoryLoom,
//! the context-optimizing, caching batch layer in front of a paid text
//! generation service. This crate has **no runtime dependencies** beyond
//! serde and chrono. It defines the model every other crate builds on.
//!
//! ## Collaborators
//!
//! The two external systems StoryLoom talks to are traits here:
//! - [`Generator`]: the remote, costed, rate-limited generation service
//! - [`DurableStore`]: the persistent key-value store behind the durable cache
//!
//! Implementations live in `storyloom-providers` and `storyloom-cache`.

pub mod complexity;
pub mod error;
pub mod generation;
pub mod narrative;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use complexity::{ChapterComplexity, ConflictLevel, EmotionalIntensity, Intensity};
pub use error::{Error, GenerationError, Result, SchedulerError, StoreError};
pub use generation::{GenerationRequest, GenerationResponse, Generator, Usage};
pub use narrative::{Entity, NarrativeState, PriorUnit, UnitPlan};
pub use store::{CacheRecord, ContentType, DurableStore, RecordQuery, RecordScan};
