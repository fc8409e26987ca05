//! Two-tier cache for StoryLoom.
//!
//! - [`HotCache`]: process-local, fixed capacity, per-entry TTL, strict LRU,
//!   keyed by a hash of the normalized request ([`key::request_key`]).
//! - [`DurableCache`]: keyed by semantic metadata over a [`DurableStore`]
//!   backend, with exact and similarity-ranked approximate lookup.
//!
//! [`CacheManager`] puts both behind one facade with an epoch-checked
//! write-through.
//!
//! [`DurableStore`]: storyloom_core::DurableStore

pub mod durable;
pub mod hot;
pub mod in_memory;
pub mod key;
pub mod manager;
pub mod policy;
pub mod similarity;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use durable::{DurableCache, DurableDescriptor, DurableLookup, DurableStats};
pub use hot::{HotCache, HotEntry, HotStats, SetOptions, SweeperHandle};
pub use in_memory::InMemoryStore;
pub use manager::{CacheManager, CacheStats, CleanupReport, DurableWarm, WriteThrough};
pub use policy::{ContentPolicy, PolicyTable};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
