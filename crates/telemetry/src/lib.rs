//! Cost tracking for StoryLoom.
//!
//! Provides a pricing table for estimating what a generation call costs and
//! a ledger that accumulates real spend alongside the spend avoided by the
//! caches.

pub mod ledger;
pub mod pricing;

pub use ledger::{CostLedger, CostSummary, SavingsSource};
pub use pricing::{ModelPricing, PricingTable};
