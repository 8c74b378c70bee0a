//! Batch inference over a date range.

pub mod driver;
pub mod subrange;

pub use driver::{FactorTable, InferencePlan, ensure_compatible, run_inference};
pub use subrange::split_range;
