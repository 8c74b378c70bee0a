//! Image dataset construction.
//!
//! - `window`: per-symbol windowing, labels, and indicator series
//! - `builder`: parallel construction across a symbol universe

pub mod builder;
pub mod window;

pub use builder::{BuiltDataset, DatasetBuilder, fetch_range, subsample};
pub use window::{WindowStats, symbol_samples};
