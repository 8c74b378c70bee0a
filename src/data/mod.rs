//! Price data sources.
//!
//! - `store`: the `PriceStore` trait and an in-memory implementation
//! - `csv_store`: loading bars from CSV files

pub mod csv_store;
pub mod store;

pub use csv_store::{CsvPriceStore, LoadReport, RowError};
pub use store::{InMemoryPriceStore, PriceStore};
