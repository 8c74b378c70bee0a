//! Price data source abstraction.

use std::collections::BTreeMap;

use crate::domain::{DateRange, PriceBar};
use crate::error::AppError;

/// Read-only access to per-symbol daily bars.
///
/// Implementations must be shareable across the dataset worker pool.
pub trait PriceStore: Send + Sync {
    /// Every symbol the store knows about, sorted.
    fn symbols(&self) -> Vec<String>;

    /// Bars for `code` with dates inside `range`, in chronological order.
    ///
    /// An unknown symbol yields an empty series, not an error.
    fn bars(&self, code: &str, range: DateRange) -> Result<Vec<PriceBar>, AppError>;
}

/// Bars held in memory, keyed by symbol.
///
/// Used by the CSV loader once parsing is done, and directly by tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPriceStore {
    series: BTreeMap<String, Vec<PriceBar>>,
}

impl InMemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a symbol's series. Bars are sorted by date.
    pub fn insert(&mut self, code: impl Into<String>, mut bars: Vec<PriceBar>) {
        bars.sort_by_key(|b| b.date);
        self.series.insert(code.into(), bars);
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn total_bars(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

impl PriceStore for InMemoryPriceStore {
    fn symbols(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    fn bars(&self, code: &str, range: DateRange) -> Result<Vec<PriceBar>, AppError> {
        let Some(series) = self.series.get(code) else {
            return Ok(Vec::new());
        };
        let lo = series.partition_point(|b| b.date < range.start);
        let hi = series.partition_point(|b| b.date <= range.end);
        Ok(series[lo..hi].to_vec())
    }
}
