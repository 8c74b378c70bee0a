//! Dataset builder: runs the windowing engine over a symbol universe.
//!
//! Symbols are independent, so the work fans out on a bounded rayon pool. Each
//! worker fetches and renders exactly one symbol and returns its own set;
//! `collect` on an indexed parallel iterator keeps the output in universe order.

use chrono::Duration;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::config::DatasetConfig;
use crate::data::PriceStore;
use crate::dataset::window::{WindowStats, symbol_samples};
use crate::domain::{DateRange, Mode, SymbolImageSet};
use crate::error::AppError;

/// Output of one build: one set per universe symbol (possibly empty).
#[derive(Debug, Clone)]
pub struct BuiltDataset {
    pub sets: Vec<SymbolImageSet>,
    pub stats: WindowStats,
}

impl BuiltDataset {
    pub fn image_count(&self) -> usize {
        self.sets.iter().map(SymbolImageSet::len).sum()
    }

    pub fn non_empty(&self) -> impl Iterator<Item = &SymbolImageSet> + '_ {
        self.sets.iter().filter(|s| !s.is_empty())
    }
}

pub struct DatasetBuilder<'a> {
    store: &'a dyn PriceStore,
    config: &'a DatasetConfig,
    pool: ThreadPool,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(store: &'a dyn PriceStore, config: &'a DatasetConfig) -> Result<Self, AppError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.parallel_num.max(1))
            .thread_name(|i| format!("dataset-{i}"))
            .build()
            .map_err(|e| AppError::io(format!("Failed to start dataset worker pool: {e}")))?;
        Ok(Self { store, config, pool })
    }

    /// Symbols to build, after applying the configured list and fraction.
    pub fn universe(&self) -> Vec<String> {
        let all = match &self.config.symbols {
            Some(list) => list.clone(),
            None => self.store.symbols(),
        };
        subsample(&all, self.config.fraction, self.config.seed)
    }

    /// Build samples for every universe symbol with as-of dates in `range`.
    pub fn build(&self, range: DateRange, mode: Mode) -> Result<BuiltDataset, AppError> {
        let universe = self.universe();
        let fetch = fetch_range(range, self.config, mode);
        debug!(%range, fetch = %fetch, symbols = universe.len(), "building dataset");

        let results: Vec<(SymbolImageSet, WindowStats)> = self.pool.install(|| {
            universe
                .par_iter()
                .map(|code| -> Result<_, AppError> {
                    let bars = self.store.bars(code, fetch)?;
                    let (samples, stats) = symbol_samples(&bars, range, self.config, mode);
                    Ok((
                        SymbolImageSet {
                            code: code.clone(),
                            samples,
                        },
                        stats,
                    ))
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut stats = WindowStats::default();
        let mut sets = Vec::with_capacity(results.len());
        for (set, s) in results {
            stats.merge(&s);
            sets.push(set);
        }

        let built = BuiltDataset { sets, stats };
        info!(
            %range,
            symbols = built.sets.len(),
            with_images = built.non_empty().count(),
            images = built.image_count(),
            rejected = built.stats.rejected_total(),
            "dataset built"
        );
        Ok(built)
    }
}

/// Deterministically keep `ceil(n * fraction)` symbols, preserving input order.
pub fn subsample(symbols: &[String], fraction: f64, seed: u64) -> Vec<String> {
    if fraction >= 1.0 || symbols.is_empty() {
        return symbols.to_vec();
    }
    let keep = ((symbols.len() as f64) * fraction).ceil() as usize;
    let keep = keep.clamp(1, symbols.len());

    let mut idx: Vec<usize> = (0..symbols.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);
    idx.truncate(keep);
    idx.sort_unstable();
    idx.into_iter().map(|i| symbols[i].clone()).collect()
}

/// Widen `range` so the store returns enough history (and future, when training).
///
/// With at most `max_gap_days` between bars, `n` bars span at most
/// `n * max_gap_days` calendar days, so these margins never cut a valid window.
pub fn fetch_range(range: DateRange, config: &DatasetConfig, mode: Mode) -> DateRange {
    let history_bars = (config.profile.days() - 1 + config.indicator_warmup()) as i64;
    let back = Duration::days(history_bars * config.max_gap_days);
    let forward = match mode {
        Mode::Inference => Duration::zero(),
        Mode::Train => Duration::days(config.label.days() as i64 * config.max_gap_days),
    };
    DateRange {
        start: range.start.checked_sub_signed(back).unwrap_or(range.start),
        end: range.end.checked_add_signed(forward).unwrap_or(range.end),
    }
}
