//! Inference driver.
//!
//! Walks the sub-ranges of the global range in date order. For each one it
//! builds the dataset in inference mode, scores every non-empty symbol set as one
//! batch (optionally chunked), and appends `(code, date, up_factor)` rows to the
//! result table. Only one sub-range of images is alive at a time.

use tracing::{debug, info, warn};

use crate::config::{DatasetConfig, RunConfig};
use crate::data::PriceStore;
use crate::dataset::DatasetBuilder;
use crate::domain::{DateRange, FactorRecord, Image, Mode, SymbolImageSet};
use crate::error::AppError;
use crate::inference::subrange::split_range;
use crate::models::{Classifier, ModelMode};

/// Range and batching policy for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferencePlan {
    pub range: DateRange,
    pub sub_range_months: u32,
    /// Upper bound on images per model call; `None` scores a symbol in one call.
    pub batch_size: Option<usize>,
}

impl InferencePlan {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            range: config.test_range,
            sub_range_months: config.sub_range_months,
            batch_size: config.batch_size,
        }
    }
}

/// Accumulated output rows. Order is insertion order, not meaningful.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactorTable {
    records: Vec<FactorRecord>,
}

impl FactorTable {
    pub fn records(&self) -> &[FactorRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows ordered by `(code, date)`.
    pub fn sorted(mut self) -> Vec<FactorRecord> {
        self.records
            .sort_by(|a, b| a.code.cmp(&b.code).then(a.date.cmp(&b.date)));
        self.records
    }

    /// Distinct symbols present in the table.
    pub fn symbol_count(&self) -> usize {
        let mut codes: Vec<&str> = self.records.iter().map(|r| r.code.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();
        codes.len()
    }
}

/// Score every valid window in `plan.range` and collect the up factors.
///
/// The model is switched to evaluation mode first and is otherwise only read.
pub fn run_inference(
    model: &mut dyn Classifier,
    store: &dyn PriceStore,
    dataset: &DatasetConfig,
    plan: &InferencePlan,
) -> Result<FactorTable, AppError> {
    ensure_compatible(model, dataset)?;
    model.set_mode(ModelMode::Eval);
    let model: &dyn Classifier = model;

    let builder = DatasetBuilder::new(store, dataset)?;
    let mut table = FactorTable::default();

    for sub in split_range(plan.range, plan.sub_range_months) {
        info!("Inferencing: {sub}");
        let built = builder.build(sub, Mode::Inference)?;
        let before = table.len();
        for set in built.non_empty() {
            score_set(model, set, plan.batch_size, &mut table)?;
        }
        debug!(%sub, rows = table.len() - before, "sub-range scored");
    }

    if table.is_empty() {
        warn!(range = %plan.range, "no valid windows in range; factor table is empty");
    } else {
        info!(rows = table.len(), symbols = table.symbol_count(), "inference complete");
    }
    Ok(table)
}

/// Fail when the model's input profile differs from the dataset's.
pub fn ensure_compatible(model: &dyn Classifier, dataset: &DatasetConfig) -> Result<(), AppError> {
    let arch = model.architecture();
    if arch.profile() != dataset.profile {
        return Err(AppError::config(format!(
            "Model {arch} expects a {}-day lookback, dataset uses {} days.",
            arch.profile().days(),
            dataset.profile.days()
        )));
    }
    Ok(())
}

fn score_set(
    model: &dyn Classifier,
    set: &SymbolImageSet,
    batch_size: Option<usize>,
    table: &mut FactorTable,
) -> Result<(), AppError> {
    let images: Vec<&Image> = set.images().collect();
    let chunk = batch_size.unwrap_or(images.len()).max(1);

    let mut dates = set.dates();
    for batch in images.chunks(chunk) {
        let scores = model.score(batch)?;
        if scores.len() != batch.len() {
            return Err(AppError::model(format!(
                "Model returned {} scores for {} images of {}.",
                scores.len(),
                batch.len(),
                set.code
            )));
        }
        for (score, date) in scores.iter().zip(dates.by_ref()) {
            table.records.push(FactorRecord {
                code: set.code.clone(),
                date,
                up_factor: score.up_factor()?,
            });
        }
    }
    Ok(())
}
