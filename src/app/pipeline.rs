//! Shared run logic behind the CLI subcommands.
//!
//! Each function takes a resolved [`RunConfig`] and does the I/O in a fixed order:
//! model first (so a bad checkpoint fails before any price data is read), then
//! the price store, then the work itself.

use std::path::Path;

use chrono::NaiveDate;
use tracing::info;

use crate::config::{Overrides, RunConfig, Settings};
use crate::data::{CsvPriceStore, PriceStore};
use crate::dataset::{BuiltDataset, DatasetBuilder, fetch_range, symbol_samples};
use crate::domain::{DateRange, FactorRecord, Image, Mode};
use crate::error::AppError;
use crate::inference::{InferencePlan, run_inference};
use crate::io::write_factors_csv;
use crate::models::{ConvNet, load_model};
use crate::report::{EvaluationReport, evaluate};
use crate::train::{TrainPlan, TrainingReport, train};

/// Read the settings file and apply CLI overrides.
pub fn load_run_config(path: &Path, overrides: &Overrides) -> Result<RunConfig, AppError> {
    let settings = Settings::load(path)?;
    let config = RunConfig::resolve(&settings, overrides)?;
    info!(
        model = %config.architecture,
        test = %config.test_range,
        prices = %config.prices.display(),
        "settings loaded from {}",
        path.display()
    );
    Ok(config)
}

pub fn open_store(config: &RunConfig) -> Result<CsvPriceStore, AppError> {
    CsvPriceStore::open(&config.prices)
}

/// Load the configured checkpoint, scoring on `PARALLEL_NUM` workers.
pub fn open_model(config: &RunConfig) -> Result<ConvNet, AppError> {
    load_model(&config.checkpoint, config.architecture, config.device)?.with_threads(config.dataset.parallel_num)
}

/// Fit the model on the TRAIN range and write its checkpoint.
///
/// With `resume` the existing checkpoint is the starting point; otherwise the
/// weights are freshly initialised from `TRAIN.SEED`.
pub fn run_train(config: &RunConfig, resume: bool) -> Result<TrainingReport, AppError> {
    let net = if resume {
        load_model(&config.checkpoint, config.architecture, config.device)?
    } else {
        ConvNet::initialized(config.architecture, config.device, config.train.seed)
    };
    let mut net = net.with_threads(config.dataset.parallel_num)?;
    let store = open_store(config)?;
    train_with(&mut net, &store, config)
}

/// Training against an already constructed model and store.
///
/// The checkpoint is only written once training has finished.
pub fn train_with(
    net: &mut ConvNet,
    store: &dyn PriceStore,
    config: &RunConfig,
) -> Result<TrainingReport, AppError> {
    let report = train(net, store, &config.dataset, &TrainPlan::from_config(config))?;
    net.checkpoint().write(&config.checkpoint)?;
    info!(
        model = %config.architecture,
        best_epoch = ?report.best_epoch,
        "trained checkpoint written to {}",
        config.checkpoint.display()
    );
    Ok(report)
}

/// Full inference run: score the TEST range and write the factor CSV.
///
/// Returns the rows written, sorted by `(code, date)`.
pub fn run_infer(config: &RunConfig) -> Result<Vec<FactorRecord>, AppError> {
    let mut model = open_model(config)?;
    let store = open_store(config)?;
    infer_with(&mut model, &store, config)
}

/// Inference against an already constructed model and store.
pub fn infer_with(
    model: &mut ConvNet,
    store: &dyn PriceStore,
    config: &RunConfig,
) -> Result<Vec<FactorRecord>, AppError> {
    let plan = InferencePlan::from_config(config);
    let table = run_inference(model, store, &config.dataset, &plan)?;
    let records = table.sorted();
    write_factors_csv(&config.factors_file, &records)?;
    info!(
        rows = records.len(),
        "factors written to {}",
        config.factors_file.display()
    );
    Ok(records)
}

/// Labeled scoring over the TEST range.
pub fn run_evaluate(config: &RunConfig) -> Result<EvaluationReport, AppError> {
    let mut model = open_model(config)?;
    let store = open_store(config)?;
    evaluate(
        &mut model,
        &store,
        &config.dataset,
        &InferencePlan::from_config(config),
    )
}

/// Inference-mode dataset for the TEST range, without scoring.
pub fn run_summary(config: &RunConfig) -> Result<BuiltDataset, AppError> {
    let store = open_store(config)?;
    DatasetBuilder::new(&store, &config.dataset)?.build(config.test_range, Mode::Inference)
}

/// Render the single window of `code` ending on `date`.
pub fn render_window(
    store: &dyn PriceStore,
    config: &RunConfig,
    code: &str,
    date: NaiveDate,
) -> Result<Image, AppError> {
    let day = DateRange::new(date, date)?;
    let bars = store.bars(code, fetch_range(day, &config.dataset, Mode::Inference))?;
    let (mut samples, stats) = symbol_samples(&bars, day, &config.dataset, Mode::Inference);
    match samples.pop() {
        Some(sample) => Ok(sample.image),
        None if !bars.iter().any(|b| b.date == date) => Err(AppError::data(format!(
            "No bar for {code} on {date}."
        ))),
        None => {
            let reasons: Vec<&str> = stats.rejected.keys().copied().collect();
            let why = if stats.short_history > 0 {
                "insufficient history".to_string()
            } else {
                reasons.join(", ")
            };
            Err(AppError::data(format!(
                "No valid window for {code} as of {date}: {why}."
            )))
        }
    }
}

/// Write a freshly initialised checkpoint for the configured architecture.
pub fn init_checkpoint(config: &RunConfig, seed: u64) -> Result<(), AppError> {
    let net = ConvNet::initialized(config.architecture, config.device, seed);
    net.checkpoint().write(&config.checkpoint)?;
    info!(
        model = %config.architecture,
        seed,
        "initialised checkpoint written to {}",
        config.checkpoint.display()
    );
    Ok(())
}
