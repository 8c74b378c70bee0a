//! Evaluation metrics and terminal reports.

pub mod format;

pub use format::*;

use tracing::{info, warn};

use crate::config::DatasetConfig;
use crate::data::PriceStore;
use crate::dataset::DatasetBuilder;
use crate::domain::{Image, Mode};
use crate::error::AppError;
use crate::inference::{InferencePlan, ensure_compatible, split_range};
use crate::models::{Classifier, ModelMode};

/// Probabilities are clamped to this distance from 0 and 1 before taking logs.
pub const PROB_EPS: f64 = 1e-7;

/// Labeled scoring summary for a date range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationReport {
    pub samples: usize,
    pub symbols: usize,
    /// Mean binary cross-entropy of the up probability.
    pub loss: f64,
    /// Share of samples with `|p - label| < 0.5`.
    pub accuracy: f64,
}

/// Running sums for [`EvaluationReport`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryMetrics {
    n: usize,
    loss_sum: f64,
    correct: usize,
}

impl BinaryMetrics {
    pub fn push(&mut self, up: f64, label: u8) {
        let y = f64::from(label.min(1));
        let p = up.clamp(PROB_EPS, 1.0 - PROB_EPS);
        self.loss_sum -= y * p.ln() + (1.0 - y) * (1.0 - p).ln();
        if (up - y).abs() < 0.5 {
            self.correct += 1;
        }
        self.n += 1;
    }

    pub fn count(&self) -> usize {
        self.n
    }

    /// `(loss, accuracy)`; both NaN when nothing was pushed.
    pub fn finish(&self) -> (f64, f64) {
        if self.n == 0 {
            return (f64::NAN, f64::NAN);
        }
        let n = self.n as f64;
        (self.loss_sum / n, self.correct as f64 / n)
    }
}

/// Score labeled windows in `plan.range` and compare with realised direction.
///
/// This is the forward half of a training epoch: datasets are built in training
/// mode (so only windows with a future label count), one sub-range at a time.
pub fn evaluate(
    model: &mut dyn Classifier,
    store: &dyn PriceStore,
    dataset: &DatasetConfig,
    plan: &InferencePlan,
) -> Result<EvaluationReport, AppError> {
    ensure_compatible(model, dataset)?;
    model.set_mode(ModelMode::Eval);
    let model: &dyn Classifier = model;

    let builder = DatasetBuilder::new(store, dataset)?;
    let mut metrics = BinaryMetrics::default();
    let mut symbols = std::collections::BTreeSet::new();

    for sub in split_range(plan.range, plan.sub_range_months) {
        info!("Evaluating: {sub}");
        let built = builder.build(sub, Mode::Train)?;
        for set in built.non_empty() {
            let images: Vec<&Image> = set.images().collect();
            let chunk = plan.batch_size.unwrap_or(images.len()).max(1);
            let mut labels = set.samples.iter().map(|s| s.label);
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
                for (score, label) in scores.iter().zip(labels.by_ref()) {
                    let Some(label) = label else { continue };
                    metrics.push(score.up_factor()?, label);
                }
            }
            symbols.insert(set.code.clone());
        }
    }

    let (loss, accuracy) = metrics.finish();
    if metrics.count() == 0 {
        warn!(range = %plan.range, "no labeled windows in range; metrics are undefined");
    }
    Ok(EvaluationReport {
        samples: metrics.count(),
        symbols: symbols.len(),
        loss,
        accuracy,
    })
}
