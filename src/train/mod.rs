//! Training driver.
//!
//! Builds labeled datasets for the TRAIN range, holds out its trailing share of
//! calendar days for validation, and runs Adam over shuffled mini-batches. After
//! every epoch the held-out windows are scored in evaluation mode, and the
//! network ends up with the parameters of the epoch with the lowest validation
//! loss. Without a validation part the last epoch's parameters are kept.

use chrono::Duration;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{DatasetConfig, RunConfig};
use crate::data::PriceStore;
use crate::dataset::{BuiltDataset, DatasetBuilder};
use crate::domain::{DateRange, Image, Mode};
use crate::error::AppError;
use crate::inference::ensure_compatible;
use crate::models::{Adam, Classifier, ConvNet, ModelMode};
use crate::report::BinaryMetrics;

/// Ranges and optimiser settings for one training run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainPlan {
    pub train: DateRange,
    pub validation: Option<DateRange>,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub seed: u64,
}

impl TrainPlan {
    pub fn from_config(config: &RunConfig) -> Self {
        let t = &config.train;
        let (train, validation) = split_validation(t.range, t.valid_ratio);
        Self {
            train,
            validation,
            epochs: t.epochs,
            batch_size: t.batch_size,
            learning_rate: t.learning_rate,
            weight_decay: t.weight_decay,
            seed: t.seed,
        }
    }
}

/// Split off the trailing `ratio` of `range`'s calendar days.
///
/// No validation part when the held-out share rounds to zero days or to the
/// whole range.
pub fn split_validation(range: DateRange, ratio: f64) -> (DateRange, Option<DateRange>) {
    let days = (range.end - range.start).num_days() + 1;
    let held = (days as f64 * ratio).round() as i64;
    if held <= 0 || held >= days {
        return (range, None);
    }
    let cut = range.end - Duration::days(held);
    (
        DateRange {
            start: range.start,
            end: cut,
        },
        Some(DateRange {
            start: cut + Duration::days(1),
            end: range.end,
        }),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    /// NaN without validation samples.
    pub val_loss: f64,
    pub val_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub train_samples: usize,
    pub validation_samples: usize,
    pub epochs: Vec<EpochStats>,
    /// Epoch whose parameters were kept; `None` when there was no validation.
    pub best_epoch: Option<usize>,
}

/// Fit `net` on the labeled windows of `plan.train`.
///
/// Leaves the network in evaluation mode.
pub fn train(
    net: &mut ConvNet,
    store: &dyn PriceStore,
    dataset: &DatasetConfig,
    plan: &TrainPlan,
) -> Result<TrainingReport, AppError> {
    ensure_compatible(net, dataset)?;

    let builder = DatasetBuilder::new(store, dataset)?;
    let train_set = labeled(builder.build(plan.train, Mode::Train)?);
    if train_set.is_empty() {
        return Err(AppError::data(format!(
            "No labeled windows to train on in {}.",
            plan.train
        )));
    }
    let val_set = match plan.validation {
        Some(range) => labeled(builder.build(range, Mode::Train)?),
        None => Vec::new(),
    };
    if plan.validation.is_some() && val_set.is_empty() {
        warn!("validation range has no labeled windows; keeping the last epoch");
    }
    info!(
        model = %net.architecture(),
        train = train_set.len(),
        validation = val_set.len(),
        epochs = plan.epochs,
        batch = plan.batch_size,
        threads = net.threads(),
        "training on {}",
        plan.train
    );

    let mut optimizer = Adam::new(plan.learning_rate, plan.weight_decay);
    let mut rng = StdRng::seed_from_u64(plan.seed);
    let mut order: Vec<usize> = (0..train_set.len()).collect();
    let mut epochs = Vec::with_capacity(plan.epochs);
    let mut best: Option<(usize, f64, ConvNet)> = None;

    for epoch in 0..plan.epochs {
        net.set_mode(ModelMode::Train);
        order.shuffle(&mut rng);

        let (mut loss_sum, mut correct) = (0.0, 0);
        for (i, chunk) in order.chunks(plan.batch_size.max(1)).enumerate() {
            let batch: Vec<(&Image, u8)> = chunk
                .iter()
                .map(|&k| (&train_set[k].0, train_set[k].1))
                .collect();
            let step = net.batch_gradients(&batch)?;
            loss_sum += step.loss;
            correct += step.correct;
            debug!(epoch, batch = i, loss = step.loss / step.samples.max(1) as f64);

            let step = step.mean();
            optimizer.step(net.parameters_mut(), &step.grads.slices())?;
        }

        let n = train_set.len() as f64;
        let (val_loss, val_accuracy) = validate(net, &val_set, plan.batch_size)?;
        let stats = EpochStats {
            epoch,
            train_loss: loss_sum / n,
            train_accuracy: correct as f64 / n,
            val_loss,
            val_accuracy,
        };
        info!(
            "| Epoch: {epoch} | Loss: {:.4} | Validation Loss: {:.4} | Accuracy: {:.4} |",
            stats.train_loss, stats.val_loss, stats.val_accuracy
        );
        epochs.push(stats);

        if val_loss.is_finite() && best.as_ref().is_none_or(|(_, loss, _)| val_loss < *loss) {
            best = Some((epoch, val_loss, net.clone()));
        }
    }

    let best_epoch = best.map(|(epoch, loss, params)| {
        *net = params;
        info!(epoch, loss, "kept parameters of the best validation epoch");
        epoch
    });
    net.set_mode(ModelMode::Eval);

    Ok(TrainingReport {
        train_samples: train_set.len(),
        validation_samples: val_set.len(),
        epochs,
        best_epoch,
    })
}

fn labeled(built: BuiltDataset) -> Vec<(Image, u8)> {
    built
        .sets
        .into_iter()
        .flat_map(|set| set.samples)
        .filter_map(|s| s.label.map(|label| (s.image, label)))
        .collect()
}

/// `(loss, accuracy)` on held-out windows; NaN for an empty set.
fn validate(net: &mut ConvNet, set: &[(Image, u8)], batch_size: usize) -> Result<(f64, f64), AppError> {
    net.set_mode(ModelMode::Eval);
    let mut metrics = BinaryMetrics::default();
    for chunk in set.chunks(batch_size.max(1)) {
        let images: Vec<&Image> = chunk.iter().map(|(image, _)| image).collect();
        let scores = net.score(&images)?;
        for (score, (_, label)) in scores.iter().zip(chunk) {
            metrics.push(score.up_factor()?, *label);
        }
    }
    Ok(metrics.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    use crate::config::DEFAULT_MAX_GAP_DAYS;
    use crate::data::InMemoryPriceStore;
    use crate::domain::{Architecture, Device, LabelHorizon, LookbackProfile, PriceBar};
    use crate::error::ErrorKind;

    fn date(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn range(from: NaiveDate, to: NaiveDate) -> DateRange {
        DateRange::new(from, to).unwrap()
    }

    fn dataset(sample_rate: usize) -> DatasetConfig {
        DatasetConfig {
            profile: LookbackProfile::FiveDay,
            indicators: vec![],
            show_volume: true,
            parallel_num: 2,
            fraction: 1.0,
            seed: 1,
            symbols: None,
            sample_rate,
            max_gap_days: DEFAULT_MAX_GAP_DAYS,
            label: LabelHorizon::Ret5,
        }
    }

    /// Daily bars from 2024-01-01, trending by `drift` per day with a small zigzag.
    fn trending(n: i64, drift: f64) -> Vec<PriceBar> {
        (0..n)
            .map(|i| {
                let base = 50.0 + drift * i as f64 + if i % 2 == 0 { 0.6 } else { 0.0 };
                PriceBar {
                    date: date(1, 1) + Duration::days(i),
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.3,
                    volume: 1_000.0 + 10.0 * (i % 7) as f64,
                }
            })
            .collect()
    }

    fn store() -> InMemoryPriceStore {
        let mut store = InMemoryPriceStore::new();
        store.insert("UP", trending(30, 1.0));
        store.insert("DOWN", trending(30, -1.0));
        store
    }

    fn plan(validation: Option<DateRange>) -> TrainPlan {
        TrainPlan {
            train: range(date(1, 1), date(1, 15)),
            validation,
            epochs: 2,
            batch_size: 4,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            seed: 5,
        }
    }

    #[test]
    fn validation_is_the_trailing_share() {
        let full = range(date(1, 1), date(1, 20));
        let (train, val) = split_validation(full, 0.25);
        assert_eq!(train, range(date(1, 1), date(1, 15)));
        assert_eq!(val, Some(range(date(1, 16), date(1, 20))));

        assert_eq!(split_validation(full, 0.0), (full, None));
        let one_day = range(date(1, 1), date(1, 1));
        assert_eq!(split_validation(one_day, 0.3), (one_day, None));
    }

    #[test]
    fn trains_and_keeps_best_validation_epoch() {
        let store = store();
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 3)
            .with_threads(2)
            .unwrap();
        let before = net.checkpoint();

        let plan = plan(Some(range(date(1, 16), date(1, 20))));
        let report = train(&mut net, &store, &dataset(2), &plan).unwrap();

        // Odd January days are on the stride of 2: as-of 5..=15 for training,
        // 17 and 19 for validation, on both symbols.
        assert_eq!(report.train_samples, 12);
        assert_eq!(report.validation_samples, 4);
        assert_eq!(report.epochs.len(), 2);
        assert!(report.best_epoch.is_some());
        for e in &report.epochs {
            assert!(e.train_loss.is_finite());
            assert!((0.0..=1.0).contains(&e.train_accuracy));
            assert!(e.val_loss.is_finite());
        }
        assert_eq!(net.mode(), ModelMode::Eval);
        assert_ne!(net.checkpoint(), before);
    }

    #[test]
    fn without_validation_keeps_last_epoch() {
        let store = store();
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 3);
        let mut plan = plan(None);
        plan.epochs = 1;
        plan.train = range(date(1, 5), date(1, 9));
        let report = train(&mut net, &store, &dataset(2), &plan).unwrap();
        assert_eq!(report.train_samples, 6);
        assert_eq!(report.best_epoch, None);
        assert!(report.epochs[0].val_loss.is_nan());
    }

    #[test]
    fn empty_training_range_is_data_error() {
        let store = store();
        let mut net = ConvNet::initialized(Architecture::Cnn5d, Device::Cpu, 3);
        let mut plan = plan(None);
        // Labels need five later bars; the store ends on Jan 30.
        plan.train = range(date(1, 27), date(1, 30));
        let err = train(&mut net, &store, &dataset(1), &plan).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DataQuality);
    }

    #[test]
    fn architecture_mismatch_fails_before_building() {
        let store = store();
        let mut net = ConvNet::initialized(Architecture::Cnn20d, Device::Cpu, 3);
        let err = train(&mut net, &store, &dataset(1), &plan(None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
