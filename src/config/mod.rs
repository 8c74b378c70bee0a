//! YAML run settings.
//!
//! The settings file keeps the grouping of the original experiment configs
//! (`MODEL`, `DATASET`, `TRAIN`, `TEST`, `INFERENCE`). Parsing happens in two steps:
//!
//! 1. [`Settings::load`] deserializes the raw file (upper-case keys, loose types)
//! 2. [`RunConfig::resolve`] validates everything and produces typed values
//!
//! All configuration errors surface in step 2, before any price data is read.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::domain::{Architecture, DateRange, Device, Indicator, LabelHorizon, LookbackProfile};
use crate::error::AppError;

/// Longest calendar gap between consecutive bars accepted by default.
///
/// Covers the regular week-long exchange closures (Lunar New Year, National Day)
/// including their surrounding weekends.
pub const DEFAULT_MAX_GAP_DAYS: i64 = 14;

/// Raw settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Settings {
    pub model: String,
    #[serde(default = "default_device")]
    pub device: String,
    pub dataset: DatasetSettings,
    pub train: TrainSettings,
    pub test: TestSettings,
    #[serde(default)]
    pub inference: InferenceSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DatasetSettings {
    pub lookback_win: usize,
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub show_volume: bool,
    #[serde(default = "default_parallel_num")]
    pub parallel_num: usize,
    #[serde(default = "default_fraction")]
    pub fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Explicit universe; `None` means every symbol in the price store.
    #[serde(default)]
    pub symbols: Option<Vec<String>>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: usize,
    #[serde(default = "default_max_gap_days")]
    pub max_gap_days: i64,
    /// Long-format CSV file or a directory of per-symbol CSVs.
    pub prices: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TrainSettings {
    pub label: LabelHorizon,
    pub start_date: RawDate,
    pub end_date: RawDate,
    pub model_save_file: PathBuf,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_train_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub weight_decay: f32,
    /// Trailing share of the TRAIN range held out for validation.
    #[serde(default = "default_valid_ratio")]
    pub valid_ratio: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TestSettings {
    pub start_date: RawDate,
    pub end_date: RawDate,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct InferenceSettings {
    #[serde(default = "default_factors_file")]
    pub factors_save_file: PathBuf,
    #[serde(default = "default_sub_range_months")]
    pub sub_range_months: u32,
    /// Optional cap on images per model call; `None` scores a symbol in one call.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            factors_save_file: default_factors_file(),
            sub_range_months: default_sub_range_months(),
            batch_size: None,
        }
    }
}

/// Dates appear as `20200101` integers in older configs and as strings in newer ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawDate {
    Int(u32),
    Text(String),
}

impl RawDate {
    pub fn resolve(&self) -> Result<NaiveDate, AppError> {
        let text = match self {
            RawDate::Int(v) => v.to_string(),
            RawDate::Text(s) => s.trim().to_string(),
        };
        parse_date(&text).ok_or_else(|| AppError::config(format!("Invalid date '{text}'.")))
    }
}

/// Parse `YYYY-MM-DD` or `YYYYMMDD`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%Y%m%d"))
        .ok()
}

fn default_device() -> String {
    "cpu".to_string()
}
fn default_parallel_num() -> usize {
    1
}
fn default_fraction() -> f64 {
    1.0
}
fn default_seed() -> u64 {
    42
}
fn default_sample_rate() -> usize {
    1
}
fn default_max_gap_days() -> i64 {
    DEFAULT_MAX_GAP_DAYS
}
fn default_epochs() -> usize {
    10
}
fn default_learning_rate() -> f32 {
    1e-3
}
fn default_train_batch_size() -> usize {
    32
}
fn default_valid_ratio() -> f64 {
    0.2
}
fn default_factors_file() -> PathBuf {
    PathBuf::from("factors/up_factor.csv")
}
fn default_sub_range_months() -> u32 {
    3
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|e| {
            AppError::io(format!("Failed to read settings '{}': {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, AppError> {
        serde_yaml::from_str(text).map_err(|e| AppError::config(format!("Invalid settings YAML: {e}")))
    }
}

/// Command-line overrides layered on top of the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub fraction: Option<f64>,
    pub jobs: Option<usize>,
    pub epochs: Option<usize>,
    pub seed: Option<u64>,
}

/// Everything the dataset builder needs.
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub profile: LookbackProfile,
    pub indicators: Vec<Indicator>,
    pub show_volume: bool,
    pub parallel_num: usize,
    pub fraction: f64,
    pub seed: u64,
    pub symbols: Option<Vec<String>>,
    pub sample_rate: usize,
    pub max_gap_days: i64,
    pub label: LabelHorizon,
}

impl DatasetConfig {
    /// Bars of history needed before the first window bar for indicators.
    pub fn indicator_warmup(&self) -> usize {
        self.indicators
            .iter()
            .map(|i| i.warmup().saturating_sub(1))
            .max()
            .unwrap_or(0)
    }
}

/// Optimisation settings for the `train` command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    pub range: DateRange,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub valid_ratio: f64,
    pub seed: u64,
}

/// Fully validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub architecture: Architecture,
    pub device: Device,
    pub dataset: DatasetConfig,
    pub prices: PathBuf,
    pub train: TrainConfig,
    pub test_range: DateRange,
    pub checkpoint: PathBuf,
    pub factors_file: PathBuf,
    pub sub_range_months: u32,
    pub batch_size: Option<usize>,
}

impl RunConfig {
    pub fn resolve(settings: &Settings, overrides: &Overrides) -> Result<Self, AppError> {
        let architecture: Architecture = settings.model.parse()?;
        let device: Device = settings.device.parse()?;

        let ds = &settings.dataset;
        let profile = LookbackProfile::from_days(ds.lookback_win)?;
        if profile != architecture.profile() {
            return Err(AppError::config(format!(
                "LOOKBACK_WIN {} does not match model {} (expects {}).",
                ds.lookback_win,
                architecture,
                architecture.profile().days()
            )));
        }

        let indicators = ds
            .indicators
            .iter()
            .map(|raw| Indicator::parse(raw, profile.days()))
            .collect::<Result<Vec<_>, _>>()?;

        let fraction = overrides.fraction.unwrap_or(ds.fraction);
        if !(fraction.is_finite() && fraction > 0.0 && fraction <= 1.0) {
            return Err(AppError::config(format!(
                "FRACTION must be in (0, 1], got {fraction}."
            )));
        }

        let parallel_num = overrides.jobs.unwrap_or(ds.parallel_num);
        if parallel_num == 0 {
            return Err(AppError::config("PARALLEL_NUM must be at least 1."));
        }
        if ds.sample_rate == 0 {
            return Err(AppError::config("SAMPLE_RATE must be at least 1."));
        }
        if ds.max_gap_days < 1 {
            return Err(AppError::config("MAX_GAP_DAYS must be at least 1."));
        }
        if let Some(symbols) = &ds.symbols {
            if symbols.is_empty() {
                return Err(AppError::config(
                    "SYMBOLS is an empty list; omit it to use every available symbol.",
                ));
            }
        }

        let tr = &settings.train;
        let train = TrainConfig {
            range: DateRange::new(tr.start_date.resolve()?, tr.end_date.resolve()?)?,
            epochs: overrides.epochs.unwrap_or(tr.epochs),
            batch_size: tr.batch_size,
            learning_rate: tr.learning_rate,
            weight_decay: tr.weight_decay,
            valid_ratio: tr.valid_ratio,
            seed: overrides.seed.unwrap_or(tr.seed),
        };
        if train.epochs == 0 {
            return Err(AppError::config("EPOCHS must be at least 1."));
        }
        if train.batch_size == 0 {
            return Err(AppError::config("TRAIN.BATCH_SIZE must be at least 1."));
        }
        if !(train.learning_rate.is_finite() && train.learning_rate > 0.0) {
            return Err(AppError::config(format!(
                "LEARNING_RATE must be positive, got {}.",
                train.learning_rate
            )));
        }
        if !(train.weight_decay.is_finite() && train.weight_decay >= 0.0) {
            return Err(AppError::config(format!(
                "WEIGHT_DECAY must be non-negative, got {}.",
                train.weight_decay
            )));
        }
        if !(0.0..1.0).contains(&train.valid_ratio) {
            return Err(AppError::config(format!(
                "VALID_RATIO must be in [0, 1), got {}.",
                train.valid_ratio
            )));
        }
        let test_range = DateRange::new(
            overrides
                .start
                .map(Ok)
                .unwrap_or_else(|| settings.test.start_date.resolve())?,
            overrides
                .end
                .map(Ok)
                .unwrap_or_else(|| settings.test.end_date.resolve())?,
        )?;

        let inf = &settings.inference;
        if inf.sub_range_months == 0 {
            return Err(AppError::config("SUB_RANGE_MONTHS must be at least 1."));
        }
        if inf.batch_size == Some(0) {
            return Err(AppError::config("BATCH_SIZE must be at least 1 when set."));
        }

        let mut symbols = ds.symbols.clone();
        if let Some(list) = symbols.as_mut() {
            list.sort();
            list.dedup();
        }

        Ok(Self {
            architecture,
            device,
            dataset: DatasetConfig {
                profile,
                indicators,
                show_volume: ds.show_volume,
                parallel_num,
                fraction,
                seed: ds.seed,
                symbols,
                sample_rate: ds.sample_rate,
                max_gap_days: ds.max_gap_days,
                label: settings.train.label,
            },
            prices: ds.prices.clone(),
            train,
            test_range,
            checkpoint: overrides
                .checkpoint
                .clone()
                .unwrap_or_else(|| settings.train.model_save_file.clone()),
            factors_file: overrides
                .output
                .clone()
                .unwrap_or_else(|| inf.factors_save_file.clone()),
            sub_range_months: inf.sub_range_months,
            batch_size: inf.batch_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const BASE: &str = r#"
MODEL: CNN5d
DATASET:
  LOOKBACK_WIN: 5
  INDICATORS: [MA]
  SHOW_VOLUME: true
  PARALLEL_NUM: 4
  PRICES: data/prices.csv
TRAIN:
  LABEL: RET5
  START_DATE: 20150101
  END_DATE: "2019-12-31"
  MODEL_SAVE_FILE: models/cnn5d.json
TEST:
  START_DATE: 20200101
  END_DATE: 20201231
INFERENCE:
  FACTORS_SAVE_FILE: factors/cnn5d/up.csv
"#;

    fn resolve(yaml: &str) -> Result<RunConfig, AppError> {
        let settings = Settings::from_yaml(yaml)?;
        RunConfig::resolve(&settings, &Overrides::default())
    }

    #[test]
    fn resolves_original_style_config() {
        let cfg = resolve(BASE).unwrap();
        assert_eq!(cfg.architecture, Architecture::Cnn5d);
        assert_eq!(cfg.device, Device::Cpu);
        assert_eq!(cfg.dataset.indicators, vec![Indicator::MovingAverage { period: 5 }]);
        assert_eq!(cfg.dataset.parallel_num, 4);
        assert_eq!(cfg.dataset.fraction, 1.0);
        assert_eq!(cfg.test_range.start, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        assert_eq!(cfg.train.range.end, NaiveDate::from_ymd_opt(2019, 12, 31).unwrap());
        assert_eq!(cfg.train.epochs, 10);
        assert_eq!(cfg.train.batch_size, 32);
        assert_eq!(cfg.train.valid_ratio, 0.2);
        assert_eq!(cfg.sub_range_months, 3);
        assert_eq!(cfg.checkpoint, PathBuf::from("models/cnn5d.json"));
    }

    #[test]
    fn unknown_architecture_is_configuration_error() {
        let err = resolve(&BASE.replace("CNN5d", "CNN60d")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn lookback_must_match_architecture() {
        let err = resolve(&BASE.replace("LOOKBACK_WIN: 5", "LOOKBACK_WIN: 20")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn reversed_test_range_is_rejected() {
        let yaml = BASE.replace("START_DATE: 20200101", "START_DATE: 20210101");
        let err = resolve(&yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn unknown_indicator_is_rejected() {
        let err = resolve(&BASE.replace("[MA]", "[MA, BOLL]")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn overrides_take_precedence() {
        let settings = Settings::from_yaml(BASE).unwrap();
        let overrides = Overrides {
            output: Some(PathBuf::from("out.csv")),
            start: NaiveDate::from_ymd_opt(2020, 6, 1),
            fraction: Some(0.25),
            jobs: Some(2),
            ..Overrides::default()
        };
        let cfg = RunConfig::resolve(&settings, &overrides).unwrap();
        assert_eq!(cfg.factors_file, PathBuf::from("out.csv"));
        assert_eq!(cfg.test_range.start, NaiveDate::from_ymd_opt(2020, 6, 1).unwrap());
        assert_eq!(cfg.dataset.fraction, 0.25);
        assert_eq!(cfg.dataset.parallel_num, 2);
    }

    #[test]
    fn invalid_fraction_is_rejected() {
        let settings = Settings::from_yaml(BASE).unwrap();
        let overrides = Overrides {
            fraction: Some(0.0),
            ..Overrides::default()
        };
        assert!(RunConfig::resolve(&settings, &overrides).is_err());
    }

    #[test]
    fn training_settings_are_validated() {
        let yaml = BASE.replace(
            "  MODEL_SAVE_FILE: models/cnn5d.json",
            "  MODEL_SAVE_FILE: models/cnn5d.json\n  EPOCHS: 3\n  LEARNING_RATE: 0.0005\n  VALID_RATIO: 0.25",
        );
        let cfg = resolve(&yaml).unwrap();
        assert_eq!(cfg.train.epochs, 3);
        assert!((cfg.train.learning_rate - 5e-4).abs() < 1e-9);
        assert_eq!(cfg.train.valid_ratio, 0.25);

        for bad in ["VALID_RATIO: 1.0", "EPOCHS: 0", "LEARNING_RATE: 0"] {
            let key = bad.split(':').next().unwrap();
            let line = yaml.lines().find(|l| l.trim_start().starts_with(key)).unwrap();
            let err = resolve(&yaml.replace(line, &format!("  {bad}"))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{bad}");
        }

        let settings = Settings::from_yaml(&yaml).unwrap();
        let overrides = Overrides {
            epochs: Some(7),
            seed: Some(9),
            ..Overrides::default()
        };
        let cfg = RunConfig::resolve(&settings, &overrides).unwrap();
        assert_eq!((cfg.train.epochs, cfg.train.seed), (7, 9));
    }

    #[test]
    fn default_gap_limit_spans_holiday_closures() {
        let cfg = resolve(BASE).unwrap();
        assert_eq!(cfg.dataset.max_gap_days, DEFAULT_MAX_GAP_DAYS);
        // 2024 Lunar New Year: last bar Feb 8, next bar Feb 19.
        assert!(cfg.dataset.max_gap_days >= 11);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Settings::load(Path::new("/nonexistent/settings.yaml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
