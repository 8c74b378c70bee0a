//! Shared domain types.
//!
//! These are deliberately plain data: bars and windows flow from the price store
//! into the renderer, images flow into the model, factor records flow out.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// One trading day of OHLCV data for a single symbol.
///
/// Missing numeric fields are stored as `NaN`; windows that touch them are
/// rejected by the renderer rather than interpolated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl PriceBar {
    /// True when every numeric field is finite.
    pub fn is_complete(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
    }

    /// A day without any price movement (`open == high == low == close`).
    pub fn is_flat(&self) -> bool {
        self.open == self.high && self.high == self.low && self.low == self.close
    }
}

/// `L` consecutive bars ending at the as-of date, plus aligned indicator values.
///
/// Borrowed from the symbol's full series; windows are built, rendered, and
/// dropped without copying bars.
#[derive(Debug, Clone)]
pub struct Window<'a> {
    pub bars: &'a [PriceBar],
    /// One slice per enabled indicator, each aligned with `bars`.
    pub overlays: Vec<&'a [f64]>,
}

impl Window<'_> {
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Date of the last bar.
    pub fn as_of(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, AppError> {
        if start > end {
            return Err(AppError::config(format!(
                "Malformed date range: start {start} is after end {end}."
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Number of calendar days covered (both ends inclusive).
    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start, self.end)
    }
}

/// The two supported lookback/image geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookbackProfile {
    /// 5 trading days rendered as 32×15.
    FiveDay,
    /// 20 trading days rendered as 64×60.
    TwentyDay,
}

impl LookbackProfile {
    pub fn from_days(days: usize) -> Result<Self, AppError> {
        match days {
            5 => Ok(LookbackProfile::FiveDay),
            20 => Ok(LookbackProfile::TwentyDay),
            other => Err(AppError::config(format!(
                "Unsupported lookback window {other}; expected 5 or 20."
            ))),
        }
    }

    /// Window length `L` in trading days.
    pub fn days(self) -> usize {
        match self {
            LookbackProfile::FiveDay => 5,
            LookbackProfile::TwentyDay => 20,
        }
    }

    pub fn image_height(self) -> usize {
        match self {
            LookbackProfile::FiveDay => 32,
            LookbackProfile::TwentyDay => 64,
        }
    }

    /// Three pixel columns per day: open tick, high-low bar, close tick.
    pub fn image_width(self) -> usize {
        self.days() * 3
    }

    /// `(levels, row_offset)` available to price marks.
    ///
    /// With volume enabled the bottom of the image is reserved for volume bars
    /// plus a one-row gap.
    pub fn price_levels(self, show_volume: bool) -> (usize, usize) {
        match (self, show_volume) {
            (_, false) => (self.image_height(), 0),
            (LookbackProfile::FiveDay, true) => (25, 7),
            (LookbackProfile::TwentyDay, true) => (51, 13),
        }
    }

    /// Number of rows a full-height volume bar may fill.
    pub fn volume_levels(self) -> usize {
        match self {
            LookbackProfile::FiveDay => 6,
            LookbackProfile::TwentyDay => 12,
        }
    }

    /// Maximum number of no-trade days tolerated in one window.
    pub fn max_flat_days(self) -> usize {
        self.days() / 5
    }
}

/// Closed set of network architectures; each one is tied to a lookback profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Cnn5d,
    Cnn20d,
}

impl Architecture {
    pub fn name(self) -> &'static str {
        match self {
            Architecture::Cnn5d => "CNN5d",
            Architecture::Cnn20d => "CNN20d",
        }
    }

    pub fn profile(self) -> LookbackProfile {
        match self {
            Architecture::Cnn5d => LookbackProfile::FiveDay,
            Architecture::Cnn20d => LookbackProfile::TwentyDay,
        }
    }

    /// `(channels, height, width)` of one input sample.
    pub fn input_shape(self) -> (usize, usize, usize) {
        let p = self.profile();
        (1, p.image_height(), p.image_width())
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "CNN5d" => Ok(Architecture::Cnn5d),
            "CNN20d" => Ok(Architecture::Cnn20d),
            other => Err(AppError::config(format!(
                "Wrong model template: {other} (expected CNN5d or CNN20d)."
            ))),
        }
    }
}

/// Compute device for the native model.
///
/// Only the CPU path exists; the value is still threaded through model
/// construction so nothing reads ambient process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
}

impl FromStr for Device {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            other => Err(AppError::config(format!(
                "Unsupported device '{other}'; only 'cpu' is available."
            ))),
        }
    }
}

/// Price overlays drawn on top of the bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    /// Simple moving average of closes over `period` trading days.
    MovingAverage { period: usize },
}

impl Indicator {
    /// Parse `MA` (period = lookback length) or `MA<n>`.
    pub fn parse(raw: &str, lookback: usize) -> Result<Self, AppError> {
        let name = raw.trim().to_ascii_uppercase();
        let Some(rest) = name.strip_prefix("MA") else {
            return Err(AppError::config(format!("Unknown indicator '{raw}'.")));
        };
        let period = if rest.is_empty() {
            lookback
        } else {
            rest.parse::<usize>()
                .map_err(|_| AppError::config(format!("Unknown indicator '{raw}'.")))?
        };
        if period == 0 {
            return Err(AppError::config(format!("Indicator '{raw}' needs a period > 0.")));
        }
        Ok(Indicator::MovingAverage { period })
    }

    /// Bars of history (including the current one) needed for a defined value.
    pub fn warmup(self) -> usize {
        match self {
            Indicator::MovingAverage { period } => period,
        }
    }
}

/// Forward return horizon used for training labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelHorizon {
    #[serde(rename = "RET5")]
    Ret5,
    #[serde(rename = "RET20")]
    Ret20,
}

impl LabelHorizon {
    pub fn days(self) -> usize {
        match self {
            LabelHorizon::Ret5 => 5,
            LabelHorizon::Ret20 => 20,
        }
    }
}

/// Whether windows need a forward label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Inference,
}

/// A rendered price/volume window.
///
/// Row 0 is the top of the chart. Pixels are either 0 or 255.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    height: usize,
    width: usize,
    pixels: Vec<u8>,
}

impl Image {
    pub fn blank(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            pixels: vec![0; height * width],
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.pixels[row * self.width + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: u8) {
        self.pixels[row * self.width + col] = value;
    }

    /// Row-major pixel buffer.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn lit_count(&self) -> usize {
        self.pixels.iter().filter(|&&p| p > 0).count()
    }
}

/// One model input with its as-of date (and label in training mode).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: Image,
    pub date: NaiveDate,
    /// 1 if the forward return is positive, else 0. `None` in inference mode.
    pub label: Option<u8>,
}

/// All samples for one symbol within a date range, ordered by as-of date.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolImageSet {
    pub code: String,
    pub samples: Vec<Sample>,
}

impl SymbolImageSet {
    pub fn empty(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            samples: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.samples.iter().map(|s| s.date)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> + '_ {
        self.samples.iter().map(|s| &s.image)
    }
}

/// One output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorRecord {
    pub code: String,
    pub date: NaiveDate,
    pub up_factor: f64,
}
