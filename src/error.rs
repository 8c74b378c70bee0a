//! Error types.
//!
//! Run-level failures are an [`AppError`] tagged with an [`ErrorKind`]; the kind
//! decides the process exit code. Window-level data problems are a separate
//! [`DataQualityError`] so the dataset code can drop a window and keep going.

use chrono::NaiveDate;

/// Broad failure category for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad settings: unknown architecture/indicator, malformed date range, etc.
    Configuration,
    /// Source data or output path unavailable.
    Io,
    /// Invalid bar data that escaped local handling.
    DataQuality,
    /// Scoring failed: shape or checkpoint mismatch, bad scores.
    ModelInvocation,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Configuration => 2,
            ErrorKind::Io => 3,
            ErrorKind::DataQuality => 4,
            ErrorKind::ModelInvocation => 5,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Io => "io error",
            ErrorKind::DataQuality => "data quality error",
            ErrorKind::ModelInvocation => "model invocation error",
        }
    }
}

#[derive(Clone, thiserror::Error)]
#[error("{}: {message}", kind.label())]
pub struct AppError {
    kind: ErrorKind,
    message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataQuality, message)
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ModelInvocation, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn exit_code(&self) -> u8 {
        self.kind.exit_code()
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

/// Why a single window was rejected.
///
/// These never abort a run: the windowing engine counts them and moves on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataQualityError {
    #[error("missing or NaN field in bar dated {0}")]
    MissingValue(NaiveDate),
    #[error("non-positive price in bar dated {0}")]
    NonPositivePrice(NaiveDate),
    #[error("negative volume in bar dated {0}")]
    NegativeVolume(NaiveDate),
    #[error("window price range is zero")]
    FlatRange,
    #[error("{flat} no-trade days exceed the limit of {limit}")]
    TooManyFlatDays { flat: usize, limit: usize },
    #[error("indicator undefined at {0} (insufficient history)")]
    IndicatorUndefined(NaiveDate),
    #[error("calendar gap of {days} days before {date}")]
    CalendarGap { date: NaiveDate, days: i64 },
    #[error("window has {got} bars, expected {expected}")]
    ShapeMismatch { expected: usize, got: usize },
}

impl DataQualityError {
    /// Short stable label used when tallying rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            DataQualityError::MissingValue(_) => "missing_value",
            DataQualityError::NonPositivePrice(_) => "non_positive_price",
            DataQualityError::NegativeVolume(_) => "negative_volume",
            DataQualityError::FlatRange => "flat_range",
            DataQualityError::TooManyFlatDays { .. } => "too_many_flat_days",
            DataQualityError::IndicatorUndefined(_) => "indicator_undefined",
            DataQualityError::CalendarGap { .. } => "calendar_gap",
            DataQualityError::ShapeMismatch { .. } => "shape_mismatch",
        }
    }
}

impl From<DataQualityError> for AppError {
    fn from(value: DataQualityError) -> Self {
        AppError::data(value.to_string())
    }
}
