//! The model contract used by the inference driver and the evaluation pass.

use crate::domain::{Architecture, Image};
use crate::error::AppError;

/// Number of output classes; index 0 is "down", index 1 is "up".
pub const NUM_CLASSES: usize = 2;

/// Layer behaviour switch.
///
/// The native network has no dropout or batch norm, but the switch is part of
/// the contract: scoring is only allowed in `Eval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelMode {
    #[default]
    Train,
    Eval,
}

/// Per-sample class probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassScores {
    pub down: f64,
    pub up: f64,
}

impl ClassScores {
    /// Interpret a raw output row as `[down, up]`.
    pub fn from_row(row: &[f32]) -> Result<Self, AppError> {
        match row {
            [down, up] => Ok(Self {
                down: f64::from(*down),
                up: f64::from(*up),
            }),
            _ => Err(AppError::model(format!(
                "Model returned {} class scores per sample, expected {NUM_CLASSES}.",
                row.len()
            ))),
        }
    }

    /// The up-class probability, checked to be a finite value in `[0, 1]`.
    pub fn up_factor(&self) -> Result<f64, AppError> {
        if self.up.is_finite() && (0.0..=1.0).contains(&self.up) {
            Ok(self.up)
        } else {
            Err(AppError::model(format!(
                "Model produced an invalid up score: {}.",
                self.up
            )))
        }
    }
}

/// A two-class image classifier.
///
/// `score` must be deterministic and must not change parameters; it returns
/// exactly one `ClassScores` per input image, in input order.
pub trait Classifier: Send + Sync {
    fn architecture(&self) -> Architecture;

    fn mode(&self) -> ModelMode;

    fn set_mode(&mut self, mode: ModelMode);

    fn score(&self, images: &[&Image]) -> Result<Vec<ClassScores>, AppError>;
}
