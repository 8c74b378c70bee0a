//! Image classifiers.
//!
//! The driver only sees the [`Classifier`] trait; [`ConvNet`] is the native CPU
//! network for both lookback profiles, loaded from a JSON [`Checkpoint`] and
//! trained with [`Adam`].

pub mod checkpoint;
pub mod classifier;
pub mod convnet;
pub mod optim;

pub use checkpoint::{Checkpoint, TensorData};
pub use classifier::{ClassScores, Classifier, ModelMode, NUM_CLASSES};
pub use convnet::{BatchGradients, ConvNet, Gradients};
pub use optim::Adam;

use std::path::Path;

use crate::domain::{Architecture, Device};
use crate::error::AppError;

/// Construct the configured architecture and load its parameters from `path`.
pub fn load_model(path: &Path, architecture: Architecture, device: Device) -> Result<ConvNet, AppError> {
    let checkpoint = Checkpoint::read(path)?;
    ConvNet::from_checkpoint(&checkpoint, architecture, device)
}
