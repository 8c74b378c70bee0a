//! JSON checkpoint format.
//!
//! ```json
//! {
//!   "architecture": "CNN5d",
//!   "tensors": {
//!     "conv1.weight": { "shape": [64, 1, 5, 3], "values": [ ... ] },
//!     ...
//!   }
//! }
//! ```
//!
//! Tensor names and shapes follow the PyTorch state dict of the same network.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::Architecture;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Kept as text so an unknown name surfaces as a configuration error.
    pub architecture: String,
    pub tensors: BTreeMap<String, TensorData>,
}

impl Checkpoint {
    pub fn read(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path)
            .map_err(|e| AppError::io(format!("Cannot open checkpoint {}: {e}", path.display())))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            AppError::model(format!("Malformed checkpoint {}: {e}", path.display()))
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::io(format!("Cannot create directory {}: {e}", parent.display()))
            })?;
        }
        let file = File::create(path)
            .map_err(|e| AppError::io(format!("Cannot create checkpoint {}: {e}", path.display())))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)
            .map_err(|e| AppError::io(format!("Cannot write checkpoint {}: {e}", path.display())))?;
        writer
            .flush()
            .map_err(|e| AppError::io(format!("Cannot write checkpoint {}: {e}", path.display())))
    }

    /// Fail unless the checkpoint was produced for `expected`.
    pub fn ensure_architecture(&self, expected: Architecture) -> Result<(), AppError> {
        let declared: Architecture = self.architecture.parse()?;
        if declared != expected {
            return Err(AppError::config(format!(
                "Checkpoint is for {declared} but the configured model is {expected}."
            )));
        }
        Ok(())
    }

    /// Look up a tensor and check its shape and element count.
    pub fn tensor(&self, name: &str, shape: &[usize]) -> Result<&TensorData, AppError> {
        let t = self
            .tensors
            .get(name)
            .ok_or_else(|| AppError::model(format!("Checkpoint is missing tensor '{name}'.")))?;
        if t.shape != shape {
            return Err(AppError::model(format!(
                "Tensor '{name}' has shape {:?}, expected {:?}.",
                t.shape, shape
            )));
        }
        let expected: usize = shape.iter().product();
        if t.values.len() != expected {
            return Err(AppError::model(format!(
                "Tensor '{name}' holds {} values, its shape needs {expected}.",
                t.values.len()
            )));
        }
        Ok(t)
    }
}
