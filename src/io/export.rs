//! Export the factor table to CSV.
//!
//! Columns: `code,date,up_factor`, dates in ISO format. The file is written to a
//! temporary sibling and renamed over the target, so readers never observe a
//! half-written file and a failed run leaves any previous file untouched.

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::FactorRecord;
use crate::error::AppError;

/// Write `records` to `path`, replacing any existing file.
///
/// An empty slice still produces a header-only file.
pub fn write_factors_csv(path: &Path, records: &[FactorRecord]) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("Cannot create directory {}: {e}", parent.display())))?;
    }

    let tmp = temp_sibling(path);
    if let Err(err) = write_csv(&tmp, records) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        AppError::io(format!("Cannot move factors into {}: {e}", path.display()))
    })
}

fn write_csv(path: &Path, records: &[FactorRecord]) -> Result<(), AppError> {
    let fail = |e: csv::Error| AppError::io(format!("Failed to write factor CSV {}: {e}", path.display()));

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path).map_err(fail)?;
    writer.write_record(["code", "date", "up_factor"]).map_err(fail)?;
    for r in records {
        writer.serialize(r).map_err(fail)?;
    }
    writer
        .flush()
        .map_err(|e| AppError::io(format!("Failed to flush factor CSV {}: {e}", path.display())))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "factors.csv".to_string());
    path.with_file_name(format!(".{name}.tmp-{}", std::process::id()))
}

/// Read a factor CSV back.
pub fn read_factors_csv(path: &Path) -> Result<Vec<FactorRecord>, AppError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| AppError::io(format!("Cannot open factor CSV {}: {e}", path.display())))?;
    reader
        .deserialize::<FactorRecord>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::data(format!("Malformed factor CSV {}: {e}", path.display())))
}
