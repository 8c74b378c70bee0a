//! CSV-backed price store.
//!
//! Two layouts are accepted:
//!
//! - a single long-format file with a `code` column (one row per symbol-day)
//! - a directory of `*.csv` files, one per symbol, named after the symbol
//!
//! Loading is strict about schema (missing columns fail the run with an IO error)
//! and lenient about rows: a row whose code or date cannot be read is skipped and
//! reported, a missing numeric field becomes `NaN` so that windows touching it are
//! excluded later, and duplicate `(code, date)` rows keep the first occurrence.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use tracing::{debug, info, warn};

use crate::config::parse_date;
use crate::data::store::{InMemoryPriceStore, PriceStore};
use crate::domain::{DateRange, PriceBar};
use crate::error::AppError;

/// A row-level problem encountered during load.
#[derive(Debug, Clone)]
pub struct RowError {
    pub file: PathBuf,
    pub line: usize,
    pub message: String,
}

/// What happened while loading.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub files: usize,
    pub rows_read: usize,
    pub rows_used: usize,
    /// Rows kept but with at least one `NaN` field.
    pub incomplete_rows: usize,
    pub duplicates: usize,
    pub row_errors: Vec<RowError>,
}

/// Price store loaded eagerly from CSV.
#[derive(Debug, Clone)]
pub struct CsvPriceStore {
    inner: InMemoryPriceStore,
    report: LoadReport,
}

impl CsvPriceStore {
    /// Open a CSV file or a directory of per-symbol CSV files.
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let meta = fs::metadata(path).map_err(|e| {
            AppError::io(format!("Price data '{}' is not accessible: {e}", path.display()))
        })?;

        let mut acc = Accumulator::default();
        if meta.is_dir() {
            let mut files: Vec<PathBuf> = fs::read_dir(path)
                .map_err(|e| {
                    AppError::io(format!("Failed to list price directory '{}': {e}", path.display()))
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
                })
                .collect();
            files.sort();
            for file in files {
                let code = file
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        AppError::io(format!("Unreadable file name '{}'.", file.display()))
                    })?;
                let reader = open_file(&file)?;
                acc.read(reader, &file, Some(&code))?;
            }
        } else {
            let reader = open_file(path)?;
            acc.read(reader, path, None)?;
        }

        let store = acc.finish();
        info!(
            symbols = store.inner.len(),
            bars = store.inner.total_bars(),
            rows_read = store.report.rows_read,
            skipped = store.report.row_errors.len(),
            duplicates = store.report.duplicates,
            "loaded price data from {}",
            path.display()
        );
        if !store.report.row_errors.is_empty() {
            warn!(
                "{} price rows skipped; first: {}:{} {}",
                store.report.row_errors.len(),
                store.report.row_errors[0].file.display(),
                store.report.row_errors[0].line,
                store.report.row_errors[0].message
            );
        }
        Ok(store)
    }

    /// Parse an in-memory long-format CSV (must include a `code` column).
    pub fn from_reader<R: Read>(reader: R, label: &Path) -> Result<Self, AppError> {
        let mut acc = Accumulator::default();
        acc.read(reader, label, None)?;
        Ok(acc.finish())
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }
}

impl PriceStore for CsvPriceStore {
    fn symbols(&self) -> Vec<String> {
        self.inner.symbols()
    }

    fn bars(&self, code: &str, range: DateRange) -> Result<Vec<PriceBar>, AppError> {
        self.inner.bars(code, range)
    }
}

fn open_file(path: &Path) -> Result<File, AppError> {
    File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open price CSV '{}': {e}", path.display())))
}

#[derive(Default)]
struct Accumulator {
    series: BTreeMap<String, Vec<PriceBar>>,
    seen: HashSet<(String, chrono::NaiveDate)>,
    report: LoadReport,
}

impl Accumulator {
    fn read<R: Read>(&mut self, reader: R, file: &Path, fixed_code: Option<&str>) -> Result<(), AppError> {
        self.report.files += 1;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = reader
            .headers()
            .map_err(|e| {
                AppError::io(format!("Failed to read CSV headers of '{}': {e}", file.display()))
            })?
            .clone();
        let columns = Columns::resolve(&headers, fixed_code.is_none(), file)?;

        for (idx, result) in reader.records().enumerate() {
            // records() starts after the header line; lines are 1-based.
            let line = idx + 2;
            self.report.rows_read += 1;

            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    self.row_error(file, line, format!("CSV parse error: {e}"));
                    continue;
                }
            };

            let code = match fixed_code {
                Some(code) => code.to_string(),
                None => match columns.code.and_then(|i| record.get(i)) {
                    Some(code) if !code.is_empty() => code.to_string(),
                    _ => {
                        self.row_error(file, line, "missing code".to_string());
                        continue;
                    }
                },
            };

            let raw_date = record.get(columns.date).unwrap_or("");
            let Some(date) = parse_date(raw_date) else {
                self.row_error(file, line, format!("invalid date '{raw_date}'"));
                continue;
            };

            if !self.seen.insert((code.clone(), date)) {
                self.report.duplicates += 1;
                debug!("duplicate bar {code} {date} at {}:{line}", file.display());
                continue;
            }

            let bar = PriceBar {
                date,
                open: parse_number(&record, columns.open),
                high: parse_number(&record, columns.high),
                low: parse_number(&record, columns.low),
                close: parse_number(&record, columns.close),
                volume: parse_number(&record, columns.volume),
            };
            if !bar.is_complete() {
                self.report.incomplete_rows += 1;
            }
            self.report.rows_used += 1;
            self.series.entry(code).or_default().push(bar);
        }
        Ok(())
    }

    fn row_error(&mut self, file: &Path, line: usize, message: String) {
        self.report.row_errors.push(RowError {
            file: file.to_path_buf(),
            line,
            message,
        });
    }

    fn finish(self) -> CsvPriceStore {
        let mut inner = InMemoryPriceStore::new();
        for (code, bars) in self.series {
            inner.insert(code, bars);
        }
        CsvPriceStore {
            inner,
            report: self.report,
        }
    }
}

struct Columns {
    code: Option<usize>,
    date: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: usize,
}

impl Columns {
    fn resolve(headers: &StringRecord, need_code: bool, file: &Path) -> Result<Self, AppError> {
        let map: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (normalize_header_name(name), idx))
            .collect();

        let find = |aliases: &[&str]| aliases.iter().find_map(|a| map.get(*a).copied());
        let require = |aliases: &[&str]| {
            find(aliases).ok_or_else(|| {
                AppError::io(format!(
                    "Price CSV '{}' is missing required column '{}'.",
                    file.display(),
                    aliases[0]
                ))
            })
        };

        let code = find(&["code", "symbol", "ticker"]);
        if need_code && code.is_none() {
            return Err(AppError::io(format!(
                "Price CSV '{}' is missing required column 'code'.",
                file.display()
            )));
        }

        Ok(Self {
            code,
            date: require(&["date", "trade_date", "datetime"])?,
            open: require(&["open"])?,
            high: require(&["high"])?,
            low: require(&["low"])?,
            close: require(&["close"])?,
            volume: require(&["volume", "vol"])?,
        })
    }
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports sometimes prefix the first header with a UTF-8 BOM.
    name.trim().trim_start_matches('\u{feff}').to_ascii_lowercase()
}

fn parse_number(record: &StringRecord, idx: usize) -> f64 {
    match record.get(idx) {
        Some(raw) if !raw.is_empty() => raw.parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}
