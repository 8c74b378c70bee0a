//! Command-line parsing.
//!
//! Parsing and dispatch stay separate from the dataset and model code. Every
//! subcommand reads the same YAML settings file; flags only override a few
//! run-level values.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::config::{Overrides, parse_date};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(
    name = "chart-cnn",
    version,
    about = "Render price windows as chart images and score them with a CNN up-factor model"
)]
pub struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence when set).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit the configured model on the TRAIN range and save the checkpoint.
    Train(TrainArgs),
    /// Score every valid window in the TEST range and write the factor CSV.
    Infer(RunArgs),
    /// Score labeled windows in the TEST range and print loss/accuracy.
    Evaluate(RunArgs),
    /// Print an ASCII preview of one symbol's window image.
    Render(RenderArgs),
    /// Write a freshly initialised checkpoint for the configured model.
    InitModel(InitArgs),
    /// Build the TEST-range dataset and print per-symbol counts.
    Summary(RunArgs),
}

/// Settings file plus run-level overrides.
#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// YAML settings file.
    #[arg(value_name = "SETTINGS")]
    pub settings: PathBuf,

    /// Factor CSV path (overrides INFERENCE.FACTORS_SAVE_FILE).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Checkpoint path (overrides TRAIN.MODEL_SAVE_FILE).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// First as-of date (YYYY-MM-DD or YYYYMMDD).
    #[arg(long, value_parser = parse_cli_date)]
    pub start: Option<NaiveDate>,

    /// Last as-of date (YYYY-MM-DD or YYYYMMDD).
    #[arg(long, value_parser = parse_cli_date)]
    pub end: Option<NaiveDate>,

    /// Share of the symbol universe to use, in (0, 1].
    #[arg(long)]
    pub fraction: Option<f64>,

    /// Worker threads for dataset construction and scoring.
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

impl RunArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            output: self.output.clone(),
            checkpoint: self.checkpoint.clone(),
            start: self.start,
            end: self.end,
            fraction: self.fraction,
            jobs: self.jobs,
            ..Overrides::default()
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct TrainArgs {
    /// YAML settings file.
    #[arg(value_name = "SETTINGS")]
    pub settings: PathBuf,

    /// Checkpoint to write (overrides TRAIN.MODEL_SAVE_FILE).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Continue from the existing checkpoint instead of fresh weights.
    #[arg(long)]
    pub resume: bool,

    /// Number of epochs (overrides TRAIN.EPOCHS).
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Seed for initialisation and shuffling (overrides TRAIN.SEED).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Share of the symbol universe to use, in (0, 1].
    #[arg(long)]
    pub fraction: Option<f64>,

    /// Worker threads for dataset construction and gradients.
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

impl TrainArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            checkpoint: self.checkpoint.clone(),
            fraction: self.fraction,
            jobs: self.jobs,
            epochs: self.epochs,
            seed: self.seed,
            ..Overrides::default()
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// YAML settings file.
    #[arg(value_name = "SETTINGS")]
    pub settings: PathBuf,

    /// Symbol code.
    #[arg(long)]
    pub code: String,

    /// As-of date of the window.
    #[arg(long, value_parser = parse_cli_date)]
    pub date: NaiveDate,
}

#[derive(Debug, Args, Clone)]
pub struct InitArgs {
    /// YAML settings file.
    #[arg(value_name = "SETTINGS")]
    pub settings: PathBuf,

    /// Seed for weight initialisation.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Where to write the checkpoint (overrides TRAIN.MODEL_SAVE_FILE).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
}

fn parse_cli_date(raw: &str) -> Result<NaiveDate, String> {
    parse_date(raw).ok_or_else(|| format!("invalid date '{raw}', expected YYYY-MM-DD or YYYYMMDD"))
}
