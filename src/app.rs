//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and sets up logging
//! - parses CLI arguments
//! - resolves the YAML settings
//! - dispatches to the shared pipeline and prints reports

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, InitArgs, RenderArgs, RunArgs, TrainArgs};
use crate::config::Overrides;
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `chart-cnn` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Train(args) => handle_train(&args),
        Command::Infer(args) => handle_infer(&args),
        Command::Evaluate(args) => handle_evaluate(&args),
        Command::Render(args) => handle_render(&args),
        Command::InitModel(args) => handle_init(&args),
        Command::Summary(args) => handle_summary(&args),
    }
}

/// Log to stderr; `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_train(args: &TrainArgs) -> Result<(), AppError> {
    let config = pipeline::load_run_config(&args.settings, &args.overrides())?;
    let report = pipeline::run_train(&config, args.resume)?;
    println!(
        "{}",
        crate::report::format_training(&crate::train::TrainPlan::from_config(&config), &report, &config.checkpoint)
    );
    Ok(())
}

fn handle_infer(args: &RunArgs) -> Result<(), AppError> {
    let config = pipeline::load_run_config(&args.settings, &args.overrides())?;
    let records = pipeline::run_infer(&config)?;
    println!(
        "{}",
        crate::report::format_inference_summary(config.test_range, &records, &config.factors_file)
    );
    Ok(())
}

fn handle_evaluate(args: &RunArgs) -> Result<(), AppError> {
    let config = pipeline::load_run_config(&args.settings, &args.overrides())?;
    let report = pipeline::run_evaluate(&config)?;
    println!("{}", crate::report::format_evaluation(config.test_range, &report));
    Ok(())
}

fn handle_summary(args: &RunArgs) -> Result<(), AppError> {
    let config = pipeline::load_run_config(&args.settings, &args.overrides())?;
    let built = pipeline::run_summary(&config)?;
    println!("{}", crate::report::format_dataset_summary(config.test_range, &built));
    Ok(())
}

fn handle_render(args: &RenderArgs) -> Result<(), AppError> {
    let config = pipeline::load_run_config(&args.settings, &Overrides::default())?;
    let store = pipeline::open_store(&config)?;
    let image = pipeline::render_window(&store, &config, &args.code, args.date)?;
    let title = format!("{} {}", args.code, args.date);
    print!("{}", crate::render::render_ascii(&image, &title));
    Ok(())
}

fn handle_init(args: &InitArgs) -> Result<(), AppError> {
    let overrides = Overrides {
        checkpoint: args.checkpoint.clone(),
        ..Overrides::default()
    };
    let config = pipeline::load_run_config(&args.settings, &overrides)?;
    pipeline::init_checkpoint(&config, args.seed)?;
    println!("Wrote {} checkpoint to {}", config.architecture, config.checkpoint.display());
    Ok(())
}
