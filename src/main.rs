//! Command-line runner for the retina_screen engine.
//!
//! Grading needs a model; this runner exposes the model-free stages: normalizing a
//! fundus photograph and mapping a regression score to a clinical stage.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use retina_screen::ScreeningConfig;
use retina_screen::core_modules::normalizer::normalize;
use retina_screen::core_modules::severity::classify;
use retina_screen::core_modules::utils::image_helper::{load_rgb, save_png};

/// Diabetic retinopathy screening tools.
#[derive(Parser, Debug)]
#[command(name = "retina_screen")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON file with a screening configuration; missing fields use defaults.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crop, resize and contrast-enhance a fundus photograph.
    Normalize {
        /// Input image path.
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output PNG path.
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Side length of the square output; overrides the configuration.
        #[arg(long, value_name = "PIXELS")]
        size: Option<u32>,

        /// Gaussian sigma of the background estimate; overrides the configuration.
        #[arg(long, value_name = "FLOAT")]
        sigma: Option<f32>,
    },

    /// Map a regression score to a clinical stage and print it as JSON.
    Classify {
        /// Regression score, nominally between 0 and 4.
        #[arg(value_name = "SCORE", allow_hyphen_values = true)]
        score: f64,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("retina_screen={log_level}").into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(err) = run(&args) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn load_config(path: Option<&Path>) -> Result<ScreeningConfig> {
    let Some(path) = path else {
        return Ok(ScreeningConfig::default());
    };
    let file = File::open(path)
        .with_context(|| format!("Failed to open config {}", path.display()))?;
    let config: ScreeningConfig = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    match &args.command {
        Command::Normalize {
            input,
            output,
            size,
            sigma,
        } => {
            if !input.exists() {
                anyhow::bail!("Input file does not exist: {}", input.display());
            }

            let target_size = size.unwrap_or(config.target_size);
            let blur_sigma = sigma.unwrap_or(config.blur_sigma);

            let raw =
                load_rgb(input).with_context(|| format!("Failed to load {}", input.display()))?;
            let normalized =
                normalize(&raw, blur_sigma, target_size).context("Failed to normalize image")?;
            save_png(output, normalized.as_image())
                .with_context(|| format!("Failed to save {}", output.display()))?;

            tracing::info!(
                "Normalized {} -> {} ({target_size}x{target_size})",
                input.display(),
                output.display()
            );
        }
        Command::Classify { score } => {
            let record = classify(*score).context("Failed to classify score")?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}
