use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod archive;
mod config;
mod pipeline;
mod records;

use config::Config;
use pipeline::{Envelope, Outcome, Pipeline};
use records::JsonRecordStore;

/// Exit status when the request ran but produced no match.
const EXIT_NO_MATCH: u8 = 2;

#[derive(Parser)]
#[command(
    name = "sketchface",
    about = "Reconstruct faces from sketches and match them against a photo pool"
)]
struct Cli {
    /// TOML configuration file (SKETCHFACE_* variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Print the plain-text report instead of JSON
    #[arg(long, global = true)]
    legacy: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconstruct a face from a sketch (best of N samples by SSIM)
    Reconstruct {
        sketch: PathBuf,
        /// Output image path
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of samples to draw
        #[arg(short = 'n', long)]
        samples: Option<usize>,
        /// Base seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Rank the photo pool against an existing reconstruction
    Match {
        reconstruction: PathBuf,
        /// Candidate photo directory
        #[arg(short, long)]
        pool: Option<PathBuf>,
    },
    /// Reconstruct a sketch, archive it, and find the closest photo
    Identify {
        sketch: PathBuf,
        /// Candidate photo directory
        #[arg(short, long)]
        pool: Option<PathBuf>,
        /// Number of samples to draw
        #[arg(short = 'n', long)]
        samples: Option<usize>,
        /// Base seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("request", %request_id);
    let _enter = span.enter();

    match cli.command {
        Commands::Reconstruct {
            sketch,
            output,
            samples,
            seed,
        } => {
            apply_sampling(&mut config, samples, seed)?;
            let output = output.unwrap_or_else(|| config.output_path.clone());
            let reconstructor =
                pipeline::load_reconstructor(&config).context("loading reconstruction model")?;
            let summary = pipeline::reconstruct(&reconstructor, &sketch, &output)?;

            if cli.legacy {
                println!(
                    "Best reconstructed image saved as '{}' (sample {}, SSIM {:.4}).",
                    summary.output.display(),
                    summary.draw,
                    summary.ssim
                );
            } else {
                print_json(&Envelope::new(request_id, summary))?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Match { reconstruction, pool } => {
            if let Some(pool) = pool {
                config.pool_dir = pool;
            }
            let matcher = pipeline::load_matcher(&config).context("loading face models")?;
            let records = JsonRecordStore::new(&config.records_path);
            let outcome = pipeline::match_reconstruction(
                &matcher,
                &config.confidence_scale(),
                &records,
                &reconstruction,
                &config.pool_dir,
            )?;

            let code = exit_code(&outcome);
            if cli.legacy {
                print!("{}", outcome.to_legacy());
            } else {
                print_json(&Envelope::new(request_id, outcome))?;
            }
            Ok(code)
        }
        Commands::Identify {
            sketch,
            pool,
            samples,
            seed,
        } => {
            apply_sampling(&mut config, samples, seed)?;
            if let Some(pool) = pool {
                config.pool_dir = pool;
            }
            let pipeline = Pipeline::load(&config).context("loading models")?;
            let report = pipeline.identify(&sketch)?;

            let code = exit_code(&report.outcome);
            if cli.legacy {
                print!("{}", report.to_legacy());
            } else {
                print_json(&Envelope::new(request_id, report))?;
            }
            Ok(code)
        }
    }
}

/// Command-line sampling flags take precedence over file and environment.
fn apply_sampling(config: &mut Config, samples: Option<usize>, seed: Option<u64>) -> Result<()> {
    if let Some(samples) = samples {
        config.samples = samples;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    config.validate()
}

fn exit_code(outcome: &Outcome) -> ExitCode {
    match outcome {
        Outcome::Matched { .. } => ExitCode::SUCCESS,
        Outcome::NoEmbedding | Outcome::NoCandidates { .. } => ExitCode::from(EXIT_NO_MATCH),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
