//! Index runner.
//!
//! Computes spectral index layers from orthophotos, derives heat-risk maps
//! from them and keeps the layer catalog up to date.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use index_runner::{
    discover_input, parse_band_source, FileCatalog, GateOutcome, Runner, RunnerConfig,
};
use raster_index::{FormulaKind, Resampling};

#[derive(Parser, Debug)]
#[command(name = "index-runner")]
#[command(about = "Spectral index and heat-risk layer runner")]
struct Args {
    /// Configuration file path (environment variables are used when absent)
    #[arg(short, long, env = "INDEX_RUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add overviews to the RGB and NIR orthophotos and compute NDVI and NDWI from them
    Ingest {
        /// RGB orthophoto (default: first GeoTIFF under <raw>/rgb)
        #[arg(long)]
        rgb: Option<PathBuf>,

        /// NIR orthophoto (default: first GeoTIFF under <raw>/nir)
        #[arg(long)]
        nir: Option<PathBuf>,
    },

    /// Compute the heat-risk map from the catalogued NDVI layer
    Predict,

    /// Build overviews on an existing 8-bit raster
    Overviews {
        path: PathBuf,

        /// Resampling method
        #[arg(long, default_value = "average")]
        resampling: String,
    },

    /// Run a formula over explicit inputs (nothing is registered)
    Compute {
        /// ndvi, ndwi or heat-risk
        #[arg(long)]
        formula: FormulaKind,

        /// Input as PATH or PATH:BAND, in the formula's input order
        #[arg(long = "input", required = true)]
        inputs: Vec<String>,

        /// Output GeoTIFF
        #[arg(long)]
        output: PathBuf,
    },

    /// List catalogued layers
    Layers,

    /// Re-run prediction whenever the NDVI layer is re-registered
    Watch {
        /// Seconds between catalog polls
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => RunnerConfig::from_yaml(path)?,
        None => RunnerConfig::from_env()?,
    };
    info!(
        area = %config.area,
        year = config.year,
        processed = %config.processed_path.display(),
        catalog = %config.catalog_path.display(),
        "Loaded configuration"
    );

    let catalog = Arc::new(FileCatalog::new(&config.catalog_path));
    let runner = Runner::new(config, catalog);

    match args.command {
        Command::Ingest { rgb, nir } => {
            let raw = runner.config().raw_path.clone();
            let rgb = match rgb {
                Some(path) => path,
                None => discover_input(&raw, "rgb")?,
            };
            let nir = match nir {
                Some(path) => path,
                None => discover_input(&raw, "nir")?,
            };
            let report = runner.run_ingest(&rgb, &nir).await?;
            print_json(&report)?;
        }
        Command::Predict => {
            let report = runner.run_predict().await?;
            print_json(&report)?;
        }
        Command::Overviews { path, resampling } => {
            let outcome = runner
                .overviews(&path, Resampling::from_str(&resampling))
                .await?;
            print_json(&outcome)?;
        }
        Command::Compute {
            formula,
            inputs,
            output,
        } => {
            let inputs = inputs
                .iter()
                .map(|s| parse_band_source(s))
                .collect::<Result<Vec<_>>>()?;
            let outcome = runner
                .gate()
                .run_blocking("compute", runner.compute(formula, inputs, &output))
                .await?;
            print_json(&outcome)?;
        }
        Command::Layers => {
            let layers = runner.catalog().list().await?;
            print_json(&layers)?;
        }
        Command::Watch { interval_secs } => {
            watch(runner, Duration::from_secs(interval_secs.max(1))).await?;
        }
    }

    Ok(())
}

/// Poll the catalog and trigger `predict` when the NDVI layer changes.
///
/// Triggers that arrive while a prediction is still running are skipped.
async fn watch(runner: Runner, interval: Duration) -> Result<()> {
    let ndvi_id = runner.config().ndvi_id();
    info!(id = %ndvi_id, interval_secs = interval.as_secs(), "Watching NDVI layer");

    let mut last_seen: Option<DateTime<Utc>> = None;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down watcher");
                return Ok(());
            }
        }

        let record = match runner.catalog().get(&ndvi_id).await {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Catalog poll failed");
                continue;
            }
        };
        if last_seen == Some(record.generated_at) {
            continue;
        }
        last_seen = Some(record.generated_at);
        info!(generated_at = %record.generated_at, "NDVI layer updated, triggering prediction");

        let runner = runner.clone();
        tokio::spawn(async move {
            match runner.trigger_predict().await {
                GateOutcome::Ran(Ok(report)) => {
                    info!(entity_id = %report.entity_id, "Triggered prediction finished")
                }
                GateOutcome::Ran(Err(e)) => error!(error = %format!("{:#}", e), "Triggered prediction failed"),
                GateOutcome::Skipped => {}
            }
        });
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
