use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use fedagg_core::crypto::{open, seal, SymmetricKey};
use fedagg_core::package::{decode_package, encode_package};
use fedagg_core::{init_tracing, load_config, FederationPipeline, KeyMaterial, LabeledDataset, MaxFeatures};

#[derive(Parser)]
#[clap(name = "fedagg")]
#[clap(about = "Aggregate encrypted federation packages into a global model spec and evaluate it")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one aggregation for a registered model
    Run {
        #[clap(long)]
        model: String,
        /// CSV with a header row and a binary target column
        #[clap(long)]
        dataset: PathBuf,
        /// Overrides evaluation.target_column
        #[clap(long)]
        target: Option<String>,
        /// Write the report here instead of stdout
        #[clap(long)]
        output: Option<PathBuf>,
        /// Repeat every SECS, re-reading a file registry between runs, until Ctrl-C
        #[clap(long, value_name = "SECS")]
        every: Option<u64>,
    },
    /// Validate a package JSON file and encrypt it into an envelope
    Seal {
        #[clap(long)]
        input: PathBuf,
        #[clap(long, env = "FEDAGG_PACKAGE_KEY", hide_env_values = true)]
        key: String,
        #[clap(long)]
        output: PathBuf,
    },
    /// Decrypt and decode a local envelope, printing a summary
    Inspect {
        #[clap(long)]
        input: PathBuf,
        #[clap(long, env = "FEDAGG_PACKAGE_KEY", hide_env_values = true)]
        key: String,
    },
    /// Print a fresh base64 package key
    Keygen,
}

#[derive(Serialize)]
struct PackageSummary {
    predictions: usize,
    feature_importances: usize,
    n_estimators: u32,
    max_features: MaxFeatures,
    max_depth: Option<u32>,
    key_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("fedagg")?;
    match Cli::parse().command {
        Command::Run { model, dataset, target, output, every } => run(&model, dataset, target, output, every).await,
        Command::Seal { input, key, output } => seal_package(input, &key, output),
        Command::Inspect { input, key } => inspect(input, &key),
        Command::Keygen => {
            println!("{}", SymmetricKey::generate().to_material().expose());
            Ok(())
        }
    }
}

async fn run(model: &str, dataset: PathBuf, target: Option<String>, output: Option<PathBuf>, every: Option<u64>) -> Result<()> {
    let cfg = load_config("fedagg")?;
    let target = target.unwrap_or_else(|| cfg.evaluation.target_column.clone());
    let data = LabeledDataset::from_csv_path(&dataset, &target).with_context(|| format!("loading dataset {}", dataset.display()))?;
    info!(rows = data.len(), features = data.n_features(), positives = data.positives(), "dataset loaded");
    let data = Arc::new(data);

    let pipeline = FederationPipeline::from_config(&cfg)?;
    let Some(secs) = every else { return run_once(&pipeline, model, data, output.as_deref()).await };

    let period = Duration::from_secs(secs.max(1));
    loop {
        if let Err(e) = run_once(&pipeline, model, data.clone(), output.as_deref()).await {
            warn!(error = %e, "scheduled run failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }
        if let Err(e) = pipeline.refresh_registry() {
            warn!(error = %e, "registry reload failed, keeping previous entries");
        }
    }
}

async fn run_once(pipeline: &FederationPipeline, model: &str, data: Arc<LabeledDataset>, output: Option<&Path>) -> Result<()> {
    match pipeline.run(model, data).await {
        Ok(report) => {
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(path, json).with_context(|| format!("writing report to {}", path.display()))?;
                    info!(path = %path.display(), run_id = %report.run_id, "report written");
                }
                None => println!("{json}"),
            }
            Ok(())
        }
        Err(failure) => {
            println!("{}", serde_json::to_string_pretty(&failure)?);
            bail!(
                "run failed at stage {} (participant {}, kind {})",
                failure.stage,
                failure.participant.as_deref().unwrap_or("-"),
                failure.kind
            )
        }
    }
}

fn seal_package(input: PathBuf, key: &str, output: PathBuf) -> Result<()> {
    let raw = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let pkg = decode_package(&raw).with_context(|| format!("{} is not a valid package", input.display()))?;
    let key = SymmetricKey::from_material(&KeyMaterial::new(key))?;
    let envelope = seal(&encode_package(&pkg)?, &key)?;
    std::fs::write(&output, &envelope).with_context(|| format!("writing {}", output.display()))?;
    info!(path = %output.display(), bytes = envelope.len(), key_id = %key.fingerprint(), "package sealed");
    Ok(())
}

fn inspect(input: PathBuf, key: &str) -> Result<()> {
    let envelope = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
    let key = SymmetricKey::from_material(&KeyMaterial::new(key))?;
    let plaintext = open(&envelope, &key)?;
    let pkg = decode_package(&plaintext)?;
    let summary = PackageSummary {
        predictions: pkg.predictions.len(),
        feature_importances: pkg.feature_importances.len(),
        n_estimators: pkg.n_estimators,
        max_features: pkg.max_features,
        max_depth: pkg.max_depth.limit(),
        key_id: key.fingerprint(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
