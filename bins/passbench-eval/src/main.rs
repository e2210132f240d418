mod batch;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use passbench_common::config::HarnessConfig;
use passbench_harness::docker::ContainerHarness;
use tokio::signal;
use tracing::{info, warn};

/// Batch evaluator: scores every sample metadata file in a directory
/// against its ground-truth baseline inside ephemeral containers.
#[derive(Parser)]
#[command(name = "passbench-eval")]
#[command(about = "Batch functional-correctness evaluator for generated code", long_about = None)]
struct Cli {
    /// Directory of sample metadata JSON files
    directory: PathBuf,

    /// Number of samples scored concurrently
    #[arg(long, default_value_t = 50)]
    workers: usize,

    /// Metadata key holding the candidate file-code map
    #[arg(long, default_value = "generated_file_code")]
    code_key: String,

    /// Directory the comparison artifacts are written to
    #[arg(long, default_value = "evaluation")]
    target_dir: PathBuf,

    /// Hard wall-clock timeout per container run (overrides config)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Optional harness config JSON (timeout, memory/CPU limits)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();

    let mut config = HarnessConfig::load_or_default(cli.config.as_deref())?;
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    info!(
        directory = %cli.directory.display(),
        workers = cli.workers,
        code_key = %cli.code_key,
        timeout_ms = config.timeout_ms,
        "Batch evaluator booting"
    );

    let harness = ContainerHarness::new(config)?;

    let files = list_metadata_files(&cli.directory)?;
    if files.is_empty() {
        bail!("no metadata JSON files found in {}", cli.directory.display());
    }
    info!(count = files.len(), "Found metadata files");

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        warn!("Received shutdown signal, aborting in-flight samples...");
    };

    tokio::select! {
        summary = batch::run_batch(
            harness,
            files,
            cli.target_dir.clone(),
            cli.code_key.clone(),
            cli.workers,
        ) => {
            println!();
            println!("→ Batch complete");
            println!("  Scored:  {}", summary.scored);
            println!("  Skipped: {}", summary.skipped);
            println!("  Failed:  {}", summary.failed);
        }
        _ = shutdown => {}
    }

    Ok(())
}

fn list_metadata_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(directory)
        .with_context(|| format!("Failed to read {}", directory.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}
