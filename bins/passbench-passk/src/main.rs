mod aggregate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use passbench_common::config::HarnessConfig;
use passbench_common::types::SampleMetadata;
use passbench_harness::docker::ContainerHarness;
use passbench_harness::scorer;
use passbench_harness::script::TestMode;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Pass@k evaluator: scores every generation folder of a model run in
/// detailed mode, then aggregates the persisted artifacts into a corpus
/// pass@k report.
#[derive(Parser)]
#[command(name = "passbench-passk")]
#[command(about = "Pass@k reliability metric over repeated generation attempts", long_about = None)]
struct Cli {
    /// Model whose generation folders are evaluated
    #[arg(long)]
    model_name: String,

    /// Benchmark difficulty level
    #[arg(long, default_value = "easy")]
    level: String,

    /// Timestamp tag of the generation run (informational)
    #[arg(long, default_value = "")]
    time_str: String,

    /// Benchmark source root; `<source_path>/<level>` lists the sample universe
    #[arg(long)]
    source_path: PathBuf,

    /// Number of attempts k
    #[arg(long, default_value_t = 3)]
    pass_k: usize,

    /// Run name prefixing the generation folders
    #[arg(long)]
    save_name: String,

    /// Number of samples scored concurrently
    #[arg(long, default_value_t = 8)]
    num_workers: usize,

    /// Root directory holding the generation (attempt) folders
    #[arg(long)]
    generation_dir: PathBuf,

    /// Root directory the evaluation artifacts are written to
    #[arg(long)]
    evaluation_dir: PathBuf,

    /// Metadata key holding the candidate file-code map
    #[arg(long, default_value = "generated_file_code")]
    code_key: String,

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
        model = %cli.model_name,
        level = %cli.level,
        time_str = %cli.time_str,
        k = cli.pass_k,
        workers = cli.num_workers,
        "Pass@k evaluator booting"
    );

    let attempt_folders = list_attempt_folders(
        &cli.generation_dir,
        &format!("{}_{}_{}", cli.save_name, cli.model_name, cli.level),
    )?;
    if attempt_folders.is_empty() {
        warn!(
            generation_dir = %cli.generation_dir.display(),
            "no matching generation folders; aggregation will see only zeros"
        );
    }
    info!(folders = attempt_folders.len(), "Found generation folders");

    // Phase 1: score every attempt folder that has no evaluation mirror yet.
    let harness = Arc::new(ContainerHarness::new(config)?);
    for folder in &attempt_folders {
        let eval_folder = cli.evaluation_dir.join(folder);
        if eval_folder.exists() {
            info!(folder = %folder, "Evaluation folder exists, skipping scoring");
            continue;
        }
        score_folder(
            Arc::clone(&harness),
            cli.generation_dir.join(folder),
            eval_folder,
            cli.code_key.clone(),
            cli.num_workers,
        )
        .await;
    }

    // Phase 2: aggregate persisted artifacts (read-only).
    println!();
    println!("→ Starting Pass@{} calculation", cli.pass_k);
    let sample_names = list_sample_universe(&cli.source_path, &cli.level)?;
    info!(samples = sample_names.len(), "Sample universe loaded");

    let sample_results =
        aggregate::load_attempts(&cli.evaluation_dir, &attempt_folders, &sample_names);
    let report =
        aggregate::calculate_pass_at_k(&sample_results, sample_names.len(), cli.pass_k);

    println!(
        "  Total GT passed tests: {} in {} samples",
        report.total_gt_passed_tests,
        sample_names.len()
    );
    println!(
        "  Total GT tests: {} in {} samples",
        report.total_gt_tests,
        sample_names.len()
    );
    println!(
        "  Avg Pass@1 rate of {} attempts: {}",
        cli.pass_k, report.avg_pass_at_1
    );
    println!(
        "  Avg Pass@{} rate of {} attempts: {}",
        cli.pass_k, cli.pass_k, report.pass_at_k
    );

    let report_name = format!("{}_pass_at_{}.json", cli.save_name, cli.pass_k);
    std::fs::create_dir_all(&cli.evaluation_dir)
        .with_context(|| format!("Failed to create {}", cli.evaluation_dir.display()))?;
    let report_path = cli.evaluation_dir.join(report_name);
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Failed to write {}", report_path.display()))?;
    println!("  Report saved to: {}", report_path.display());

    Ok(())
}

/// Generation folders for this run, sorted for stable attempt ordering.
fn list_attempt_folders(generation_dir: &Path, prefix: &str) -> Result<Vec<String>> {
    let entries = std::fs::read_dir(generation_dir)
        .with_context(|| format!("Failed to read {}", generation_dir.display()))?;
    let mut folders: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(prefix))
        .collect();
    folders.sort();
    Ok(folders)
}

/// Sample universe: file listing of `<source_path>/<level>`, names cut at
/// `-level`. Samples with no artifact anywhere still count as zeros.
fn list_sample_universe(source_path: &Path, level: &str) -> Result<Vec<String>> {
    let level_dir = source_path.join(level);
    let entries = std::fs::read_dir(&level_dir)
        .with_context(|| format!("Failed to read {}", level_dir.display()))?;
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .map(|name| match name.split_once("-level") {
            Some((stem, _)) => stem.to_string(),
            None => name,
        })
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Score every sample metadata file in one generation folder with bounded
/// workers, writing `<sample_name>_adjusted.json` artifacts into the
/// mirrored evaluation folder. Per-sample failures are logged, never fatal.
async fn score_folder(
    harness: Arc<ContainerHarness>,
    generation_folder: PathBuf,
    evaluation_folder: PathBuf,
    code_key: String,
    workers: usize,
) {
    let sample_files = match std::fs::read_dir(&generation_folder) {
        Ok(entries) => {
            let mut files: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            files
        }
        Err(e) => {
            error!(folder = %generation_folder.display(), error = %e,
                   "Failed to list generation folder");
            return;
        }
    };

    info!(
        folder = %generation_folder.display(),
        samples = sample_files.len(),
        "Scoring generation folder"
    );

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    for sample_path in sample_files {
        let harness = Arc::clone(&harness);
        let semaphore = Arc::clone(&semaphore);
        let evaluation_folder = evaluation_folder.clone();
        let code_key = code_key.clone();

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            score_one(&harness, &sample_path, &evaluation_folder, &code_key)
                .await
                .with_context(|| format!("scoring {}", sample_path.display()))
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!(error = format!("{:#}", e), "Sample scoring failed");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Sample task panicked or was aborted");
            }
        }
    }
    if failed > 0 {
        warn!(folder = %generation_folder.display(), failed, "Folder finished with failures");
    }
}

async fn score_one(
    harness: &ContainerHarness,
    sample_path: &Path,
    evaluation_folder: &Path,
    code_key: &str,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(sample_path)
        .await
        .context("failed to read metadata file")?;
    let metadata: SampleMetadata =
        serde_json::from_str(&raw).context("failed to parse metadata JSON")?;

    let sample_name = metadata.sample_name.clone().unwrap_or_else(|| {
        sample_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sample".to_string())
    });

    let comparison =
        scorer::score_sample(harness, &metadata, code_key, TestMode::Detailed).await?;
    let file_name = format!("{}_adjusted.json", sample_name);
    let written = scorer::write_artifact(evaluation_folder, &file_name, &comparison)?;
    info!(artifact = %written.display(), "Artifact written");
    Ok(())
}
