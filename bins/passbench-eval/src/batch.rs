/// Batch Orchestration - Bounded Fan-Out Over Metadata Files
///
/// One task per metadata file, bounded by a semaphore-sized worker pool.
/// Samples are mutually independent (separate containers, separate files);
/// the only shared resource is the output directory, whose index scan +
/// write is serialized behind an async mutex.
///
/// Failure isolation: an error in one sample's scoring is caught at the
/// task boundary, logged with full diagnostics, and counted - it never
/// aborts sibling tasks or the batch.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use passbench_common::types::SampleMetadata;
use passbench_harness::docker::ContainerHarness;
use passbench_harness::scorer;
use passbench_harness::script::TestMode;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub scored: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum TaskOutcome {
    Scored,
    Skipped,
}

pub async fn run_batch(
    harness: ContainerHarness,
    files: Vec<PathBuf>,
    target_dir: PathBuf,
    code_key: String,
    workers: usize,
) -> BatchSummary {
    let harness = Arc::new(harness);
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    // Serializes the read-modify-write on the shared artifact directory.
    let output_lock = Arc::new(Mutex::new(()));

    let mut tasks = JoinSet::new();
    for path in files {
        let harness = Arc::clone(&harness);
        let semaphore = Arc::clone(&semaphore);
        let output_lock = Arc::clone(&output_lock);
        let target_dir = target_dir.clone();
        let code_key = code_key.clone();

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let outcome = evaluate_one(&harness, &path, &target_dir, &code_key, &output_lock)
                .await
                .with_context(|| format!("scoring {}", path.display()))?;
            Ok::<(PathBuf, TaskOutcome), anyhow::Error>((path, outcome))
        });
    }

    let mut summary = BatchSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((path, TaskOutcome::Scored))) => {
                summary.scored += 1;
                info!(file = %path.display(), "Sample scored");
            }
            Ok(Ok((path, TaskOutcome::Skipped))) => {
                summary.skipped += 1;
                info!(file = %path.display(), "Sample skipped (no candidate code)");
            }
            Ok(Err(e)) => {
                summary.failed += 1;
                error!(error = format!("{:#}", e), "Sample scoring failed");
            }
            Err(e) => {
                summary.failed += 1;
                error!(error = %e, "Sample task panicked or was aborted");
            }
        }
    }

    summary
}

async fn evaluate_one(
    harness: &ContainerHarness,
    metadata_path: &Path,
    target_dir: &Path,
    code_key: &str,
    output_lock: &Mutex<()>,
) -> Result<TaskOutcome> {
    let raw = tokio::fs::read_to_string(metadata_path)
        .await
        .context("failed to read metadata file")?;
    let metadata: SampleMetadata =
        serde_json::from_str(&raw).context("failed to parse metadata JSON")?;

    if !metadata.has_candidate(code_key) {
        return Ok(TaskOutcome::Skipped);
    }

    let comparison = scorer::score_sample(harness, &metadata, code_key, TestMode::Summary).await?;

    // Index allocation and write under one lock: concurrent tasks must not
    // race on the next free artifact index.
    let _guard = output_lock.lock().await;
    let index = next_metadata_index(target_dir)?;
    let file_name = format!("metadata_{}_adjusted.json", index);
    let written = scorer::write_artifact(target_dir, &file_name, &comparison)?;
    info!(artifact = %written.display(), "Artifact written");

    Ok(TaskOutcome::Scored)
}

/// Next free index for batch-sequential `metadata_<n>_adjusted.json`
/// artifact names: max existing index + 1, or 0 for an empty directory.
fn next_metadata_index(target_dir: &Path) -> Result<u32> {
    let entries = match std::fs::read_dir(target_dir) {
        Ok(entries) => entries,
        // First artifact creates the directory.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to list {}", target_dir.display()))
        }
    };

    let max_index = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| {
            let middle = name
                .strip_prefix("metadata_")?
                .strip_suffix("_adjusted.json")?;
            middle.parse::<u32>().ok()
        })
        .max();

    Ok(max_index.map_or(0, |idx| idx + 1))
}
