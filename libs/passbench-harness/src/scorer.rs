/// Relative Scorer - Candidate vs Ground-Truth Baseline
///
/// **Scoring Rules:**
/// - The ground-truth run defines `max_possible_passed`.
/// - passed_rate = min(1, generated.passed / max_possible_passed),
///   0.0 when the baseline passes nothing (failure, not undefined).
/// - A timed-out candidate run is a hard failure with zero credit.
///
/// The scorer knows nothing about pass@k; it produces one persisted
/// `ComparisonResult` per sample attempt. Failures abort only the current
/// sample and are reported at the caller's task boundary.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use passbench_common::types::{
    ComparisonResult, ExecutionRecord, GeneratedResults, GtResults, SampleMetadata, TestOutcome,
};
use tracing::{info, warn};

use crate::docker::{ContainerHarness, RunOutput};
use crate::parser;
use crate::script::{build_test_script, TestMode};

/// Candidate passed count normalized by the ground-truth baseline,
/// capped at 1.0. A zero baseline scores 0.0, never a division error.
pub fn passed_rate(generated_passed: u32, max_possible_passed: u32) -> f64 {
    if max_possible_passed == 0 {
        0.0
    } else {
        (f64::from(generated_passed) / f64::from(max_possible_passed)).min(1.0)
    }
}

/// Round to 4 decimal places for the persisted artifact.
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn record_from_run(run: RunOutput, mode: TestMode) -> ExecutionRecord {
    let mut record = match mode {
        TestMode::Summary => parser::parse_summary(&run.output),
        TestMode::Detailed => parser::parse_detailed(&run.output),
    };
    record.timed_out = run.timed_out;
    record
}

/// Candidate map with GT-only paths backfilled from the original
/// unmodified file map: a candidate that only patches a subset of files is
/// not penalized for "missing" unrelated files.
pub fn backfill_candidate(
    metadata: &SampleMetadata,
    mut candidate: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    for path in metadata.gt_file_code.keys() {
        if candidate.contains_key(path) {
            continue;
        }
        match metadata.file_code.get(path) {
            Some(content) => {
                candidate.insert(path.clone(), content.clone());
            }
            None => {
                warn!(path = %path, "no original content to backfill; candidate runs without it");
            }
        }
    }
    candidate
}

/// Score one candidate attempt for one sample: GT run, backfill, candidate
/// run, normalized rate. Within a sample the GT run always completes before
/// the candidate run starts.
pub async fn score_sample(
    harness: &ContainerHarness,
    metadata: &SampleMetadata,
    code_key: &str,
    mode: TestMode,
) -> Result<ComparisonResult> {
    let image = metadata.image_name();

    let gt_script = build_test_script(metadata, Some(&metadata.gt_file_code), mode);
    let gt_run = harness
        .run_script(&image, &gt_script)
        .await
        .context("ground-truth run failed")?;
    let mut gt = record_from_run(gt_run, mode);
    let max_possible_passed = gt.passed;
    if gt.timed_out {
        warn!(image = %image, "ground-truth run timed out; baseline counts are partial");
    }

    let candidate = metadata
        .candidate_map(code_key)
        .context("candidate file map missing")?;
    let candidate = backfill_candidate(metadata, candidate);

    let gen_script = build_test_script(metadata, Some(&candidate), mode);
    let gen_run = harness
        .run_script(&image, &gen_script)
        .await
        .context("candidate run failed")?;
    let mut generated = record_from_run(gen_run, mode);

    // Timeout is a hard failure with zero credit: discard any counts that
    // happened to appear in the partial output.
    let rate = if generated.timed_out {
        generated.detailed_dict.clear();
        generated.has_detailed_results = false;
        generated.detailed_parse_error =
            Some("run timed out; detailed results discarded".to_string());
        0.0
    } else {
        passed_rate(generated.passed, max_possible_passed)
    };

    // Test ids the candidate surfaced that the baseline never reported are
    // recorded as failed on the GT side, keeping the union consistent for
    // aggregation.
    for id in generated.detailed_dict.keys() {
        gt.detailed_dict
            .entry(id.clone())
            .or_insert(TestOutcome::Failed);
    }

    info!(
        image = %image,
        gt_passed = max_possible_passed,
        generated_passed = generated.passed,
        passed_rate = rate,
        "Sample scored"
    );

    Ok(ComparisonResult {
        gt_results: GtResults {
            passed: gt.passed,
            warnings: gt.warnings,
            total_tests: gt.total_tests,
            output: gt.output,
            detailed_dict: gt.detailed_dict,
        },
        generated_results: GeneratedResults {
            passed: generated.passed,
            failed: generated.failed,
            warnings: generated.warnings,
            errors: generated.errors,
            total_tests: generated.total_tests,
            errors_info: generated.errors_info,
            failures_info: generated.failures_info,
            output: generated.output,
            detailed_dict: generated.detailed_dict,
        },
        passed_rate: round4(rate),
        max_possible_passed,
    })
}

/// Persist a comparison artifact as pretty JSON, creating the target
/// directory if needed. Returns the written path.
pub fn write_artifact(
    target_dir: &Path,
    file_name: &str,
    result: &ComparisonResult,
) -> Result<PathBuf> {
    std::fs::create_dir_all(target_dir)
        .with_context(|| format!("Failed to create {}", target_dir.display()))?;
    let path = target_dir.join(file_name);
    let payload = serde_json::to_string_pretty(result)?;
    std::fs::write(&path, payload)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
