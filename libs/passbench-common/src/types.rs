use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// One benchmark task instance, loaded from a persisted metadata JSON file.
///
/// `package_name` + `dir_path` + `test_file` uniquely identify the executable
/// test entry point inside the `"<package_name>-image"` container image.
/// Candidate file-code maps are produced by out-of-scope generation methods
/// and arrive as arbitrarily named top-level keys, captured via `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleMetadata {
    pub package_name: String,
    pub dir_path: String,
    pub test_file: String,
    #[serde(default)]
    pub sample_name: Option<String>,
    /// Ground-truth file map: the reference code variant assumed correct.
    #[serde(rename = "GT_file_code")]
    pub gt_file_code: BTreeMap<String, String>,
    /// Original unmodified file map, used to backfill files a candidate
    /// did not touch. May be absent in older metadata.
    #[serde(default)]
    pub file_code: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SampleMetadata {
    /// Docker image name for this sample's package.
    pub fn image_name(&self) -> String {
        format!("{}-image", self.package_name)
    }

    /// Look up a named candidate file-code map (e.g. `generated_file_code`).
    pub fn candidate_map(&self, code_key: &str) -> Result<BTreeMap<String, String>> {
        let value = self
            .extra
            .get(code_key)
            .ok_or_else(|| anyhow!("metadata has no '{}' key", code_key))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("'{}' is not a path->content map", code_key))
    }

    /// Whether a usable (present, non-empty) candidate map exists.
    pub fn has_candidate(&self, code_key: &str) -> bool {
        matches!(
            self.extra.get(code_key),
            Some(serde_json::Value::Object(map)) if !map.is_empty()
        )
    }
}

/// Outcome of a single test case as reported by the test runner.
/// Anything outside the known set degrades to `Unknown` rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
    #[serde(other)]
    Unknown,
}

impl From<&str> for TestOutcome {
    fn from(s: &str) -> Self {
        match s {
            "passed" => TestOutcome::Passed,
            "failed" => TestOutcome::Failed,
            "error" => TestOutcome::Error,
            "skipped" => TestOutcome::Skipped,
            _ => TestOutcome::Unknown,
        }
    }
}

/// Parsed result of one container test run.
///
/// Summary counts come from regex scanning of the console text and are always
/// present (absent patterns count as zero). The detailed per-test map is only
/// populated when an embedded JSON report was found and decoded; every
/// degradation path records a diagnostic instead of failing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub passed: u32,
    pub failed: u32,
    pub warnings: u32,
    pub errors: u32,
    /// passed + failed + errors + warnings. Warnings are deliberately
    /// counted as test-affecting units.
    pub total_tests: u32,
    pub errors_info: Option<String>,
    pub failures_info: Option<String>,
    /// Combined raw stdout + stderr of the container run.
    pub output: String,
    #[serde(default)]
    pub has_detailed_results: bool,
    #[serde(default)]
    pub detailed_dict: BTreeMap<String, TestOutcome>,
    #[serde(default)]
    pub detailed_parse_error: Option<String>,
    /// Set when the container run hit the hard wall-clock timeout.
    #[serde(default)]
    pub timed_out: bool,
}

/// Ground-truth half of a persisted comparison artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GtResults {
    pub passed: u32,
    pub warnings: u32,
    pub total_tests: u32,
    pub output: String,
    pub detailed_dict: BTreeMap<String, TestOutcome>,
}

/// Candidate half of a persisted comparison artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedResults {
    pub passed: u32,
    pub failed: u32,
    pub warnings: u32,
    pub errors: u32,
    pub total_tests: u32,
    pub errors_info: Option<String>,
    pub failures_info: Option<String>,
    pub output: String,
    pub detailed_dict: BTreeMap<String, TestOutcome>,
}

/// Persisted artifact comparing one candidate attempt against ground truth.
///
/// Invariant: `passed_rate = min(1, generated.passed / gt.passed)` when
/// `gt.passed > 0`, else `0.0`. Deserialization is lenient so summary-mode
/// artifacts (no detailed maps) still load during aggregation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonResult {
    pub gt_results: GtResults,
    pub generated_results: GeneratedResults,
    pub passed_rate: f64,
    pub max_possible_passed: u32,
}

/// Per-test coverage detail inside a pass@k sample entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestDetail {
    pub gt_passed: bool,
    pub k_passed: bool,
    /// Zero-based indices of the attempts whose candidate passed this test.
    pub attempts_passed: Vec<usize>,
}

/// Pass@k breakdown for one sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleDetail {
    pub pass_rate: f64,
    pub successful_tests: usize,
    pub total_gt_passed: usize,
    pub test_details: BTreeMap<String, TestDetail>,
}

/// Corpus-level pass@k report.
///
/// `pass_at_k` is the direct "did >=1 of exactly k executed attempts pass
/// this test" measure averaged over samples. This deliberately diverges from
/// the combinatorial unbiased pass@k estimator in the literature; the exact
/// definition must be preserved for downstream comparability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassAtKReport {
    pub created: chrono::DateTime<chrono::Utc>,
    pub k: usize,
    pub pass_at_k: f64,
    /// Secondary diagnostic: mean over samples of the per-attempt
    /// candidate.passed / gt.passed ratio.
    pub avg_pass_at_1: f64,
    pub sample_pass_rates: Vec<f64>,
    pub num_samples: usize,
    /// Sum over samples of the largest observed GT passed count.
    pub total_gt_passed_tests: u64,
    /// Sum over samples of the GT-passing test id union size.
    pub total_gt_tests: u64,
    pub sample_details: BTreeMap<String, SampleDetail>,
}
