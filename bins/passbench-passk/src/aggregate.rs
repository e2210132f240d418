/// Pass@k Aggregator - Combining Attempts Into a Corpus Score
///
/// Reads persisted comparison artifacts only after all attempts exist;
/// read-only and non-mutating.
///
/// **Definition (preserved exactly):**
/// Per sample, the GT-passing set is the union over attempts of test ids
/// the reference passed in at least one run (guards against reference-run
/// flakiness). A test counts as covered when any of the first k attempts'
/// candidate maps reports it passed; the sample scores covered / |set|,
/// 0 for an empty set. The corpus score is the arithmetic mean over the
/// sample universe. This is deliberately NOT the combinatorial unbiased
/// pass@k estimator from the literature - it is a direct "did >=1 of
/// exactly k executed attempts succeed" measure, and downstream numbers
/// depend on it staying that way.
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use passbench_common::types::{
    ComparisonResult, PassAtKReport, SampleDetail, TestDetail, TestOutcome,
};
use tracing::warn;

/// Slice of one persisted artifact that aggregation needs.
#[derive(Debug, Clone, Default)]
pub struct AttemptRecord {
    pub gt_detailed: BTreeMap<String, TestOutcome>,
    pub gen_detailed: BTreeMap<String, TestOutcome>,
    /// GT passed count: the denominator of the diagnostic per-attempt ratio.
    pub gt_passed: u32,
    pub generated_passed: u32,
}

impl From<ComparisonResult> for AttemptRecord {
    fn from(artifact: ComparisonResult) -> Self {
        Self {
            gt_detailed: artifact.gt_results.detailed_dict,
            gen_detailed: artifact.generated_results.detailed_dict,
            gt_passed: artifact.gt_results.passed,
            generated_passed: artifact.generated_results.passed,
        }
    }
}

/// Load attempts for every sample across the attempt folders. A missing or
/// unreadable artifact contributes a zero record - counted, not skipped, so
/// it still depresses the corpus mean rather than vanishing silently.
pub fn load_attempts(
    evaluation_root: &Path,
    attempt_folders: &[String],
    sample_names: &[String],
) -> BTreeMap<String, Vec<AttemptRecord>> {
    let mut sample_results: BTreeMap<String, Vec<AttemptRecord>> = BTreeMap::new();

    for folder in attempt_folders {
        let folder_path = evaluation_root.join(folder);
        if !folder_path.exists() {
            // A whole missing attempt folder means those attempts never ran;
            // samples simply have fewer attempts. Missing individual
            // artifacts below still count as zero-score attempts.
            warn!(folder = %folder_path.display(), "attempt folder does not exist, skipping");
            continue;
        }

        for sample_name in sample_names {
            let artifact_path = folder_path.join(format!("{}_adjusted.json", sample_name));
            let record = match std::fs::read_to_string(&artifact_path) {
                Ok(raw) => match serde_json::from_str::<ComparisonResult>(&raw) {
                    Ok(artifact) => AttemptRecord::from(artifact),
                    Err(e) => {
                        warn!(artifact = %artifact_path.display(), error = %e,
                              "unreadable artifact counted as zero-score attempt");
                        AttemptRecord::default()
                    }
                },
                Err(_) => AttemptRecord::default(),
            };
            sample_results.entry(sample_name.clone()).or_default().push(record);
        }
    }

    sample_results
}

/// Combine per-sample attempt lists into the corpus report.
///
/// `num_samples` is the size of the sample universe and the denominator of
/// both corpus means. Attempts beyond the first k are ignored; fewer than k
/// attempts means pass@min(k, available) - no padding, no penalty.
pub fn calculate_pass_at_k(
    sample_results: &BTreeMap<String, Vec<AttemptRecord>>,
    num_samples: usize,
    k: usize,
) -> PassAtKReport {
    let mut sample_pass_rates = Vec::new();
    let mut sample_details = BTreeMap::new();
    let mut total_gt_passed_tests: u64 = 0;
    let mut total_gt_tests: u64 = 0;
    let mut pass_at_1_sum = 0.0;

    for (sample_name, attempts) in sample_results {
        let attempts = &attempts[..k.min(attempts.len())];

        total_gt_passed_tests += attempts
            .iter()
            .map(|attempt| u64::from(attempt.gt_passed))
            .max()
            .unwrap_or(0);

        // Diagnostic "average pass@1": per-attempt candidate/GT ratio.
        let ratios: Vec<f64> = attempts
            .iter()
            .map(|attempt| {
                if attempt.gt_passed > 0 {
                    f64::from(attempt.generated_passed) / f64::from(attempt.gt_passed)
                } else {
                    0.0
                }
            })
            .collect();
        if !ratios.is_empty() {
            pass_at_1_sum += ratios.iter().sum::<f64>() / ratios.len() as f64;
        }

        // Union of reference-passing ids across attempts.
        let gt_passed_cases: BTreeSet<&String> = attempts
            .iter()
            .flat_map(|attempt| attempt.gt_detailed.iter())
            .filter(|(_, outcome)| **outcome == TestOutcome::Passed)
            .map(|(id, _)| id)
            .collect();
        total_gt_tests += gt_passed_cases.len() as u64;

        if gt_passed_cases.is_empty() {
            sample_pass_rates.push(0.0);
            continue;
        }

        let mut successful_tests = 0;
        let mut test_details = BTreeMap::new();
        for test_id in &gt_passed_cases {
            let attempts_passed: Vec<usize> = attempts
                .iter()
                .enumerate()
                .filter(|(_, attempt)| {
                    attempt.gen_detailed.get(*test_id) == Some(&TestOutcome::Passed)
                })
                .map(|(index, _)| index)
                .collect();

            let k_passed = !attempts_passed.is_empty();
            if k_passed {
                successful_tests += 1;
            }
            test_details.insert(
                (*test_id).clone(),
                TestDetail {
                    gt_passed: true,
                    k_passed,
                    attempts_passed,
                },
            );
        }

        let pass_rate = successful_tests as f64 / gt_passed_cases.len() as f64;
        sample_pass_rates.push(pass_rate);
        sample_details.insert(
            sample_name.clone(),
            SampleDetail {
                pass_rate,
                successful_tests,
                total_gt_passed: gt_passed_cases.len(),
                test_details,
            },
        );
    }

    let (pass_at_k, avg_pass_at_1) = if num_samples > 0 {
        (
            sample_pass_rates.iter().sum::<f64>() / num_samples as f64,
            pass_at_1_sum / num_samples as f64,
        )
    } else {
        (0.0, 0.0)
    };

    PassAtKReport {
        created: chrono::Utc::now(),
        k,
        pass_at_k,
        avg_pass_at_1,
        num_samples: sample_pass_rates.len(),
        sample_pass_rates,
        total_gt_passed_tests,
        total_gt_tests,
        sample_details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(pairs: &[(&str, TestOutcome)]) -> BTreeMap<String, TestOutcome> {
        pairs
            .iter()
            .map(|(id, outcome)| (id.to_string(), *outcome))
            .collect()
    }

    fn attempt(
        gt: &[(&str, TestOutcome)],
        gen: &[(&str, TestOutcome)],
        gt_passed: u32,
        generated_passed: u32,
    ) -> AttemptRecord {
        AttemptRecord {
            gt_detailed: outcomes(gt),
            gen_detailed: outcomes(gen),
            gt_passed,
            generated_passed,
        }
    }

    #[test]
    fn union_coverage_across_attempts() {
        // Reference passes {A, B, C}; attempt 1 covers A, attempt 2 covers
        // B and C => pass@2 = 3/3.
        let gt = [
            ("A", TestOutcome::Passed),
            ("B", TestOutcome::Passed),
            ("C", TestOutcome::Passed),
        ];
        let mut samples = BTreeMap::new();
        samples.insert(
            "s1".to_string(),
            vec![
                attempt(&gt, &[("A", TestOutcome::Passed), ("B", TestOutcome::Failed)], 3, 1),
                attempt(
                    &gt,
                    &[("B", TestOutcome::Passed), ("C", TestOutcome::Passed)],
                    3,
                    2,
                ),
            ],
        );

        let report = calculate_pass_at_k(&samples, 1, 2);
        assert_eq!(report.pass_at_k, 1.0);
        let detail = &report.sample_details["s1"];
        assert_eq!(detail.successful_tests, 3);
        assert_eq!(detail.total_gt_passed, 3);
        assert_eq!(detail.test_details["A"].attempts_passed, vec![0]);
        assert_eq!(detail.test_details["B"].attempts_passed, vec![1]);
        assert!(detail.test_details["C"].k_passed);
    }

    #[test]
    fn empty_reference_set_scores_zero() {
        let mut samples = BTreeMap::new();
        samples.insert(
            "s1".to_string(),
            vec![attempt(
                &[("A", TestOutcome::Failed)],
                &[("A", TestOutcome::Passed)],
                0,
                1,
            )],
        );

        let report = calculate_pass_at_k(&samples, 1, 3);
        assert_eq!(report.pass_at_k, 0.0);
        assert_eq!(report.total_gt_tests, 0);
        assert!(report.sample_details.is_empty());
    }

    #[test]
    fn corpus_mean_over_sample_universe() {
        // sample1 = 1.0, sample2 = 0.5 => aggregate 0.75.
        let mut samples = BTreeMap::new();
        samples.insert(
            "s1".to_string(),
            vec![attempt(
                &[("A", TestOutcome::Passed)],
                &[("A", TestOutcome::Passed)],
                1,
                1,
            )],
        );
        samples.insert(
            "s2".to_string(),
            vec![attempt(
                &[("A", TestOutcome::Passed), ("B", TestOutcome::Passed)],
                &[("A", TestOutcome::Passed), ("B", TestOutcome::Failed)],
                2,
                1,
            )],
        );

        let report = calculate_pass_at_k(&samples, 2, 1);
        assert_eq!(report.pass_at_k, 0.75);
        assert_eq!(report.num_samples, 2);
        assert_eq!(report.total_gt_tests, 3);
        assert_eq!(report.total_gt_passed_tests, 3);
    }

    #[test]
    fn attempts_beyond_k_are_ignored() {
        let gt = [("A", TestOutcome::Passed)];
        let mut samples = BTreeMap::new();
        samples.insert(
            "s1".to_string(),
            vec![
                attempt(&gt, &[("A", TestOutcome::Failed)], 1, 0),
                attempt(&gt, &[("A", TestOutcome::Failed)], 1, 0),
                // Third attempt passes, but k = 2 must not see it.
                attempt(&gt, &[("A", TestOutcome::Passed)], 1, 1),
            ],
        );

        let report = calculate_pass_at_k(&samples, 1, 2);
        assert_eq!(report.pass_at_k, 0.0);
    }

    #[test]
    fn fewer_than_k_attempts_is_pass_at_available() {
        let gt = [("A", TestOutcome::Passed)];
        let mut samples = BTreeMap::new();
        samples.insert(
            "s1".to_string(),
            vec![attempt(&gt, &[("A", TestOutcome::Passed)], 1, 1)],
        );

        let report = calculate_pass_at_k(&samples, 1, 5);
        assert_eq!(report.pass_at_k, 1.0);
    }

    #[test]
    fn average_pass_at_1_diagnostic() {
        let gt = [("A", TestOutcome::Passed), ("B", TestOutcome::Passed)];
        let mut samples = BTreeMap::new();
        samples.insert(
            "s1".to_string(),
            vec![
                attempt(&gt, &[("A", TestOutcome::Passed)], 2, 1),
                attempt(&gt, &[], 2, 2),
            ],
        );

        let report = calculate_pass_at_k(&samples, 1, 2);
        // Mean of 1/2 and 2/2.
        assert_eq!(report.avg_pass_at_1, 0.75);
    }

    #[test]
    fn missing_artifacts_load_as_zero_records() {
        let root = std::env::temp_dir().join(format!(
            "passbench-aggregate-missing-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("attempt_a")).unwrap();
        std::fs::create_dir_all(root.join("attempt_b")).unwrap();

        let sample_results = load_attempts(
            &root,
            &["attempt_a".to_string(), "attempt_b".to_string()],
            &["s1".to_string()],
        );
        std::fs::remove_dir_all(&root).unwrap();

        let attempts = &sample_results["s1"];
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].gt_passed, 0);
        assert!(attempts[0].gt_detailed.is_empty());

        // Zero records still count against the corpus mean.
        let report = calculate_pass_at_k(&sample_results, 1, 2);
        assert_eq!(report.pass_at_k, 0.0);
    }

    #[test]
    fn missing_attempt_folders_are_skipped_entirely() {
        let sample_results = load_attempts(
            Path::new("/nonexistent/passbench-eval-root"),
            &["attempt_a".to_string()],
            &["s1".to_string()],
        );
        assert!(sample_results.is_empty());
    }
}
