/// Result Parser - Summary and Detailed Extraction
///
/// **Core Responsibility:**
/// Turn the raw text blob captured from a container run into an
/// `ExecutionRecord`.
///
/// Container output is untrusted: possibly truncated, a mix of human text
/// and at most one machine-readable report block. Both parsers are total.
/// The embedded JSON report is authoritative when present; the regex
/// summary counts are the always-available fallback, and every degradation
/// path is non-fatal with a recorded diagnostic (some images do not support
/// the structured-report flag at all).
use std::collections::BTreeMap;
use std::sync::LazyLock;

use passbench_common::types::{ExecutionRecord, TestOutcome};
use regex::Regex;
use tracing::{debug, warn};

static PASSED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passed").unwrap());
static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failed").unwrap());
static WARNINGS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) warnings?").unwrap());
static ERRORS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) errors?").unwrap());

static ERRORS_BANNER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"=+ ERRORS =+").unwrap());
static FAILURES_BANNER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=+ FAILURES =+").unwrap());
static NEXT_BANNER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n=+ \w+ =+").unwrap());

/// Start marker of the embedded pytest-json-report document. The report is
/// printed near the end of the run, so the last occurrence wins.
const REPORT_START_MARKER: &str = "{\"created\":";

fn capture_count(re: &Regex, output: &str) -> u32 {
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Free-text section following a banner, up to the next banner or end of
/// text. Returns the trimmed block (possibly empty) when the banner exists.
fn capture_section(banner_re: &Regex, output: &str) -> Option<String> {
    let banner = banner_re.find(output)?;
    let rest = &output[banner.end()..];
    let end = NEXT_BANNER_RE
        .find(rest)
        .map(|next| next.start())
        .unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

/// Summary parser: scans for the four count patterns independently (absent
/// pattern counts as zero) and extracts the ERRORS / FAILURES text blocks.
/// Total - arbitrary garbage input yields an all-zero record.
pub fn parse_summary(output: &str) -> ExecutionRecord {
    let passed = capture_count(&PASSED_RE, output);
    let failed = capture_count(&FAILED_RE, output);
    let warnings = capture_count(&WARNINGS_RE, output);
    let errors = capture_count(&ERRORS_RE, output);

    ExecutionRecord {
        passed,
        failed,
        warnings,
        errors,
        total_tests: passed + failed + errors + warnings,
        errors_info: capture_section(&ERRORS_BANNER_RE, output),
        failures_info: capture_section(&FAILURES_BANNER_RE, output),
        output: output.to_string(),
        ..ExecutionRecord::default()
    }
}

/// Detailed parser: summary extraction plus the per-test outcome map from
/// the embedded JSON report. Decodes exactly one JSON document starting at
/// the last report marker; trailing non-report text is ignored, not treated
/// as corruption.
pub fn parse_detailed(output: &str) -> ExecutionRecord {
    let mut record = parse_summary(output);

    let Some(start) = output.rfind(REPORT_START_MARKER) else {
        debug!("no embedded JSON report marker in output");
        return record;
    };

    let mut stream = serde_json::Deserializer::from_str(&output[start..])
        .into_iter::<serde_json::Value>();
    let document = match stream.next() {
        Some(Ok(document)) => document,
        Some(Err(e)) => {
            record.detailed_parse_error =
                Some(format!("report decode failed at byte offset {}: {}", start, e));
            return record;
        }
        None => {
            record.detailed_parse_error =
                Some(format!("no JSON document at byte offset {}", start));
            return record;
        }
    };

    let Some(tests) = document.get("tests").and_then(|t| t.as_array()) else {
        record.detailed_parse_error =
            Some("report parsed, but 'tests' key missing or not a list".to_string());
        return record;
    };

    let mut detailed = BTreeMap::new();
    for test in tests {
        let nodeid = test
            .get("nodeid")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty());
        match nodeid {
            Some(id) => {
                let outcome = match test.get("outcome") {
                    Some(serde_json::Value::String(s)) => s.to_lowercase(),
                    Some(other) => other.to_string().to_lowercase(),
                    None => "unknown".to_string(),
                };
                detailed.insert(id.to_string(), TestOutcome::from(outcome.as_str()));
            }
            None => {
                warn!(entry = %test, "test entry missing nodeid, skipping");
            }
        }
    }

    if detailed.is_empty() {
        record.detailed_parse_error =
            Some("report 'tests' list contained no entries with usable nodeids".to_string());
    } else {
        record.detailed_dict = detailed;
        record.has_detailed_results = true;
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_from_typical_line() {
        let record = parse_summary("=== 12 passed, 3 failed, 1 warning in 4.2s ===");
        assert_eq!(record.passed, 12);
        assert_eq!(record.failed, 3);
        assert_eq!(record.warnings, 1);
        assert_eq!(record.errors, 0);
        assert_eq!(record.total_tests, 16);
    }

    #[test]
    fn summary_parser_is_total_on_garbage() {
        let record = parse_summary("complete nonsense $ %% \x00 no counters here");
        assert_eq!(record.passed, 0);
        assert_eq!(record.failed, 0);
        assert_eq!(record.warnings, 0);
        assert_eq!(record.errors, 0);
        assert_eq!(record.total_tests, 0);
        assert!(record.errors_info.is_none());
        assert!(record.failures_info.is_none());
    }

    #[test]
    fn plural_and_singular_counters() {
        let record = parse_summary("2 errors, 5 warnings, 1 passed");
        assert_eq!(record.errors, 2);
        assert_eq!(record.warnings, 5);
        assert_eq!(record.passed, 1);
        assert_eq!(record.total_tests, 8);
    }

    #[test]
    fn section_extraction_bounded_by_next_banner() {
        let output = "\
1 failed, 1 error\n\
==== ERRORS ====\n\
ImportError in conftest\n\
==== FAILURES ====\n\
test_x assertion diff";
        let record = parse_summary(output);
        assert_eq!(record.errors_info.as_deref(), Some("ImportError in conftest"));
        assert_eq!(record.failures_info.as_deref(), Some("test_x assertion diff"));
    }

    #[test]
    fn multi_word_banners_do_not_terminate_a_section() {
        // The next-banner pattern matches single-word banners only, so the
        // "short test summary info" block stays inside the FAILURES text.
        let output = "\
==== FAILURES ====\n\
test_x assertion diff\n\
==== short test summary info ====\n\
1 failed";
        let record = parse_summary(output);
        assert_eq!(
            record.failures_info.as_deref(),
            Some("test_x assertion diff\n==== short test summary info ====\n1 failed")
        );
    }

    #[test]
    fn section_extraction_runs_to_end_of_text() {
        let output = "==== FAILURES ====\ntrailing failure text\nmore lines";
        let record = parse_summary(output);
        assert_eq!(
            record.failures_info.as_deref(),
            Some("trailing failure text\nmore lines")
        );
    }

    #[test]
    fn detailed_map_from_embedded_report() {
        let output = concat!(
            "2 passed\n",
            r#"{"created": 1.0, "tests": [{"nodeid": "t1", "outcome": "passed"}, {"nodeid": "t2", "outcome": "FAILED"}]}"#,
            "\ntrailing non-report text\n"
        );
        let record = parse_detailed(output);
        assert!(record.has_detailed_results);
        assert!(record.detailed_parse_error.is_none());
        assert_eq!(record.detailed_dict["t1"], TestOutcome::Passed);
        assert_eq!(record.detailed_dict["t2"], TestOutcome::Failed);
        assert_eq!(record.passed, 2);
    }

    #[test]
    fn entries_without_nodeid_are_skipped() {
        let output = r#"{"created": 1.0, "tests": [{"outcome": "passed"}, {"nodeid": "", "outcome": "failed"}]}"#;
        let record = parse_detailed(output);
        assert!(!record.has_detailed_results);
        assert!(record.detailed_dict.is_empty());
        assert!(record
            .detailed_parse_error
            .as_deref()
            .unwrap()
            .contains("no entries with usable nodeids"));
    }

    #[test]
    fn missing_tests_key_degrades() {
        let output = r#"{"created": 1.0, "summary": {"passed": 3}}"#;
        let record = parse_detailed(output);
        assert!(!record.has_detailed_results);
        assert!(record
            .detailed_parse_error
            .as_deref()
            .unwrap()
            .contains("'tests' key missing"));
    }

    #[test]
    fn truncated_report_degrades_keeping_summary() {
        let output = "5 passed\n{\"created\": 1.0, \"tests\": [";
        let record = parse_detailed(output);
        assert_eq!(record.passed, 5);
        assert!(!record.has_detailed_results);
        assert!(record
            .detailed_parse_error
            .as_deref()
            .unwrap()
            .contains("decode failed"));
    }

    #[test]
    fn no_marker_means_no_detailed_results_and_no_diagnostic() {
        let record = parse_detailed("3 passed in 0.1s");
        assert_eq!(record.passed, 3);
        assert!(!record.has_detailed_results);
        assert!(record.detailed_parse_error.is_none());
    }

    #[test]
    fn last_marker_occurrence_wins() {
        // An earlier echo of the marker inside test output must not confuse
        // the locator; the real report is printed last.
        let output = concat!(
            r#"stdout noise {"created": "fake", "tests": "#,
            "\n1 passed\n",
            r#"{"created": 2.0, "tests": [{"nodeid": "real", "outcome": "passed"}]}"#
        );
        let record = parse_detailed(output);
        assert!(record.has_detailed_results);
        assert_eq!(record.detailed_dict.len(), 1);
        assert_eq!(record.detailed_dict["real"], TestOutcome::Passed);
    }

    #[test]
    fn non_string_outcome_is_stringified() {
        let output = r#"{"created": 1.0, "tests": [{"nodeid": "t", "outcome": 7}]}"#;
        let record = parse_detailed(output);
        assert!(record.has_detailed_results);
        assert_eq!(record.detailed_dict["t"], TestOutcome::Unknown);
    }
}
