/// Workspace Materializer - Shell Script Construction
///
/// **Core Responsibility:**
/// Turn a path->content map into a `sh` script that recreates those files
/// inside the container filesystem, then invokes the test suite.
///
/// **Safety Rules:**
/// 1. File content travels base64-encoded: arbitrary bytes and shell
///    metacharacters survive the pipe, and content is never executed.
/// 2. Paths are single-quote escaped (' -> '\''), the one escape POSIX
///    single quotes need.
/// 3. The script only creates parent directories and writes the listed
///    files; it never deletes anything.
///
/// Errors in paths or content surface at script execution time inside the
/// container, not here.
use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use passbench_common::types::SampleMetadata;

/// Filename the structured report is written to and printed from.
pub const JSON_REPORT_FILENAME: &str = "pytest_report.json";

/// How the test suite is invoked and which parser applies afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Plain run; only the console summary line is available.
    Summary,
    /// Run with the structured-report flag, then print the report if it
    /// exists. Report absence never aborts the script.
    Detailed,
}

/// Escape a string for interpolation inside single quotes in `sh`.
pub fn quote_single(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// Join an in-container directory prefix with a relative path.
/// An absolute `rel` wins outright, matching `os.path.join` semantics.
pub fn join_container_path(dir: &str, rel: &str) -> String {
    if rel.starts_with('/') {
        rel.to_string()
    } else if dir.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), rel)
    }
}

fn split_dir_base(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

/// Append materialization commands for every file in the map, in
/// deterministic path order.
pub fn materialize_files(script: &mut String, dir_path: &str, files: &BTreeMap<String, String>) {
    for (rel_path, content) in files {
        let container_path = join_container_path(dir_path, rel_path);
        let escaped = quote_single(&container_path);
        let encoded = general_purpose::STANDARD.encode(content.as_bytes());
        script.push_str(&format!("mkdir -p \"$(dirname '{}')\"\n", escaped));
        script.push_str(&format!(
            "printf '%s' {} | base64 -d > '{}'\n",
            encoded, escaped
        ));
    }
}

/// Build the complete script: file materialization followed by the test
/// invocation for the requested mode.
///
/// `files` of `None` runs the suite against whatever the image already
/// contains (used when the baseline is baked into the image).
pub fn build_test_script(
    metadata: &SampleMetadata,
    files: Option<&BTreeMap<String, String>>,
    mode: TestMode,
) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n");

    if let Some(files) = files {
        materialize_files(&mut script, &metadata.dir_path, files);
    }

    let test_path = join_container_path(&metadata.dir_path, &metadata.test_file);
    let (test_dir, test_name) = split_dir_base(&test_path);
    script.push_str(&format!("cd '{}'\n", quote_single(test_dir)));

    match mode {
        TestMode::Summary => {
            script.push_str(&format!("pytest '{}'\n", quote_single(test_name)));
        }
        TestMode::Detailed => {
            // `|| true`: a failing suite must still reach the report print.
            script.push_str(&format!(
                "pytest -v --json-report --json-report-file={} '{}' || true\n",
                JSON_REPORT_FILENAME,
                quote_single(test_name)
            ));
            script.push_str(&format!(
                "if [ -f {report} ]; then cat {report}; else echo 'JSON report file not found.'; fi\n",
                report = JSON_REPORT_FILENAME
            ));
        }
    }

    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> SampleMetadata {
        serde_json::from_str(
            r#"{
                "package_name": "demo",
                "dir_path": "/repo/demo",
                "test_file": "tests/test_core.py",
                "GT_file_code": {}
            }"#,
        )
        .unwrap()
    }

    /// Recover (path, content) pairs from a materialization script by
    /// decoding the embedded base64 payloads.
    fn read_back(script: &str) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        for line in script.lines() {
            let Some(rest) = line.strip_prefix("printf '%s' ") else {
                continue;
            };
            let (encoded, target) = rest.split_once(" | base64 -d > ").unwrap();
            let decoded = general_purpose::STANDARD.decode(encoded).unwrap();
            let path = target
                .trim_start_matches('\'')
                .trim_end_matches('\'')
                .replace("'\\''", "'");
            files.insert(path, String::from_utf8(decoded).unwrap());
        }
        files
    }

    #[test]
    fn single_quote_escaping() {
        assert_eq!(quote_single("plain"), "plain");
        assert_eq!(quote_single("it's"), "it'\\''s");
    }

    #[test]
    fn container_path_join() {
        assert_eq!(join_container_path("/repo", "src/a.py"), "/repo/src/a.py");
        assert_eq!(join_container_path("/repo/", "a.py"), "/repo/a.py");
        assert_eq!(join_container_path("/repo", "/abs/a.py"), "/abs/a.py");
    }

    #[test]
    fn materialized_content_round_trips() {
        // Metacharacter-laden content must survive the shell unharmed.
        let mut files = BTreeMap::new();
        files.insert(
            "src/tricky.py".to_string(),
            "x = \"$(rm -rf /)\"\ny = '`backticks`'\nz = \"new\nline; && || > <\"\n".to_string(),
        );
        files.insert("src/unicode.py".to_string(), "s = 'héllo ✓'\n".to_string());

        let mut script = String::new();
        materialize_files(&mut script, "/repo/demo", &files);

        let expected: BTreeMap<String, String> = files
            .iter()
            .map(|(path, content)| (format!("/repo/demo/{}", path), content.clone()))
            .collect();
        assert_eq!(read_back(&script), expected);
    }

    #[test]
    fn script_structure_summary_mode() {
        let metadata = sample_metadata();
        let mut files = BTreeMap::new();
        files.insert("src/core.py".to_string(), "pass\n".to_string());

        let script = build_test_script(&metadata, Some(&files), TestMode::Summary);

        assert!(script.starts_with("#!/bin/sh\nset -e\n"));
        assert!(script.contains("mkdir -p \"$(dirname '/repo/demo/src/core.py')\""));
        assert!(script.contains("cd '/repo/demo/tests'\n"));
        assert!(script.contains("pytest 'test_core.py'\n"));
        assert!(!script.contains("--json-report"));
    }

    #[test]
    fn script_structure_detailed_mode() {
        let metadata = sample_metadata();
        let script = build_test_script(&metadata, None, TestMode::Detailed);

        // No materialization lines when no file map is given.
        assert!(!script.contains("base64 -d"));
        assert!(script.contains(
            "pytest -v --json-report --json-report-file=pytest_report.json 'test_core.py' || true\n"
        ));
        // Guarded report print: report absence never aborts the script.
        assert!(script.contains(
            "if [ -f pytest_report.json ]; then cat pytest_report.json; else echo 'JSON report file not found.'; fi\n"
        ));
    }

    #[test]
    fn quoted_paths_in_script() {
        let metadata: SampleMetadata = serde_json::from_str(
            r#"{
                "package_name": "q",
                "dir_path": "/it's/repo",
                "test_file": "test_q.py",
                "GT_file_code": {}
            }"#,
        )
        .unwrap();
        let script = build_test_script(&metadata, None, TestMode::Summary);
        assert!(script.contains("cd '/it'\\''s/repo'\n"));
    }
}
