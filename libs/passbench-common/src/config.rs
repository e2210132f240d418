// Harness configuration for container test runs
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_timeout_ms() -> u64 {
    600_000 // 10 minutes per container run
}

fn default_report_filename() -> String {
    "pytest_report.json".to_string()
}

/// Resource and timeout settings applied to every container run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Hard wall-clock bound per container invocation. On expiry the
    /// container is killed and the run scores zero credit.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub cpu_limit: Option<f32>,
    /// Filename the structured test report is written to inside the
    /// container working directory.
    #[serde(default = "default_report_filename")]
    pub report_filename: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            memory_limit_mb: None,
            cpu_limit: None,
            report_filename: default_report_filename(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a JSON file.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read harness config: {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse harness config: {}", config_path.display()))
    }

    /// Load from an optional path, falling back to defaults when no path is
    /// given. A given-but-unreadable path is an error, not a silent default.
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn memory_limit_bytes(&self) -> Option<i64> {
        self.memory_limit_mb.map(|mb| i64::from(mb) * 1024 * 1024)
    }

    pub fn nano_cpus(&self) -> Option<i64> {
        self.cpu_limit.map(|cpus| (f64::from(cpus) * 1_000_000_000.0) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_path_given() {
        let config = HarnessConfig::load_or_default(None).unwrap();
        assert_eq!(config.timeout_ms, 600_000);
        assert_eq!(config.report_filename, "pytest_report.json");
        assert!(config.memory_limit_bytes().is_none());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{"timeout_ms": 30000, "memory_limit_mb": 512}"#).unwrap();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.memory_limit_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(config.report_filename, "pytest_report.json");
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = HarnessConfig::load(Path::new("/nonexistent/harness.json"));
        assert!(result.is_err());
    }
}
