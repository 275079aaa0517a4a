//! Result aggregation
//!
//! Counts are summed bottom-up (test -> example -> run). Durations are
//! measured independently at each level.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::HarnessResult;

/// Result of running all specs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Results {
    pub examples: Vec<ExampleResult>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

impl Results {
    pub fn push(&mut self, example: ExampleResult) {
        self.total += example.total;
        self.passed += example.passed;
        self.failed += example.failed;
        self.skipped += example.skipped;
        self.examples.push(example);
    }

    /// No failed tests and no spec-level errors
    pub fn success(&self) -> bool {
        self.failed == 0 && self.examples.iter().all(ExampleResult::success)
    }

    /// Every failed test with the example it belongs to
    pub fn failures(&self) -> impl Iterator<Item = (&ExampleResult, &TestResult)> {
        self.examples
            .iter()
            .flat_map(|ex| ex.tests.iter().filter(|t| !t.passed).map(move |t| (ex, t)))
    }

    /// Write results as pretty JSON to `dir/test-results.json`
    pub fn write_json(&self, dir: &Path) -> HarnessResult<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let path = dir.join("test-results.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Result of one spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExampleResult {
    pub name: String,
    pub tests: Vec<TestResult>,
    /// Declared cases, whether or not they ran
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Spec-level failure such as a server that never became ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExampleResult {
    pub fn new(name: impl Into<String>, total: usize) -> Self {
        Self {
            name: name.into(),
            total,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.error.is_none()
    }

    pub fn record(&mut self, test: TestResult) {
        if test.passed {
            self.passed += 1;
            if test.skipped {
                self.skipped += 1;
            }
        } else {
            self.failed += 1;
        }
        self.tests.push(test);
    }

    /// Mark every declared case failed without running it
    pub fn fail_all<'a>(&mut self, error: String, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            self.tests.push(TestResult::failed(
                name,
                format!("not run: {error}"),
                Duration::ZERO,
                None,
            ));
        }
        self.failed = self.total;
        self.passed = 0;
        self.error = Some(error);
    }

    pub fn finish(&mut self, started: Instant) {
        self.duration_ms = millis(started.elapsed());
    }
}

/// Result of one test case
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    /// Assertion errors joined with `"; "`, or an execution failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Context for diagnosing failures; only captured when the test fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<TestResultDetails>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            name: name.into(),
            passed: true,
            duration_ms: millis(elapsed),
            ..Default::default()
        }
    }

    pub fn skipped(name: impl Into<String>, reason: &str) -> Self {
        Self {
            name: name.into(),
            passed: true,
            skipped: true,
            error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn failed(
        name: impl Into<String>,
        error: String,
        elapsed: Duration,
        details: Option<TestResultDetails>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            error: Some(error),
            duration_ms: millis(elapsed),
            details,
            ..Default::default()
        }
    }
}

/// What the test did, recorded for failed tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestResultDetails {
    Http {
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Cli {
        args: Vec<String>,
        /// -1 when the process was killed or never exited on its own
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
}

pub(crate) fn millis(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}
