//! Result models for scenario runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Category of a scenario failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connecting or disconnecting failed.
    Connection,
    /// Sending a message failed unexpectedly.
    Send,
    /// Listening, requeue, heartbeat, remove or the error channel failed.
    Operation,
    /// The backend broke a diagnostic, timing, locking or dedup contract.
    Assertion,
    /// The global watchdog elapsed.
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Connection => "connection",
            FailureKind::Send => "send",
            FailureKind::Operation => "operation",
            FailureKind::Assertion => "assertion",
            FailureKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Why a scenario failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

/// Result of running one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub scenario_id: String,
    pub scenario_description: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    pub duration: Duration,
}

impl TestResult {
    /// Creates a passing result.
    pub fn passed(id: impl Into<String>, description: impl Into<String>, duration: Duration) -> Self {
        Self {
            scenario_id: id.into(),
            scenario_description: description.into(),
            passed: true,
            failure: None,
            duration,
        }
    }

    /// Creates a failing result.
    pub fn failed(
        id: impl Into<String>,
        description: impl Into<String>,
        failure: Failure,
        duration: Duration,
    ) -> Self {
        Self {
            scenario_id: id.into(),
            scenario_description: description.into(),
            passed: false,
            failure: Some(failure),
            duration,
        }
    }
}

/// Per-scenario results of one run.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub results: Vec<TestResult>,
    /// Scenarios never started because the watchdog elapsed first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl SuiteReport {
    /// Starts an empty report stamped with the current time.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            duration: Duration::ZERO,
            results: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Returns true if every recorded scenario passed and none were skipped.
    pub fn all_passed(&self) -> bool {
        self.skipped.is_empty() && self.results.iter().all(|r| r.passed)
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    /// Results of the scenarios that failed.
    pub fn failures(&self) -> impl Iterator<Item = &TestResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    /// Looks up the result for a scenario id.
    pub fn result(&self, scenario_id: &str) -> Option<&TestResult> {
        self.results.iter().find(|r| r.scenario_id == scenario_id)
    }

    /// Collapses the report into a single pass/fail outcome.
    pub fn into_result(self) -> Result<SuiteReport, SuiteFailed> {
        if self.all_passed() {
            Ok(self)
        } else {
            Err(SuiteFailed {
                report: Box::new(self),
            })
        }
    }
}

impl Default for SuiteReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate failure of a run. The report keeps the per-scenario detail.
#[derive(Debug, Error)]
#[error("Backend functional test failed.")]
pub struct SuiteFailed {
    pub report: Box<SuiteReport>,
}
