//! Sequential scenario runner with a run-wide deadline.

use crate::models::{SuiteReport, TestResult};
use crate::scenarios::{ScenarioContext, ScenarioError, TestScenario, all_scenarios};
use ddq_core::{ConfigError, HarnessConfig};
use ddq_proto::{BackendConfig, BackendFactory};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Default watchdog for a whole run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(ddq_core::DEFAULT_TIMEOUT_MS);

/// Time a scenario still gets past the run deadline to stop and disconnect
/// its instances.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Conditions that end a run without a complete report.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The run deadline elapsed. `partial` holds what finished before it.
    #[error("run did not complete within {timeout:?}")]
    Timeout {
        timeout: Duration,
        partial: Box<SuiteReport>,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
}

/// Runs conformance scenarios against one backend implementation.
pub struct BackendTester {
    factory: Arc<dyn BackendFactory>,
    config: BackendConfig,
    scenarios: Vec<Box<dyn TestScenario>>,
}

impl BackendTester {
    /// Creates a tester running every scenario.
    pub fn new(factory: Arc<dyn BackendFactory>, config: BackendConfig) -> Self {
        Self {
            factory,
            config,
            scenarios: all_scenarios(),
        }
    }

    /// Creates a tester from a validated harness config, applying its
    /// scenario filter.
    pub fn from_config(
        factory: Arc<dyn BackendFactory>,
        config: &HarnessConfig,
    ) -> Result<Self, HarnessError> {
        config.validate()?;
        Self::new(factory, config.backend.clone()).only(&config.scenarios)
    }

    /// Replaces the scenario list.
    pub fn with_scenarios(mut self, scenarios: Vec<Box<dyn TestScenario>>) -> Self {
        self.scenarios = scenarios;
        self
    }

    /// Keeps only the scenarios named in `ids`. An empty list keeps all.
    pub fn only<S: AsRef<str>>(mut self, ids: &[S]) -> Result<Self, HarnessError> {
        if ids.is_empty() {
            return Ok(self);
        }
        if let Some(unknown) = ids
            .iter()
            .map(AsRef::as_ref)
            .find(|id| !self.scenarios.iter().any(|s| s.id() == *id))
        {
            return Err(HarnessError::UnknownScenario(unknown.to_string()));
        }

        self.scenarios
            .retain(|s| ids.iter().any(|id| id.as_ref() == s.id()));
        Ok(self)
    }

    pub fn scenario_ids(&self) -> Vec<&str> {
        self.scenarios.iter().map(|s| s.id()).collect()
    }

    /// Runs every scenario in order without stopping at failures.
    ///
    /// Returns [`HarnessError::Timeout`] with the partial report if the
    /// deadline elapses first.
    pub async fn run_all(&self, timeout: Duration) -> Result<SuiteReport, HarnessError> {
        let ctx = ScenarioContext::new(Arc::clone(&self.factory), self.config.clone(), timeout);
        let started = Instant::now();
        let mut report = SuiteReport::new();

        info!(
            scenarios = self.scenarios.len(),
            timeout = ?timeout,
            owner = %self.config.owner,
            "Starting backend conformance run"
        );

        for (index, scenario) in self.scenarios.iter().enumerate() {
            if Instant::now() >= ctx.deadline() {
                return Err(self.abort(report, index, started, timeout));
            }

            info!(scenario = scenario.id(), "Running scenario");
            let scenario_started = Instant::now();
            // Scenario steps stop at the deadline; teardown may overrun it
            let cutoff = ctx.deadline() + TEARDOWN_GRACE;
            let outcome = match tokio::time::timeout_at(cutoff, scenario.run(&ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(scenario = scenario.id(), "Teardown did not finish within the grace period");
                    Err(ScenarioError::Timeout(timeout))
                }
            };
            let elapsed = scenario_started.elapsed();

            match outcome {
                Ok(()) => {
                    info!(scenario = scenario.id(), duration = ?elapsed, "Scenario passed");
                    report.results.push(TestResult::passed(
                        scenario.id(),
                        scenario.description(),
                        elapsed,
                    ));
                }
                Err(e) if e.is_timeout() => {
                    error!(scenario = scenario.id(), "Run deadline reached");
                    report.results.push(TestResult::failed(
                        scenario.id(),
                        scenario.description(),
                        e.to_failure(),
                        elapsed,
                    ));
                    return Err(self.abort(report, index + 1, started, timeout));
                }
                Err(e) => {
                    warn!(scenario = scenario.id(), error = %e, "Scenario failed");
                    report.results.push(TestResult::failed(
                        scenario.id(),
                        scenario.description(),
                        e.to_failure(),
                        elapsed,
                    ));
                }
            }
        }

        report.duration = started.elapsed();
        info!(
            passed = report.passed_count(),
            total = report.results.len(),
            duration = ?report.duration,
            "Conformance run finished"
        );
        Ok(report)
    }

    fn abort(
        &self,
        mut report: SuiteReport,
        next: usize,
        started: Instant,
        timeout: Duration,
    ) -> HarnessError {
        report.skipped = self.scenarios[next..]
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        report.duration = started.elapsed();
        HarnessError::Timeout {
            timeout,
            partial: Box::new(report),
        }
    }
}
