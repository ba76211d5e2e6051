//! # ddq-e2e
//!
//! Functional conformance tests for DDQ queue backend plugins.
//!
//! A backend is handed over as a [`BackendFactory`] plus a base
//! [`BackendConfig`]. The runner creates fresh instances per scenario and
//! checks that the backend:
//!
//! - exposes polling diagnostics exactly while listening
//! - never delivers one message to two consumers at once
//! - keeps a heartbeated lease for the full lifetime
//! - refuses duplicate sends and redelivers them exactly once
//!
//! ```no_run
//! use ddq_core::MemoryBackendFactory;
//! use ddq_proto::BackendConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let tester = ddq_e2e::tester(Arc::new(MemoryBackendFactory::new()), BackendConfig::default());
//! let report = tester.run_all(ddq_e2e::DEFAULT_TIMEOUT).await?;
//! report.into_result()?;
//! # Ok(())
//! # }
//! ```

pub mod diagnostics;
pub mod models;
pub mod reporter;
pub mod runner;
pub mod scenarios;

pub use diagnostics::assert_diagnostic_state;
pub use models::{Failure, FailureKind, SuiteFailed, SuiteReport, TestResult};
pub use runner::{BackendTester, DEFAULT_TIMEOUT, HarnessError, TEARDOWN_GRACE};
pub use scenarios::{ScenarioContext, ScenarioError, TestScenario, all_scenarios};

use ddq_proto::{BackendConfig, BackendFactory};
use std::sync::Arc;

/// Creates a tester running every scenario against backends from `factory`.
pub fn tester(factory: Arc<dyn BackendFactory>, config: BackendConfig) -> BackendTester {
    BackendTester::new(factory, config)
}
