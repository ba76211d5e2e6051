//! Polling lifecycle scenario.
//!
//! Starting to listen must expose every diagnostic attribute and stopping
//! must remove all of them. Two full cycles are run: an attribute leaking
//! from the first cycle would be indistinguishable from success on a single
//! cycle.

use super::{ScenarioContext, ScenarioError, TestScenario, teardown};
use crate::diagnostics::assert_diagnostic_state;
use async_trait::async_trait;
use ddq_proto::{DiagnosticAttribute, QueueBackend};
use tracing::debug;

/// Number of start/stop cycles checked.
const CYCLES: usize = 2;

/// Verifies diagnostic attributes track the listening state.
///
/// # Example
///
/// ```no_run
/// use ddq_e2e::scenarios::{PollingScenario, TestScenario};
///
/// let scenario = PollingScenario::new();
/// assert_eq!(scenario.id(), "polling");
/// ```
pub struct PollingScenario {
    id: String,
    description: String,
}

impl PollingScenario {
    pub fn new() -> Self {
        Self {
            id: "polling".to_string(),
            description: "Diagnostic attributes exist only while polling".to_string(),
        }
    }

    async fn drive(
        &self,
        ctx: &ScenarioContext,
        backend: &dyn QueueBackend,
    ) -> Result<(), ScenarioError> {
        assert_diagnostic_state(backend, &DiagnosticAttribute::ALL, false)
            .map_err(|e| e.during("before connect"))?;
        ctx.connect(backend).await?;

        for cycle in 1..=CYCLES {
            ctx.start_listening(backend).await?;
            assert_diagnostic_state(backend, &DiagnosticAttribute::ALL, true)
                .map_err(|e| e.during(format!("cycle {} started", cycle)))?;

            ctx.stop_listening(backend).await?;
            assert_diagnostic_state(backend, &DiagnosticAttribute::ALL, false)
                .map_err(|e| e.during(format!("cycle {} stopped", cycle)))?;

            debug!(cycle, "Polling cycle verified");
        }

        Ok(())
    }
}

impl Default for PollingScenario {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestScenario for PollingScenario {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        let backend = ctx.instance()?;
        let result = self.drive(ctx, backend.as_ref()).await;
        let closed = teardown(backend.as_ref()).await;
        result.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;
    use crate::scenarios::test_support::context;
    use ddq_core::Faults;

    #[test]
    fn test_polling_scenario_new() {
        let scenario = PollingScenario::new();
        assert_eq!(scenario.id(), "polling");
        assert!(!scenario.description().is_empty());
    }

    #[tokio::test]
    async fn test_polling_passes_on_conforming_backend() {
        let (_factory, ctx) = context(Faults::none());
        PollingScenario::new().run(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_detects_leaked_diagnostics() {
        let (_factory, ctx) = context(Faults {
            leak_diagnostics: true,
            ..Faults::default()
        });
        let err = PollingScenario::new().run(&ctx).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Assertion);
        assert!(err.to_string().starts_with("[cycle 1 stopped]"));
    }
}
