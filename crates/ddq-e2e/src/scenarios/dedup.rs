//! Deduplication scenario.

use super::{ScenarioContext, ScenarioError, TestScenario, teardown};
use async_trait::async_trait;
use ddq_proto::QueueBackend;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const PAYLOAD: &str = "message";

/// Margin added to the lease lifetime while checking that no further
/// redelivery happens.
const QUIET_MARGIN: Duration = Duration::from_secs(1);

/// Ways a backend can break the dedup contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupViolation {
    #[error("duplicate send of a pending message was accepted")]
    DuplicateAccepted,

    #[error("no compensating redelivery within {window:?} after removing the original")]
    MissingRedelivery { window: Duration },

    #[error("message redelivered again within {window:?} after the compensating redelivery was removed")]
    SpuriousRedelivery { window: Duration },
}

/// Verifies a duplicate send is refused and results in exactly one
/// compensating redelivery.
pub struct DedupScenario {
    id: String,
    description: String,
}

impl DedupScenario {
    pub fn new() -> Self {
        Self {
            id: "dedup".to_string(),
            description: "Duplicate sends are refused and redelivered exactly once".to_string(),
        }
    }

    async fn drive(
        &self,
        ctx: &ScenarioContext,
        backend: &dyn QueueBackend,
    ) -> Result<(), ScenarioError> {
        let config = backend.config();
        let topic = config.topics.clone();
        let lifetime = config.heartbeat_lifetime();

        ctx.connect(backend).await?;
        let mut rx = backend.subscribe();

        ctx.within(backend.send_message(PAYLOAD, &topic))
            .await?
            .map_err(ScenarioError::Send)?;
        ctx.start_listening(backend).await?;
        let original = ctx.receive_matching(&mut rx, PAYLOAD).await?;

        match ctx.within(backend.send_message(PAYLOAD, &topic)).await? {
            Ok(()) => {
                ctx.discard(&original).await;
                return Err(DedupViolation::DuplicateAccepted.into());
            }
            Err(e) if e.is_duplicate() => debug!(error = %e, "Duplicate send refused"),
            Err(e) => return Err(ScenarioError::Send(e)),
        }

        ctx.remove(&original).await?;

        let window = lifetime + config.polling_delay();
        let Some(redelivery) = ctx.receive_within(&mut rx, PAYLOAD, window).await? else {
            return Err(DedupViolation::MissingRedelivery { window }.into());
        };
        info!("Compensating redelivery received");
        ctx.remove(&redelivery).await?;

        let window = lifetime + QUIET_MARGIN;
        if let Some(extra) = ctx.receive_within(&mut rx, PAYLOAD, window).await? {
            ctx.discard(&extra).await;
            return Err(DedupViolation::SpuriousRedelivery { window }.into());
        }

        Ok(())
    }
}

impl Default for DedupScenario {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestScenario for DedupScenario {
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

    fn violation(err: ScenarioError) -> DedupViolation {
        match err {
            ScenarioError::Dedup(violation) => violation,
            other => panic!("expected a dedup violation, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_dedup_passes_on_conforming_backend() {
        let (factory, ctx) = context(Faults::none());
        DedupScenario::new().run(&ctx).await.unwrap();
        assert!(factory.table(ctx.config()).is_empty());
    }

    #[tokio::test]
    async fn test_dedup_detects_accepted_duplicate() {
        let (factory, ctx) = context(Faults {
            accept_duplicates: true,
            ..Faults::default()
        });
        let err = DedupScenario::new().run(&ctx).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Assertion);
        assert_eq!(violation(err), DedupViolation::DuplicateAccepted);
        // The accepted copy is still queued
        assert_eq!(factory.table(ctx.config()).count_payload(PAYLOAD), 1);
    }

    #[tokio::test]
    async fn test_dedup_detects_missing_redelivery() {
        let (_factory, ctx) = context(Faults {
            skip_compensating_redelivery: true,
            ..Faults::default()
        });
        let err = DedupScenario::new().run(&ctx).await.unwrap_err();

        assert!(matches!(
            violation(err),
            DedupViolation::MissingRedelivery { window } if window == Duration::from_millis(1050)
        ));
    }

    #[tokio::test]
    async fn test_dedup_detects_repeated_redelivery() {
        let (factory, ctx) = context(Faults {
            repeat_compensating_redelivery: true,
            ..Faults::default()
        });
        let err = DedupScenario::new().run(&ctx).await.unwrap_err();

        assert_eq!(err.kind(), FailureKind::Assertion);
        assert_eq!(
            violation(err),
            DedupViolation::SpuriousRedelivery {
                window: Duration::from_secs(2)
            }
        );
        // Every removal puts the message back
        assert_eq!(factory.table(ctx.config()).count_payload(PAYLOAD), 1);
    }

    #[test]
    fn test_violation_messages_are_distinct() {
        let window = Duration::from_secs(2);
        let messages = [
            DedupViolation::DuplicateAccepted.to_string(),
            DedupViolation::MissingRedelivery { window }.to_string(),
            DedupViolation::SpuriousRedelivery { window }.to_string(),
        ];
        assert_ne!(messages[0], messages[1]);
        assert_ne!(messages[1], messages[2]);
    }
}
