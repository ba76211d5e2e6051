//! Wrapped-message lifecycle scenario.
//!
//! Drives one message through every lease operation:
//!
//! ```text
//! Sent --receive, requeue--> Requeued --receive, heartbeat--> HeartbeatSent
//!      --lease expires, receive, remove--> Removed
//! ```
//!
//! After the heartbeat the message is deliberately left alone. The backend's
//! restorer must hand it back only once the renewed lease has run out, so the
//! final delivery arriving before `heartbeatLifetimeSeconds` have elapsed
//! since the heartbeat is a failure.

use super::{ScenarioContext, ScenarioError, TestScenario, teardown};
use async_trait::async_trait;
use ddq_proto::QueueBackend;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info};

const PAYLOAD: &str = "message";

/// Stages of the wrapped-message lifecycle.
///
/// An error raised while working towards a stage is attributed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrappedStage {
    Sent,
    Requeued,
    HeartbeatSent,
    Removed,
}

impl fmt::Display for WrappedStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WrappedStage::Sent => "sent",
            WrappedStage::Requeued => "requeued",
            WrappedStage::HeartbeatSent => "heartbeat-sent",
            WrappedStage::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Verifies requeue, heartbeat and remove, and that lease cleanup waits for
/// the configured lifetime.
///
/// # Example
///
/// ```no_run
/// use ddq_e2e::scenarios::{TestScenario, WrappedMessageScenario};
///
/// let scenario = WrappedMessageScenario::new();
/// assert_eq!(scenario.id(), "wrapped-message");
/// ```
pub struct WrappedMessageScenario {
    id: String,
    description: String,
}

impl WrappedMessageScenario {
    pub fn new() -> Self {
        Self {
            id: "wrapped-message".to_string(),
            description: "Requeue, heartbeat and remove; cleanup honours the lease lifetime"
                .to_string(),
        }
    }

    async fn drive(
        &self,
        ctx: &ScenarioContext,
        backend: &dyn QueueBackend,
    ) -> Result<(), ScenarioError> {
        let topic = backend.config().topics.clone();
        let lifetime = backend.config().heartbeat_lifetime();

        ctx.connect(backend).await?;
        let mut rx = backend.subscribe();

        // -> Sent
        ctx.within(backend.send_message(PAYLOAD, &topic))
            .await?
            .map_err(|e| ScenarioError::Send(e).during(WrappedStage::Sent))?;
        info!("Test message inserted successfully");

        // Sent -> Requeued
        let stage = WrappedStage::Requeued;
        let delivery = ctx
            .receive_once(backend, &mut rx, PAYLOAD)
            .await
            .map_err(|e| e.during(stage))?;
        let received_at = Instant::now();
        ctx.requeue(&delivery).await.map_err(|e| e.during(stage))?;
        let window = ctx.requeue_window(received_at);
        debug!(%stage, window = ?window, "Stage reached");

        // Requeued -> HeartbeatSent, the requeue must beat lease expiry
        ctx.start_listening(backend).await.map_err(|e| e.during(stage))?;
        let redelivered = ctx.receive_requeued(&mut rx, PAYLOAD, window).await;
        ctx.stop_listening(backend).await.map_err(|e| e.during(stage))?;
        let delivery = match redelivered {
            Ok(redelivery) => redelivery,
            Err(e) => {
                ctx.discard(&delivery).await;
                return Err(e.during(stage));
            }
        };

        let stage = WrappedStage::HeartbeatSent;
        let heartbeat_at = Instant::now();
        ctx.heartbeat(&delivery).await.map_err(|e| e.during(stage))?;
        let cleanup_due = heartbeat_at + lifetime;
        debug!(%stage, lifetime = ?lifetime, "Stage reached");

        // HeartbeatSent -> Removed, once cleanup has released the message
        let stage = WrappedStage::Removed;
        let delivery = ctx
            .receive_once(backend, &mut rx, PAYLOAD)
            .await
            .map_err(|e| e.during(stage))?;
        let cleanup_elapsed = Instant::now() >= cleanup_due;
        if !cleanup_elapsed {
            // Still remove it so later runs start from an empty queue
            ctx.discard(&delivery).await;
            return Err(ScenarioError::Assertion(format!(
                "message was made available again {:?} after the heartbeat, before the {:?} lease lifetime elapsed",
                heartbeat_at.elapsed(),
                lifetime
            ))
            .during(stage));
        }
        info!("Heartbeat lifetime elapsed before redelivery");
        ctx.remove(&delivery).await.map_err(|e| e.during(stage))?;
        debug!(%stage, "Stage reached");

        Ok(())
    }
}

impl Default for WrappedMessageScenario {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestScenario for WrappedMessageScenario {
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
