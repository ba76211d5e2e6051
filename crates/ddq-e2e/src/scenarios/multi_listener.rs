//! Multi-listener exclusivity scenario.
//!
//! Two instances with distinct owners listen on the same queue and topic. One
//! message is sent. Whichever instance receives it first stops listening,
//! holds the message for [`SETTLE_DELAY`] while the other instance is watched,
//! then requeues it. The message must then reach the other instance, which
//! removes it.

use super::{Inbox, ScenarioContext, ScenarioError, TestScenario, not_redelivered, teardown};
use async_trait::async_trait;
use ddq_proto::{BackendEvent, Delivery, EventReceiver, QueueBackend};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long the first holder keeps the message before requeueing it.
pub const SETTLE_DELAY: Duration = Duration::from_millis(250);

const PAYLOAD: &str = "multiMsg";

/// One listening instance and what it has been sent so far.
struct Listener<'b> {
    backend: &'b dyn QueueBackend,
    rx: EventReceiver,
    inbox: Inbox<'static>,
}

impl<'b> Listener<'b> {
    fn new(backend: &'b dyn QueueBackend) -> Self {
        Self {
            backend,
            rx: backend.subscribe(),
            inbox: Inbox::new(PAYLOAD),
        }
    }

    fn owner(&self) -> &str {
        &self.backend.config().owner
    }
}

enum Wake {
    Event(Option<BackendEvent>),
    Settled,
}

/// Verifies a message is never held by two consumers at once and that a
/// requeue hands it over to the other consumer.
pub struct MultiListenerScenario {
    id: String,
    description: String,
}

impl MultiListenerScenario {
    pub fn new() -> Self {
        Self {
            id: "multi-listener".to_string(),
            description: "Two listeners never hold the same message; requeue hands it over"
                .to_string(),
        }
    }

    async fn drive(
        &self,
        ctx: &ScenarioContext,
        first: &dyn QueueBackend,
        second: &dyn QueueBackend,
    ) -> Result<(), ScenarioError> {
        ctx.connect(first).await?;
        ctx.connect(second).await?;
        let mut listeners = [Listener::new(first), Listener::new(second)];

        let topic = first.config().topics.clone();
        ctx.within(first.send_message(PAYLOAD, &topic))
            .await?
            .map_err(ScenarioError::Send)?;

        for listener in &listeners {
            ctx.start_listening(listener.backend).await?;
        }

        let (holder, delivery) = next_delivery(ctx, &mut listeners).await?;
        let received_at = Instant::now();
        let other = 1 - holder;
        info!(holder = listeners[holder].owner(), "First delivery received");

        ctx.stop_listening(listeners[holder].backend).await?;
        if let Err(e) = watch_exclusive(ctx, &mut listeners[other]).await {
            ctx.discard(&delivery).await;
            return Err(e);
        }
        ctx.requeue(&delivery).await?;

        let window = ctx.requeue_window(received_at);
        let (receiver, redelivery) =
            match tokio::time::timeout(window, next_delivery(ctx, &mut listeners)).await {
                Ok(received) => received?,
                Err(_) => {
                    ctx.discard(&delivery).await;
                    return Err(not_redelivered(PAYLOAD, window));
                }
            };
        if receiver == holder {
            ctx.discard(&redelivery).await;
            return Err(ScenarioError::Assertion(format!(
                "message '{}' was redelivered to '{}' after it stopped listening",
                PAYLOAD,
                listeners[holder].owner()
            )));
        }

        ctx.remove(&redelivery).await?;
        info!(receiver = listeners[receiver].owner(), "Message handed over and removed");
        Ok(())
    }
}

impl Default for MultiListenerScenario {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TestScenario for MultiListenerScenario {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError> {
        let first = ctx.instance()?;
        let second = ctx.instance_as(&format!("{}Two", ctx.config().owner))?;

        let result = self.drive(ctx, first.as_ref(), second.as_ref()).await;
        let first_closed = teardown(first.as_ref()).await;
        let second_closed = teardown(second.as_ref()).await;
        result.and(first_closed).and(second_closed)
    }
}

/// Waits for the test message on either listener. Returns the listener index.
async fn next_delivery(
    ctx: &ScenarioContext,
    listeners: &mut [Listener<'_>; 2],
) -> Result<(usize, Delivery), ScenarioError> {
    loop {
        let [first, second] = &mut *listeners;
        let (index, event) = ctx
            .within(async {
                tokio::select! {
                    event = first.rx.recv() => (0, event),
                    event = second.rx.recv() => (1, event),
                }
            })
            .await?;

        if let Some(delivery) = listeners[index].inbox.accept(event)? {
            debug!(owner = listeners[index].owner(), "Test message delivered");
            return Ok((index, delivery));
        }
    }
}

/// Watches `other` for the settle delay. Receiving the test message there
/// means both instances hold it.
async fn watch_exclusive(
    ctx: &ScenarioContext,
    other: &mut Listener<'_>,
) -> Result<(), ScenarioError> {
    let settle = tokio::time::sleep(SETTLE_DELAY);
    tokio::pin!(settle);

    loop {
        let wake = ctx
            .within(async {
                tokio::select! {
                    event = other.rx.recv() => Wake::Event(event),
                    () = &mut settle => Wake::Settled,
                }
            })
            .await?;

        match wake {
            Wake::Settled => return Ok(()),
            Wake::Event(event) => {
                if let Some(duplicate) = other.inbox.accept(event)? {
                    warn!(owner = other.owner(), "Message delivered while still held");
                    ctx.discard(&duplicate).await;
                    return Err(ScenarioError::Assertion(format!(
                        "message '{}' held by both listeners at once ('{}' received it during the hold)",
                        PAYLOAD,
                        other.owner()
                    )));
                }
            }
        }
    }
}
