//! Conformance scenarios for DDQ backend plugins.
//!
//! Each scenario drives one or two freshly created backend instances through
//! connect, listen, message handling and disconnect, and fails with a
//! [`ScenarioError`] naming the part of the contract the backend broke.
//!
//! Scenarios never rely on FIFO ordering: they pick out their own message by
//! payload and tolerate a bounded number of foreign notifications.

mod dedup;
mod multi_listener;
mod polling;
mod wrapped;

pub use dedup::{DedupScenario, DedupViolation};
pub use multi_listener::{MultiListenerScenario, SETTLE_DELAY};
pub use polling::PollingScenario;
pub use wrapped::{WrappedMessageScenario, WrappedStage};

use crate::models::{Failure, FailureKind};
use async_trait::async_trait;
use ddq_proto::{
    BackendConfig, BackendError, BackendEvent, BackendFactory, BackendResult, Delivery,
    EventReceiver, QueueBackend,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Foreign notifications tolerated while waiting for a scenario's own message.
pub const FOREIGN_MESSAGE_LIMIT: usize = 5;

/// Polling intervals a requeued message may take to be delivered again.
pub const REQUEUE_POLLS: u32 = 3;

/// A backend operation other than connect or send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartListening,
    StopListening,
    Requeue,
    Heartbeat,
    Remove,
    /// An event received on the notification channel.
    Notification,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::StartListening => "start listening",
            Operation::StopListening => "stop listening",
            Operation::Requeue => "requeue",
            Operation::Heartbeat => "heartbeat",
            Operation::Remove => "remove",
            Operation::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Errors that fail a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("connection failed: {0}")]
    Connection(#[source] BackendError),

    #[error("send failed: {0}")]
    Send(#[source] BackendError),

    #[error("{op} failed: {source}")]
    Operation {
        op: Operation,
        #[source]
        source: BackendError,
    },

    #[error("{0}")]
    Assertion(String),

    #[error("{0}")]
    Dedup(#[from] DedupViolation),

    #[error("run deadline of {0:?} reached")]
    Timeout(Duration),

    #[error("[{stage}] {source}")]
    Staged {
        stage: String,
        #[source]
        source: Box<ScenarioError>,
    },
}

impl ScenarioError {
    pub fn operation(op: Operation, source: BackendError) -> Self {
        ScenarioError::Operation { op, source }
    }

    /// Attributes this error to a named stage of a scenario.
    pub fn during(self, stage: impl fmt::Display) -> Self {
        ScenarioError::Staged {
            stage: stage.to_string(),
            source: Box::new(self),
        }
    }

    /// The failure category, looking through stage attribution.
    pub fn kind(&self) -> FailureKind {
        match self {
            ScenarioError::Connection(_) => FailureKind::Connection,
            ScenarioError::Send(_) => FailureKind::Send,
            ScenarioError::Operation { .. } => FailureKind::Operation,
            ScenarioError::Assertion(_) | ScenarioError::Dedup(_) => FailureKind::Assertion,
            ScenarioError::Timeout(_) => FailureKind::Timeout,
            ScenarioError::Staged { source, .. } => source.kind(),
        }
    }

    /// Returns true if the run deadline caused this error.
    pub fn is_timeout(&self) -> bool {
        self.kind() == FailureKind::Timeout
    }

    pub fn to_failure(&self) -> Failure {
        Failure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// A self-contained conformance test.
#[async_trait]
pub trait TestScenario: Send + Sync {
    /// Stable identifier, used for filtering.
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    /// Runs the scenario, tearing down every instance it created.
    async fn run(&self, ctx: &ScenarioContext) -> Result<(), ScenarioError>;
}

/// Every scenario in run order.
pub fn all_scenarios() -> Vec<Box<dyn TestScenario>> {
    vec![
        Box::new(PollingScenario::new()),
        Box::new(MultiListenerScenario::new()),
        Box::new(WrappedMessageScenario::new()),
        Box::new(DedupScenario::new()),
    ]
}

/// What a scenario needs to create instances and honour the run deadline.
#[derive(Clone)]
pub struct ScenarioContext {
    factory: Arc<dyn BackendFactory>,
    config: BackendConfig,
    deadline: Instant,
    timeout: Duration,
}

impl ScenarioContext {
    /// Creates a context whose deadline is `timeout` from now.
    pub fn new(factory: Arc<dyn BackendFactory>, config: BackendConfig, timeout: Duration) -> Self {
        Self {
            factory,
            config,
            deadline: Instant::now() + timeout,
            timeout,
        }
    }

    /// The base configuration instances are copied from.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Creates an instance with the base owner.
    pub fn instance(&self) -> Result<Arc<dyn QueueBackend>, ScenarioError> {
        self.instance_as(&self.config.owner)
    }

    /// Creates an instance from a private copy of the config bound to `owner`.
    pub fn instance_as(&self, owner: &str) -> Result<Arc<dyn QueueBackend>, ScenarioError> {
        self.factory
            .create(self.config.with_owner(owner))
            .map_err(ScenarioError::Connection)
    }

    /// Awaits `fut`, failing with [`ScenarioError::Timeout`] at the run deadline.
    pub async fn within<F: Future>(&self, fut: F) -> Result<F::Output, ScenarioError> {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| ScenarioError::Timeout(self.timeout))
    }

    /// Connects `backend` within the deadline.
    pub async fn connect(&self, backend: &dyn QueueBackend) -> Result<(), ScenarioError> {
        self.within(backend.connect())
            .await?
            .map_err(ScenarioError::Connection)
    }

    pub async fn start_listening(&self, backend: &dyn QueueBackend) -> Result<(), ScenarioError> {
        self.within(backend.start_listening())
            .await?
            .map_err(|e| ScenarioError::operation(Operation::StartListening, e))
    }

    pub async fn stop_listening(&self, backend: &dyn QueueBackend) -> Result<(), ScenarioError> {
        self.within(backend.stop_listening())
            .await?
            .map_err(|e| ScenarioError::operation(Operation::StopListening, e))
    }

    pub async fn requeue(&self, delivery: &Delivery) -> Result<(), ScenarioError> {
        self.lease_op(Operation::Requeue, delivery.requeue()).await
    }

    pub async fn heartbeat(&self, delivery: &Delivery) -> Result<(), ScenarioError> {
        self.lease_op(Operation::Heartbeat, delivery.heartbeat()).await
    }

    pub async fn remove(&self, delivery: &Delivery) -> Result<(), ScenarioError> {
        self.lease_op(Operation::Remove, delivery.remove()).await
    }

    /// Removes a delivery while another failure is being reported. A failed
    /// removal is only logged.
    pub async fn discard(&self, delivery: &Delivery) {
        if let Err(e) = self.remove(delivery).await {
            debug!(payload = delivery.message(), error = %e, "Could not discard delivery");
        }
    }

    async fn lease_op<F>(&self, op: Operation, fut: F) -> Result<(), ScenarioError>
    where
        F: Future<Output = BackendResult<()>>,
    {
        self.within(fut)
            .await?
            .map_err(|e| ScenarioError::operation(op, e))?;
        debug!(%op, "Lease operation completed");
        Ok(())
    }

    /// Waits for a delivery of `payload`, skipping foreign messages.
    ///
    /// Fails once more than [`FOREIGN_MESSAGE_LIMIT`] foreign messages were
    /// seen, when the backend reports an error, or at the run deadline.
    pub async fn receive_matching(
        &self,
        rx: &mut EventReceiver,
        payload: &str,
    ) -> Result<Delivery, ScenarioError> {
        let mut inbox = Inbox::new(payload);
        loop {
            let event = self.within(rx.recv()).await?;
            if let Some(delivery) = inbox.accept(event)? {
                return Ok(delivery);
            }
        }
    }

    /// Like [`receive_matching`](Self::receive_matching) but gives up after
    /// `window`, returning `None`.
    pub async fn receive_within(
        &self,
        rx: &mut EventReceiver,
        payload: &str,
        window: Duration,
    ) -> Result<Option<Delivery>, ScenarioError> {
        match tokio::time::timeout(window, self.receive_matching(rx, payload)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// How long a message requeued now may take to come back.
    ///
    /// A few polling intervals, capped at three quarters of what remains of
    /// the lease taken when the message was received at `received_at`. A
    /// redelivery after that could be lease expiry rather than the requeue.
    pub fn requeue_window(&self, received_at: Instant) -> Duration {
        let lease_left = (received_at + self.config.heartbeat_lifetime())
            .saturating_duration_since(Instant::now());
        (self.config.polling_delay() * REQUEUE_POLLS).min(lease_left * 3 / 4)
    }

    /// Waits for a requeued `payload`, failing if it does not come back
    /// within `window`.
    pub async fn receive_requeued(
        &self,
        rx: &mut EventReceiver,
        payload: &str,
        window: Duration,
    ) -> Result<Delivery, ScenarioError> {
        self.receive_within(rx, payload, window)
            .await?
            .ok_or_else(|| not_redelivered(payload, window))
    }

    /// Starts listening, waits for `payload`, then stops listening again.
    pub async fn receive_once(
        &self,
        backend: &dyn QueueBackend,
        rx: &mut EventReceiver,
        payload: &str,
    ) -> Result<Delivery, ScenarioError> {
        self.start_listening(backend).await?;
        let received = self.receive_matching(rx, payload).await;
        self.stop_listening(backend).await?;
        received
    }
}

pub(crate) fn not_redelivered(payload: &str, window: Duration) -> ScenarioError {
    ScenarioError::Assertion(format!(
        "requeued message '{}' not redelivered within {:?}, before its lease expired",
        payload, window
    ))
}

/// Classifies notifications while a scenario waits for one payload.
pub(crate) struct Inbox<'a> {
    payload: &'a str,
    foreign: usize,
}

impl<'a> Inbox<'a> {
    pub(crate) fn new(payload: &'a str) -> Self {
        Self {
            payload,
            foreign: 0,
        }
    }

    /// Returns the delivery if `event` carries the awaited payload.
    pub(crate) fn accept(
        &mut self,
        event: Option<BackendEvent>,
    ) -> Result<Option<Delivery>, ScenarioError> {
        match event {
            None => Err(ScenarioError::operation(
                Operation::Notification,
                BackendError::ChannelClosed,
            )),
            Some(BackendEvent::Error(e)) => {
                Err(ScenarioError::operation(Operation::Notification, e))
            }
            Some(BackendEvent::Data(delivery)) if delivery.message() == self.payload => {
                debug!(payload = self.payload, "Received test message");
                Ok(Some(delivery))
            }
            Some(BackendEvent::Data(delivery)) => {
                self.foreign += 1;
                warn!(
                    expected = self.payload,
                    received = delivery.message(),
                    count = self.foreign,
                    "Ignoring foreign message"
                );
                if self.foreign > FOREIGN_MESSAGE_LIMIT {
                    Err(ScenarioError::Assertion(format!(
                        "test message '{}' not found after {} foreign deliveries",
                        self.payload, self.foreign
                    )))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// Clears listeners, stops listening and disconnects.
///
/// Every step runs even if an earlier one fails; the first error is returned.
pub(crate) async fn teardown(backend: &dyn QueueBackend) -> Result<(), ScenarioError> {
    backend.clear_listeners();
    let stopped = backend
        .stop_listening()
        .await
        .map_err(|e| ScenarioError::operation(Operation::StopListening, e));
    let disconnected = backend.disconnect().await.map_err(ScenarioError::Connection);
    stopped.and(disconnected)
}
