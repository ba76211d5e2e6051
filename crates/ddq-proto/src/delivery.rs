//! Delivered messages and the notification channel.
//!
//! A backend claims a message, leases it to its owner and emits exactly one
//! [`BackendEvent::Data`] carrying a [`Delivery`]. The consumer then settles
//! the lease through the delivery: requeue it, extend it with a heartbeat, or
//! remove the message for good.

use crate::error::{BackendError, BackendResult};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lease operations a backend implements for one delivered message.
#[async_trait]
pub trait DeliveryHandle: Send + Sync {
    /// Returns the message to the available pool before the lease expires.
    async fn requeue(&self) -> BackendResult<()>;

    /// Renews the lease for another lifetime.
    async fn heartbeat(&self) -> BackendResult<()>;

    /// Removes the message permanently.
    async fn remove(&self) -> BackendResult<()>;
}

/// A message claimed by one backend instance.
#[derive(Clone)]
pub struct Delivery {
    message: String,
    topic: String,
    handle: Arc<dyn DeliveryHandle>,
}

impl Delivery {
    /// Wraps a claimed message together with its lease operations.
    pub fn new(
        message: impl Into<String>,
        topic: impl Into<String>,
        handle: Arc<dyn DeliveryHandle>,
    ) -> Self {
        Self {
            message: message.into(),
            topic: topic.into(),
            handle,
        }
    }

    /// The message payload.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The topic the message was sent to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn requeue(&self) -> BackendResult<()> {
        self.handle.requeue().await
    }

    pub async fn heartbeat(&self) -> BackendResult<()> {
        self.handle.heartbeat().await
    }

    pub async fn remove(&self) -> BackendResult<()> {
        self.handle.remove().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// A notification emitted by a listening backend.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A message was claimed for this instance.
    Data(Delivery),
    /// An asynchronous backend failure.
    Error(BackendError),
}

/// Sending half of a backend's notification channel.
pub type EventSender = mpsc::UnboundedSender<BackendEvent>;

/// Receiving half of a backend's notification channel.
pub type EventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

/// Creates a notification channel.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
