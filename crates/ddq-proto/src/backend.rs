//! The backend plugin trait and its factory.

use crate::config::BackendConfig;
use crate::delivery::EventReceiver;
use crate::diagnostics::DiagnosticAttribute;
use crate::error::BackendResult;
use async_trait::async_trait;
use std::sync::Arc;

/// A queue backend plugin instance.
///
/// An instance is bound to one queue, topic and owner through its
/// [`BackendConfig`]. It moves between `Disconnected` and `Connected`, and
/// while connected between `Idle` and `Polling`. Claimed messages arrive on
/// the receiver returned by [`QueueBackend::subscribe`].
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Opens the connection to the queue store.
    async fn connect(&self) -> BackendResult<()>;

    /// Closes the connection, stopping any active polling first.
    async fn disconnect(&self) -> BackendResult<()>;

    /// Starts the poller and the lease restorer.
    async fn start_listening(&self) -> BackendResult<()>;

    /// Stops the poller and the lease restorer.
    async fn stop_listening(&self) -> BackendResult<()>;

    /// Enqueues a message on a topic.
    async fn send_message(&self, payload: &str, topic: &str) -> BackendResult<()>;

    /// Installs a fresh notification channel and returns its receiver.
    ///
    /// Any receiver handed out earlier is closed.
    fn subscribe(&self) -> EventReceiver;

    /// Drops the notification channel so no further events are emitted.
    fn clear_listeners(&self);

    /// Returns true if the given diagnostic attribute is currently exposed.
    fn has_diagnostic(&self, attribute: DiagnosticAttribute) -> bool;

    /// The configuration this instance was built from.
    fn config(&self) -> &BackendConfig;
}

/// Builds backend instances from configuration.
///
/// Each call receives its own configuration value and must return an
/// independent instance.
pub trait BackendFactory: Send + Sync {
    fn create(&self, config: BackendConfig) -> BackendResult<Arc<dyn QueueBackend>>;
}

impl<F> BackendFactory for F
where
    F: Fn(BackendConfig) -> BackendResult<Arc<dyn QueueBackend>> + Send + Sync,
{
    fn create(&self, config: BackendConfig) -> BackendResult<Arc<dyn QueueBackend>> {
        self(config)
    }
}
