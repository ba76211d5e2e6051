//! Error types for backend operations.

use thiserror::Error;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors a backend reports from its operations or its error channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The operation needs an open connection.
    #[error("backend is not connected")]
    NotConnected,

    /// Connecting or disconnecting failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// An equivalent message is already pending.
    #[error("duplicate message for topic '{topic}'")]
    Duplicate {
        /// Topic of the rejected message.
        topic: String,
    },

    /// The caller no longer holds the lease on the delivered message.
    #[error("lease on message {id} is no longer held by '{owner}'")]
    LeaseLost {
        /// Backend identifier of the message.
        id: u64,
        /// Owner that attempted the operation.
        owner: String,
    },

    /// The notification channel has been closed.
    #[error("notification channel closed")]
    ChannelClosed,

    /// Configuration rejected by the backend.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other backend-specific failure.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Returns true if this error is the expected rejection of a duplicate send.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, BackendError::Duplicate { .. })
    }
}
