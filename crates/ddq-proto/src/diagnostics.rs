//! Diagnostic attributes exposed by a backend while it is polling.

use std::fmt;

/// An attribute a backend exposes only while listening.
///
/// A conforming backend reports every attribute as present between
/// `start_listening` and `stop_listening`, and none of them otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticAttribute {
    /// Flag set while the poll loop is active.
    CurrentlyPolling,
    /// Flag set while the lease restorer is active.
    CurrentlyRestoring,
    /// Handle of the running poller.
    Poller,
    /// Handle of the running restorer.
    Restorer,
}

impl DiagnosticAttribute {
    /// Every attribute, in the order the polling scenario checks them.
    pub const ALL: [DiagnosticAttribute; 4] = [
        DiagnosticAttribute::CurrentlyPolling,
        DiagnosticAttribute::CurrentlyRestoring,
        DiagnosticAttribute::Poller,
        DiagnosticAttribute::Restorer,
    ];

    /// Returns the attribute name as backends conventionally expose it.
    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticAttribute::CurrentlyPolling => "currentlyPolling",
            DiagnosticAttribute::CurrentlyRestoring => "currentlyRestoring",
            DiagnosticAttribute::Poller => "poller",
            DiagnosticAttribute::Restorer => "restorer",
        }
    }
}

impl fmt::Display for DiagnosticAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
