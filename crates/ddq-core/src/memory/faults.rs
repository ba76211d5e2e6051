//! Contract violations the in-memory backend can be told to commit.
//!
//! A conformance harness is only trustworthy if it notices a broken backend.
//! Each switch breaks exactly one part of the contract so tests can check
//! that the matching scenario fails.

use std::time::Duration;

/// Fault injection switches. All are off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Store duplicate sends as a second deliverable row.
    pub accept_duplicates: bool,
    /// Delete a removed row even if a duplicate was absorbed while pending.
    pub skip_compensating_redelivery: bool,
    /// Keep the pending requeue after the compensating redelivery, so every
    /// remove releases the row again.
    pub repeat_compensating_redelivery: bool,
    /// Grant leases for half of the configured lifetime.
    pub premature_expiry: bool,
    /// Let a poller claim rows already leased to another owner.
    pub shared_delivery: bool,
    /// Keep diagnostic flags set after listening stops.
    pub leak_diagnostics: bool,
    /// Acknowledge a requeue without releasing the lease.
    pub noop_requeue: bool,
    /// Hand a requeued message straight back to the instance that held it,
    /// whether or not it is still listening.
    pub requeue_to_holder: bool,
    /// Treat every claim attempt as blocked by a lock held elsewhere.
    pub deadlocked: bool,
}

impl Faults {
    /// No faults: a conforming backend.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns true if any fault is enabled.
    pub fn any(&self) -> bool {
        self.accept_duplicates
            || self.skip_compensating_redelivery
            || self.repeat_compensating_redelivery
            || self.premature_expiry
            || self.shared_delivery
            || self.leak_diagnostics
            || self.noop_requeue
            || self.requeue_to_holder
            || self.deadlocked
    }

    /// Lease length actually granted for a configured lifetime.
    pub(crate) fn lease_for(&self, lifetime: Duration) -> Duration {
        if self.premature_expiry {
            lifetime / 2
        } else {
            lifetime
        }
    }
}
