//! Shared in-memory queue tables.
//!
//! Every [`QueueTable`] plays the role of one `database.table` in a real
//! backend: all instances bound to the same key compete for the same rows.

use super::faults::Faults;
use ddq_proto::BackendError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lease state of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowState {
    Available,
    Delivered {
        owner: String,
        lease_expires_at: Instant,
    },
}

#[derive(Debug, Clone)]
struct Row {
    payload: String,
    topic: String,
    state: RowState,
    /// Incremented on every claim so stale deliveries lose their lease.
    lease: u64,
    /// Set when a duplicate send was absorbed while this row was pending.
    requeue_pending: bool,
}

/// A message claimed by a poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRow {
    pub id: u64,
    pub lease: u64,
    pub payload: String,
    pub topic: String,
}

/// Outcome of a claim attempt.
#[derive(Debug)]
pub(crate) enum ClaimOutcome {
    Claimed(Vec<ClaimedRow>),
    /// The table stayed locked for every allowed attempt.
    Contended,
}

/// One queue table shared by all instances bound to it.
#[derive(Debug, Default)]
pub struct QueueTable {
    rows: Mutex<BTreeMap<u64, Row>>,
    next_id: AtomicU64,
}

impl QueueTable {
    /// Number of rows currently stored.
    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rows holding the given payload.
    pub fn count_payload(&self, payload: &str) -> usize {
        lock(&self.rows)
            .values()
            .filter(|row| row.payload == payload)
            .count()
    }

    /// Lease states of all rows holding the given payload.
    pub fn states_of(&self, payload: &str) -> Vec<RowState> {
        lock(&self.rows)
            .values()
            .filter(|row| row.payload == payload)
            .map(|row| row.state.clone())
            .collect()
    }

    /// Stores a new message, refusing structurally identical pending ones.
    ///
    /// A refused duplicate marks the pending row so that removing it makes
    /// the message available once more.
    pub(crate) fn insert(&self, payload: &str, topic: &str, faults: Faults) -> Result<u64, BackendError> {
        let mut rows = lock(&self.rows);

        if !faults.accept_duplicates {
            if let Some(existing) = rows
                .values_mut()
                .find(|row| row.payload == payload && row.topic == topic)
            {
                existing.requeue_pending = true;
                return Err(BackendError::Duplicate {
                    topic: topic.to_string(),
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        rows.insert(
            id,
            Row {
                payload: payload.to_string(),
                topic: topic.to_string(),
                state: RowState::Available,
                lease: 0,
                requeue_pending: false,
            },
        );
        Ok(id)
    }

    /// Leases up to `limit` available rows on `topic` to `owner`.
    ///
    /// Uses non-blocking lock attempts, giving up after `attempts` tries.
    pub(crate) async fn claim(
        &self,
        owner: &str,
        topic: &str,
        lease: Duration,
        limit: usize,
        attempts: u32,
        faults: Faults,
    ) -> ClaimOutcome {
        for _ in 0..attempts {
            let claimed = if faults.deadlocked {
                None
            } else {
                self.try_claim(owner, topic, lease, limit, faults)
            };
            if let Some(claimed) = claimed {
                return ClaimOutcome::Claimed(claimed);
            }
            tokio::task::yield_now().await;
        }

        ClaimOutcome::Contended
    }

    fn try_claim(
        &self,
        owner: &str,
        topic: &str,
        lease: Duration,
        limit: usize,
        faults: Faults,
    ) -> Option<Vec<ClaimedRow>> {
        let mut rows = match self.rows.try_lock() {
            Ok(rows) => rows,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (id, row) in rows.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if row.topic != topic {
                continue;
            }
            let claimable = match &row.state {
                RowState::Available => true,
                RowState::Delivered { owner: holder, .. } => {
                    faults.shared_delivery && holder != owner
                }
            };
            if !claimable {
                continue;
            }

            row.state = RowState::Delivered {
                owner: owner.to_string(),
                lease_expires_at: now + faults.lease_for(lease),
            };
            row.lease += 1;
            claimed.push(ClaimedRow {
                id: *id,
                lease: row.lease,
                payload: row.payload.clone(),
                topic: row.topic.clone(),
            });
        }
        Some(claimed)
    }

    /// Returns a leased row to the available pool.
    pub(crate) fn requeue(
        &self,
        id: u64,
        lease: u64,
        owner: &str,
        faults: Faults,
    ) -> Result<(), BackendError> {
        let mut rows = lock(&self.rows);
        let row = Self::held_by(&mut rows, id, lease, owner)?;
        if !faults.noop_requeue {
            row.state = RowState::Available;
        }
        Ok(())
    }

    /// Leases a held row to the same owner again under a new generation.
    pub(crate) fn reclaim(
        &self,
        id: u64,
        lease: u64,
        owner: &str,
        lifetime: Duration,
        faults: Faults,
    ) -> Result<ClaimedRow, BackendError> {
        let mut rows = lock(&self.rows);
        let row = Self::held_by(&mut rows, id, lease, owner)?;
        row.state = RowState::Delivered {
            owner: owner.to_string(),
            lease_expires_at: Instant::now() + faults.lease_for(lifetime),
        };
        row.lease += 1;
        Ok(ClaimedRow {
            id,
            lease: row.lease,
            payload: row.payload.clone(),
            topic: row.topic.clone(),
        })
    }

    /// Renews the lease on a row held by `owner`.
    pub(crate) fn heartbeat(
        &self,
        id: u64,
        lease: u64,
        owner: &str,
        lifetime: Duration,
        faults: Faults,
    ) -> Result<(), BackendError> {
        let mut rows = lock(&self.rows);
        let row = Self::held_by(&mut rows, id, lease, owner)?;
        row.state = RowState::Delivered {
            owner: owner.to_string(),
            lease_expires_at: Instant::now() + faults.lease_for(lifetime),
        };
        Ok(())
    }

    /// Removes a row held by `owner`, or releases it once more if a
    /// duplicate send was absorbed while it was pending.
    pub(crate) fn remove(
        &self,
        id: u64,
        lease: u64,
        owner: &str,
        faults: Faults,
    ) -> Result<(), BackendError> {
        let mut rows = lock(&self.rows);
        let row = Self::held_by(&mut rows, id, lease, owner)?;

        if row.requeue_pending && !faults.skip_compensating_redelivery {
            if !faults.repeat_compensating_redelivery {
                row.requeue_pending = false;
            }
            row.state = RowState::Available;
            return Ok(());
        }

        rows.remove(&id);
        Ok(())
    }

    /// Releases every lease that expired before `now`. Returns the count.
    pub(crate) fn restore_expired(&self, now: Instant) -> usize {
        let mut rows = lock(&self.rows);
        let mut restored = 0;
        for row in rows.values_mut() {
            if let RowState::Delivered {
                lease_expires_at, ..
            } = row.state
            {
                if lease_expires_at <= now {
                    row.state = RowState::Available;
                    restored += 1;
                }
            }
        }
        restored
    }

    fn held_by<'a>(
        rows: &'a mut BTreeMap<u64, Row>,
        id: u64,
        lease: u64,
        owner: &str,
    ) -> Result<&'a mut Row, BackendError> {
        let lost = || BackendError::LeaseLost {
            id,
            owner: owner.to_string(),
        };
        let row = rows.get_mut(&id).ok_or_else(lost)?;
        let held = matches!(
            &row.state,
            RowState::Delivered { owner: holder, .. } if holder == owner
        ) && row.lease == lease;
        if held { Ok(row) } else { Err(lost()) }
    }
}

/// A set of queue tables keyed by `database.table`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Arc<QueueTable>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table for `key`, creating it on first use.
    pub fn table(&self, key: &str) -> Arc<QueueTable> {
        lock(&self.tables)
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}
