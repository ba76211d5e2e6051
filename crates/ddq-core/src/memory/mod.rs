//! In-memory reference backend.
//!
//! Implements the full plugin contract on top of a process-local table so
//! the scenarios can run without an external database. Instances created by
//! the same [`MemoryBackendFactory`] share their tables and compete for
//! messages exactly like separate processes sharing one MySQL queue.

mod backend;
mod faults;
mod store;

pub use backend::{MemoryBackend, MemoryBackendFactory};
pub use faults::Faults;
pub use store::{ClaimedRow, MemoryStore, QueueTable, RowState};
