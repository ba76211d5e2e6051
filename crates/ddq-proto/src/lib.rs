//! # ddq-proto
//!
//! The backend plugin contract that every DDQ queue implementation satisfies.
//!
//! This crate defines:
//! - The [`QueueBackend`] trait driven by the conformance scenarios
//! - [`BackendConfig`], the value-typed configuration handed to each instance
//! - [`Delivery`], the wrapper around a claimed message with its lease operations
//! - [`BackendEvent`] and [`EventReceiver`], the typed notification channel
//! - [`DiagnosticAttribute`], the attributes a backend exposes while polling

mod backend;
mod config;
mod delivery;
mod diagnostics;
mod error;

pub use backend::{BackendFactory, QueueBackend};
pub use config::BackendConfig;
pub use delivery::{BackendEvent, Delivery, DeliveryHandle, EventReceiver, EventSender, event_channel};
pub use diagnostics::DiagnosticAttribute;
pub use error::{BackendError, BackendResult};
