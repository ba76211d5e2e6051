//! # ddq-core
//!
//! Supporting pieces for running the DDQ backend scenarios:
//! - [`memory`]: an in-memory reference backend implementing the plugin
//!   contract, with fault injection for proving the scenarios catch violations
//! - [`config`]: the harness configuration file

pub mod config;
pub mod memory;

pub use config::{ConfigError, DEFAULT_TIMEOUT_MS, HarnessConfig};
pub use memory::{Faults, MemoryBackend, MemoryBackendFactory};
